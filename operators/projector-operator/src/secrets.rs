//! 镜像拉取密钥同步模块
//!
//! 该模块按命名空间协调项目服务账号的 `imagePullSecrets`。项目命名空间中带有
//! `mpas.ocm.system/secret.dockerconfig` 注解的 Secret 会被加入列表，
//! 注解被移除或 Secret 被删除时从列表中移除。Secret 的变化会触发所在命名空间的
//! 协调，每次协调都以命名空间中当前的 Secret 为准。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{LocalObjectReference, Namespace, Secret, ServiceAccount};
use kube::{
    api::{Api, ListParams, PostParams},
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        reflector::ObjectRef,
        watcher,
    },
    Client, Resource, ResourceExt,
};
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::crd::{Project, PROJECT_KEY};
use crate::error::{Error, Result};

/// 标记需要加入 imagePullSecrets 的 Secret
pub const SECRET_ANNOTATION: &str = "mpas.ocm.system/secret.dockerconfig";

pub const PULL_SECRET_ADDED_REASON: &str = "ImagePullSecretAdded";
pub const PULL_SECRET_REMOVED_REASON: &str = "ImagePullSecretRemoved";

const CONTROLLER_NAME: &str = "projector-secrets";

/// imagePullSecrets 的变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullSecretChange {
    Added,
    Removed,
    Unchanged,
}

impl PullSecretChange {
    /// 记录事件使用的原因，无变化时为 None
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            PullSecretChange::Added => Some(PULL_SECRET_ADDED_REASON),
            PullSecretChange::Removed => Some(PULL_SECRET_REMOVED_REASON),
            PullSecretChange::Unchanged => None,
        }
    }
}

/// 使 `name` 在列表中的存在与否与 `desired` 一致
pub fn reconcile_pull_secrets(
    secrets: &mut Vec<LocalObjectReference>,
    name: &str,
    desired: bool,
) -> PullSecretChange {
    let position = secrets.iter().position(|s| s.name.as_deref() == Some(name));
    match (position, desired) {
        (None, true) => {
            secrets.push(LocalObjectReference {
                name: Some(name.to_string()),
            });
            PullSecretChange::Added
        }
        (Some(i), false) => {
            secrets.remove(i);
            PullSecretChange::Removed
        }
        _ => PullSecretChange::Unchanged,
    }
}

/// Secret 是否应出现在 imagePullSecrets 中
pub fn wants_pull_secret(secret: &Secret) -> bool {
    secret.metadata.deletion_timestamp.is_none() && secret.annotations().contains_key(SECRET_ANNOTATION)
}

/// 按命名空间中的 Secret 更新 imagePullSecrets，返回每个发生变化的名称
///
/// 带注解且未删除的 Secret 会被加入；列表中对应 Secret 已不存在或不再带注解的
/// 名称会被移除；其余条目保持不变。
pub fn plan_pull_secrets(
    pull_secrets: &mut Vec<LocalObjectReference>,
    secrets: &[Secret],
) -> Vec<(String, PullSecretChange)> {
    let desired: BTreeMap<String, bool> = secrets
        .iter()
        .map(|s| (s.name_any(), wants_pull_secret(s)))
        .collect();

    let listed: Vec<String> = pull_secrets.iter().filter_map(|s| s.name.clone()).collect();
    let mut changes = Vec::new();

    for name in listed {
        if desired.get(&name).copied().unwrap_or(false) {
            continue;
        }
        let change = reconcile_pull_secrets(pull_secrets, &name, false);
        if change != PullSecretChange::Unchanged {
            changes.push((name, change));
        }
    }

    for (name, _) in desired.iter().filter(|(_, wanted)| **wanted) {
        let change = reconcile_pull_secrets(pull_secrets, name, true);
        if change != PullSecretChange::Unchanged {
            changes.push((name.clone(), change));
        }
    }

    changes
}

/// 命名空间所属的项目名称
pub fn project_name(namespace: &Namespace) -> Option<&str> {
    namespace.annotations().get(PROJECT_KEY).map(String::as_str)
}

/// 项目尚未就绪时的重试动作，就绪时返回 None
pub fn wait_for_ready(project: &Project, fallback: Duration) -> Result<Option<Action>> {
    if project.is_ready() {
        return Ok(None);
    }
    let after = project.requeue_after()?;
    Ok(Some(Action::requeue(if after.is_zero() { fallback } else { after })))
}

/// 控制循环共享的上下文
struct Context {
    client: Client,
    config: OperatorConfig,
    reporter: Reporter,
}

/// Secret 同步器
pub struct SecretsSync {
    context: Arc<Context>,
}

impl SecretsSync {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            context: Arc::new(Context {
                client,
                config,
                reporter: Reporter {
                    controller: CONTROLLER_NAME.to_string(),
                    instance: std::env::var("POD_NAME").ok(),
                },
            }),
        }
    }

    /// 运行控制循环，直到收到退出信号
    pub async fn run(self) {
        let namespaces: Api<Namespace> = Api::all(self.context.client.clone());
        let secrets: Api<Secret> = Api::all(self.context.client.clone());

        info!("启动 Secret 同步器");
        Controller::new(namespaces, watcher::Config::default())
            .watches(secrets, watcher::Config::default(), |secret: Secret| {
                secret.namespace().map(|ns| ObjectRef::<Namespace>::new(&ns))
            })
            .shutdown_on_signal()
            .run(sync, error_policy, self.context)
            .for_each(|result| async move {
                match result {
                    Ok((namespace, action)) => debug!("同步成功: {} {:?}", namespace.name, action),
                    Err(e) => debug!("同步错误: {}", e),
                }
            })
            .await;
        warn!("Secret 同步器已退出");
    }
}

/// 同步一个项目命名空间中的 Secret 到项目服务账号
async fn sync(namespace: Arc<Namespace>, ctx: Arc<Context>) -> Result<Action> {
    let ns = namespace.name_any();
    let Some(project_name) = project_name(&namespace) else {
        return Ok(Action::await_change());
    };

    let projects: Api<Project> = Api::namespaced(ctx.client.clone(), &ctx.config.default_namespace);
    let Some(project) = projects.get_opt(project_name).await? else {
        debug!("命名空间 {} 所属的项目 {} 不存在", ns, project_name);
        return Ok(Action::await_change());
    };

    if let Some(action) = wait_for_ready(&project, ctx.config.error_requeue())? {
        info!("等待项目 {} 就绪", project_name);
        return Ok(action);
    }

    let account = project.service_account()?;
    let account_namespace = account.namespace.clone().unwrap_or_else(|| ns.clone());
    let accounts: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), &account_namespace);
    let mut service_account = accounts.get(&account.name).await?;

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
    let secrets = secrets.list(&ListParams::default()).await?.items;

    let mut pull_secrets = service_account.image_pull_secrets.take().unwrap_or_default();
    let changes = plan_pull_secrets(&mut pull_secrets, &secrets);
    if changes.is_empty() {
        debug!("服务账号 {} 无需更新", account.name);
        return Ok(Action::await_change());
    }
    service_account.image_pull_secrets = Some(pull_secrets);

    info!("更新服务账号 {}/{}: {:?}", account_namespace, account.name, changes);
    let updated = accounts
        .replace(&account.name, &PostParams::default(), &service_account)
        .await?;

    let recorder = Recorder::new(ctx.client.clone(), ctx.reporter.clone(), updated.object_ref(&()));
    for (name, change) in changes {
        let Some(reason) = change.reason() else {
            continue;
        };
        recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: reason.to_string(),
                note: Some(format!("image pull secret {name}")),
                action: "UpdateServiceAccount".to_string(),
                secondary: None,
            })
            .await?;
    }

    Ok(Action::await_change())
}

/// 同步失败时记录错误并延迟重试
fn error_policy(namespace: Arc<Namespace>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("同步命名空间 {} 的 Secret 失败: {}", namespace.name_any(), error);
    Action::requeue(ctx.config.error_requeue())
}
