//! 控制器模块
//!
//! 该模块把 Project 协调器接入 kube-runtime 控制循环。每次协调在 Project 的副本上
//! 进行，结束后把 finalizer 与状态的变化写回 API Server。

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{
    api::{Api, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller as KubeController},
        watcher,
    },
    ResourceExt,
};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::children::KubeChildren;
use crate::config::OperatorConfig;
use crate::crd::{Project, PROJECT_FINALIZER};
use crate::error::{Error, Result};
use crate::reconcile::{Outcome, Reconciler};
use crate::store::KubeStore;

/// 控制循环共享的上下文
pub struct Context {
    /// Kubernetes 客户端
    pub client: Client,
    /// Operator 配置
    pub config: OperatorConfig,
    /// 协调器
    pub reconciler: Reconciler<KubeStore, KubeChildren>,
}

/// Project 控制器
pub struct Controller {
    context: Arc<Context>,
}

impl Controller {
    /// 创建新的控制器
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let reconciler = Reconciler::new(
            KubeStore::new(client.clone()),
            KubeChildren::new(client.clone(), config.clone()),
        );

        Self {
            context: Arc::new(Context {
                client,
                config,
                reconciler,
            }),
        }
    }

    /// 运行控制循环，直到收到退出信号
    pub async fn run(self) {
        let projects: Api<Project> = Api::all(self.context.client.clone());

        info!("启动 Project 控制器");
        KubeController::new(projects, watcher::Config::default().any_semantic())
            .shutdown_on_signal()
            .run(reconcile, error_policy, self.context)
            .for_each(|result| async move {
                match result {
                    Ok((project, action)) => debug!("协调成功: {} {:?}", project.name, action),
                    Err(e) => debug!("协调错误: {}", e),
                }
            })
            .await;
        info!("Project 控制器已停止");
    }
}

/// 协调一次 Project 并写回变化
async fn reconcile(project: Arc<Project>, ctx: Arc<Context>) -> Result<Action> {
    let deadline = Instant::now() + ctx.config.reconcile_timeout();
    let mut working = (*project).clone();

    let result = ctx.reconciler.reconcile(&mut working, deadline).await;
    persist(&ctx.client, &project, &working).await?;

    Ok(to_action(result?))
}

/// 协调失败时记录错误并延迟重试
fn error_policy(project: Arc<Project>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(
        "协调 Project {}/{} 失败: {}",
        project.namespace().unwrap_or_default(),
        project.name_any(),
        error
    );
    Action::requeue(ctx.config.error_requeue())
}

fn to_action(outcome: Outcome) -> Action {
    match outcome {
        Outcome::Requeue => Action::requeue(Duration::ZERO),
        Outcome::RequeueAfter(after) if after.is_zero() => Action::await_change(),
        Outcome::RequeueAfter(after) => Action::requeue(after),
        Outcome::Done => Action::await_change(),
    }
}

/// 写回 finalizer 与状态的变化
async fn persist(client: &Client, before: &Project, after: &Project) -> Result<()> {
    let namespace = after
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = after.name_any();
    let api: Api<Project> = Api::namespaced(client.clone(), &namespace);

    if before.finalizers() != after.finalizers() {
        let patch = finalizer_patch(after);
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!("已更新 {}/{} 的 finalizer", namespace, name);

        if finalizer_released(after) {
            return Ok(());
        }
    }

    if before.status != after.status {
        let patch = json!({ "status": after.status });
        if let Err(e) = api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            error!("更新 {}/{} 的状态失败: {}", namespace, name, e);
            return Err(e.into());
        }
    }

    Ok(())
}

/// finalizer 的合并补丁，不携带 resourceVersion
fn finalizer_patch(project: &Project) -> serde_json::Value {
    json!({ "metadata": { "finalizers": project.finalizers() } })
}

/// 删除中的 Project 已移除 finalizer，对象随后会被 API Server 删除
fn finalizer_released(project: &Project) -> bool {
    project.metadata.deletion_timestamp.is_some()
        && !project.finalizers().iter().any(|f| f == PROJECT_FINALIZER)
}
