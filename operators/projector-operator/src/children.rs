//! 子对象协调模块
//!
//! 该模块负责生成并应用 Project 的子对象。每个阶段返回本次创建或更新的对象句柄，
//! 以及对象在应用前是否已经存在，协调器据此构建新的资源清单。

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, Patch, PatchParams},
    Client, Resource, ResourceExt,
};
use projector_common::ObjectHandle;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::config::OperatorConfig;
use crate::crd::{CommitTemplate, LocalObjectReference, Project, PROJECT_KEY};
use crate::error::StoreError;
use crate::external::{
    Certificate, CertificateSpec, CrossNamespaceSourceReference, GitRepository, GitRepositoryRef,
    GitRepositorySpec, IssuerReference, Kustomization, KustomizationSpec, Repository,
    RepositoryResourceSpec,
};

/// server-side apply 使用的字段管理者
pub const FIELD_MANAGER: &str = "projector-operator";

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// Flux Kustomization 同步的仓库路径
pub const KUSTOMIZATION_PATHS: [&str; 4] = ["subscriptions", "targets", "products", "generators"];

/// 子对象协调阶段，按执行顺序排列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildStage {
    Namespace,
    ServiceAccount,
    Rbac,
    Repository,
    FluxGitRepository,
    FluxKustomizations,
    Certificate,
}

impl ChildStage {
    pub const ALL: [ChildStage; 7] = [
        ChildStage::Namespace,
        ChildStage::ServiceAccount,
        ChildStage::Rbac,
        ChildStage::Repository,
        ChildStage::FluxGitRepository,
        ChildStage::FluxKustomizations,
        ChildStage::Certificate,
    ];

    /// 阶段失败时写入 Ready 条件的原因
    pub fn failure_reason(&self) -> &'static str {
        match self {
            ChildStage::Namespace => "NamespaceCreateOrUpdateFailed",
            ChildStage::ServiceAccount => "ServiceAccountCreateOrUpdateFailed",
            ChildStage::Rbac => "RBACCreateOrUpdateFailed",
            ChildStage::Repository => "RepositoryCreateOrUpdateFailed",
            ChildStage::FluxGitRepository => "FluxGitRepositoryCreateOrUpdateFailed",
            ChildStage::FluxKustomizations => "FluxKustomizationsCreateOrUpdateFailed",
            ChildStage::Certificate => "CertificateCreateOrUpdateFailed",
        }
    }
}

impl fmt::Display for ChildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChildStage::Namespace => "namespace",
            ChildStage::ServiceAccount => "service-account",
            ChildStage::Rbac => "rbac",
            ChildStage::Repository => "repository",
            ChildStage::FluxGitRepository => "flux-git-repository",
            ChildStage::FluxKustomizations => "flux-kustomizations",
            ChildStage::Certificate => "certificate",
        };
        f.write_str(name)
    }
}

/// 已应用的子对象
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChild {
    pub handle: ObjectHandle,
    /// 应用前对象不存在
    pub created: bool,
}

/// 子对象协调器
#[async_trait]
pub trait Children: Send + Sync {
    /// 执行一个阶段，返回该阶段应用的全部对象
    async fn apply(&self, stage: ChildStage, project: &Project) -> Result<Vec<AppliedChild>, StoreError>;
}

/// 基于 Kubernetes API 的子对象协调器
#[derive(Clone)]
pub struct KubeChildren {
    client: Client,
    config: OperatorConfig,
}

impl KubeChildren {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self { client, config }
    }

    /// 通过 server-side apply 创建或更新对象
    async fn apply_object<K>(&self, api: Api<K>, obj: &K) -> Result<AppliedChild, StoreError>
    where
        K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + fmt::Debug,
    {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| StoreError::Other(format!("{} 缺少名称", K::kind(&()))))?;

        let existed = api.get_opt(&name).await?.is_some();
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let applied = api.patch(&name, &params, &Patch::Apply(obj)).await?;
        let handle = ObjectHandle::from_object(&applied).map_err(|e| StoreError::Other(e.to_string()))?;

        debug!("已应用子对象 {} (新建: {})", handle, !existed);
        Ok(AppliedChild {
            handle,
            created: !existed,
        })
    }

    async fn apply_namespaced<K>(&self, namespace: &str, obj: &K) -> Result<AppliedChild, StoreError>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + Serialize
            + DeserializeOwned
            + fmt::Debug,
    {
        self.apply_object(Api::namespaced(self.client.clone(), namespace), obj)
            .await
    }

    /// 确认配置的 ClusterRole 已存在
    async fn verify_cluster_role(&self) -> Result<(), StoreError> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        match api.get_opt(&self.config.cluster_role_name).await? {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound {
                kind: "ClusterRole".to_string(),
                name: self.config.cluster_role_name.clone(),
            }),
        }
    }
}

#[async_trait]
impl Children for KubeChildren {
    async fn apply(&self, stage: ChildStage, project: &Project) -> Result<Vec<AppliedChild>, StoreError> {
        let ns = project.target_namespace(&self.config.prefix);
        let config = &self.config;

        let applied = match stage {
            ChildStage::Namespace => {
                vec![
                    self.apply_object(Api::all(self.client.clone()), &namespace(project, config))
                        .await?,
                ]
            }
            ChildStage::ServiceAccount => {
                vec![self.apply_namespaced(&ns, &service_account(project, config)).await?]
            }
            ChildStage::Rbac => {
                self.verify_cluster_role().await?;
                let mut applied = vec![self.apply_namespaced(&ns, &role(project, config)).await?];
                for binding in role_bindings(project, config) {
                    applied.push(self.apply_namespaced(&ns, &binding).await?);
                }
                applied
            }
            ChildStage::Repository => {
                vec![self.apply_namespaced(&ns, &repository(project, config)).await?]
            }
            ChildStage::FluxGitRepository => {
                vec![self.apply_namespaced(&ns, &git_repository(project, config)).await?]
            }
            ChildStage::FluxKustomizations => {
                let mut applied = Vec::with_capacity(KUSTOMIZATION_PATHS.len());
                for kustomization in kustomizations(project, config) {
                    applied.push(self.apply_namespaced(&ns, &kustomization).await?);
                }
                applied
            }
            ChildStage::Certificate => {
                vec![self.apply_namespaced(&ns, &certificate(project, config)).await?]
            }
        };

        Ok(applied)
    }
}

/// 子对象的公共元数据
fn child_meta(project: &Project, name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(BTreeMap::from([(PROJECT_KEY.to_string(), project.name_any())])),
        ..Default::default()
    }
}

pub fn namespace(project: &Project, config: &OperatorConfig) -> Namespace {
    let ns = project.target_namespace(&config.prefix);
    let mut metadata = child_meta(project, &ns, None);
    metadata.annotations = Some(BTreeMap::from([(PROJECT_KEY.to_string(), project.name_any())]));
    Namespace {
        metadata,
        ..Default::default()
    }
}

pub fn service_account(project: &Project, config: &OperatorConfig) -> ServiceAccount {
    let ns = project.target_namespace(&config.prefix);
    ServiceAccount {
        metadata: child_meta(project, &ns, Some(&ns)),
        ..Default::default()
    }
}

/// 项目命名空间内的 Role
pub fn role(project: &Project, config: &OperatorConfig) -> Role {
    let ns = project.target_namespace(&config.prefix);
    let rule = |groups: &[&str], resources: &[&str], verbs: &[&str]| PolicyRule {
        api_groups: Some(groups.iter().map(|s| s.to_string()).collect()),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    };

    Role {
        metadata: child_meta(project, &ns, Some(&ns)),
        rules: Some(vec![
            rule(&["mpas.ocm.software", "delivery.ocm.software"], &["*"], &["*"]),
            rule(
                &["source.toolkit.fluxcd.io", "kustomize.toolkit.fluxcd.io"],
                &["*"],
                &["get", "list", "watch"],
            ),
            rule(
                &[""],
                &["secrets", "configmaps", "serviceaccounts"],
                &["get", "list", "watch", "create", "update", "patch"],
            ),
        ]),
    }
}

/// 服务账号到 Role 与 ClusterRole 的绑定
pub fn role_bindings(project: &Project, config: &OperatorConfig) -> [RoleBinding; 2] {
    let ns = project.target_namespace(&config.prefix);
    let subjects = Some(vec![Subject {
        kind: "ServiceAccount".to_string(),
        name: ns.clone(),
        namespace: Some(ns.clone()),
        ..Default::default()
    }]);
    let binding = |name: &str, kind: &str, role: &str| RoleBinding {
        metadata: child_meta(project, name, Some(&ns)),
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: kind.to_string(),
            name: role.to_string(),
        },
        subjects: subjects.clone(),
    };

    [
        binding(&ns, "Role", &ns),
        binding(
            &format!("{ns}-clusterrole"),
            "ClusterRole",
            &config.cluster_role_name,
        ),
    ]
}

/// 仓库名称，未指定时使用项目命名空间名
pub fn repository_name(project: &Project, config: &OperatorConfig) -> String {
    project
        .spec
        .git
        .repository_name
        .clone()
        .unwrap_or_else(|| project.target_namespace(&config.prefix))
}

/// 仓库的 HTTPS 地址
pub fn repository_url(project: &Project, config: &OperatorConfig) -> String {
    let git = &project.spec.git;
    let domain = match (git.domain.as_deref(), git.provider.as_str()) {
        (Some(domain), _) => domain,
        (None, "gitlab") => "gitlab.com",
        (None, _) => "github.com",
    };
    format!(
        "https://{}/{}/{}",
        domain,
        git.owner,
        repository_name(project, config)
    )
}

pub fn repository(project: &Project, config: &OperatorConfig) -> Repository {
    let ns = project.target_namespace(&config.prefix);
    let git = &project.spec.git;
    let commit_template = git.commit_template.clone().unwrap_or_else(|| CommitTemplate {
        name: config.default_commit.name.clone(),
        email: config.default_commit.email.clone(),
        message: config.default_commit.message.clone(),
    });

    let mut repo = Repository::new(
        &ns,
        RepositoryResourceSpec {
            provider: git.provider.clone(),
            owner: git.owner.clone(),
            repository_name: repository_name(project, config),
            domain: git.domain.clone(),
            credentials: git.credentials.clone(),
            visibility: git.visibility.clone(),
            is_organization: git.is_organization,
            default_branch: git.default_branch.clone(),
            existing_repository_policy: git.existing_repository_policy.clone(),
            maintainers: git.maintainers.clone(),
            commit_template,
        },
    );
    repo.metadata = child_meta(project, &ns, Some(&ns));
    repo
}

pub fn git_repository(project: &Project, config: &OperatorConfig) -> GitRepository {
    let ns = project.target_namespace(&config.prefix);
    let git = &project.spec.git;
    let mut source = GitRepository::new(
        &ns,
        GitRepositorySpec {
            url: repository_url(project, config),
            interval: project.spec.flux.interval.clone(),
            reference: Some(GitRepositoryRef {
                branch: Some(git.default_branch.clone()),
            }),
            secret_ref: Some(LocalObjectReference {
                name: git.credentials.secret_ref.name.clone(),
            }),
        },
    );
    source.metadata = child_meta(project, &ns, Some(&ns));
    source
}

pub fn kustomizations(project: &Project, config: &OperatorConfig) -> Vec<Kustomization> {
    let ns = project.target_namespace(&config.prefix);
    KUSTOMIZATION_PATHS
        .iter()
        .map(|path| {
            let name = format!("{ns}-{path}");
            let mut kustomization = Kustomization::new(
                &name,
                KustomizationSpec {
                    path: path.to_string(),
                    interval: project.spec.flux.interval.clone(),
                    prune: true,
                    source_ref: CrossNamespaceSourceReference {
                        kind: "GitRepository".to_string(),
                        name: ns.clone(),
                        namespace: Some(ns.clone()),
                    },
                    service_account_name: Some(ns.clone()),
                },
            );
            kustomization.metadata = child_meta(project, &name, Some(&ns));
            kustomization
        })
        .collect()
}

pub fn certificate(project: &Project, config: &OperatorConfig) -> Certificate {
    let ns = project.target_namespace(&config.prefix);
    let name = format!("{ns}-registry-tls-certs");
    let mut cert = Certificate::new(
        &name,
        CertificateSpec {
            secret_name: name.clone(),
            dns_names: vec![config.registry_address.clone()],
            issuer_ref: IssuerReference {
                name: config.certificate_issuer_name.clone(),
                kind: "ClusterIssuer".to_string(),
                group: Some("cert-manager.io".to_string()),
            },
        },
    );
    cert.metadata = child_meta(project, &name, Some(&ns));
    cert
}
