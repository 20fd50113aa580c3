//! 自定义资源定义模块
//!
//! 该模块定义 Project 自定义资源。每个 Project 对应一组命名空间级的子对象
//! （命名空间、服务账号、RBAC、Git 仓库、Flux 同步对象与证书），
//! 子对象清单持久化在 Project 状态中。

use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{CustomResource, ResourceExt};
use projector_common::{ResourceIdentity, ResourceInventory};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions;
use crate::error::{Error, Result};

/// 跟踪子对象清理的 finalizer
pub const PROJECT_FINALIZER: &str = "finalizers.mpas.ocm.software";

/// 命名空间上记录所属 Project 名称的注解，同时用作子对象标签
pub const PROJECT_KEY: &str = "mpas.ocm.system/project";

/// 时长字段的格式，与 [`parse_duration`] 接受的输入一致
pub const DURATION_PATTERN: &str = r"^([0-9]+(\.[0-9]+)?(ms|s|m|h))+$";

/// Project 规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(group = "mpas.ocm.software", version = "v1alpha1", kind = "Project", namespaced)]
#[kube(status = "ProjectStatus", shortname = "proj")]
#[kube(printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#)]
#[kube(printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].message"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    /// 项目 Git 仓库
    pub git: RepositorySpec,

    /// Flux 同步设置
    #[serde(default)]
    pub flux: FluxSpec,

    /// 是否清理不再需要的子对象
    #[serde(default = "default_prune")]
    pub prune: bool,

    /// 协调间隔
    #[serde(default = "default_interval")]
    #[schemars(regex(pattern = r"^([0-9]+(\.[0-9]+)?(ms|s|m|h))+$"))]
    pub interval: String,
}

/// Flux 同步设置
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct FluxSpec {
    /// Kustomization 同步间隔
    #[serde(default = "default_flux_interval")]
    #[schemars(regex(pattern = r"^([0-9]+(\.[0-9]+)?(ms|s|m|h))+$"))]
    pub interval: String,
}

impl Default for FluxSpec {
    fn default() -> Self {
        Self {
            interval: default_flux_interval(),
        }
    }
}

/// Git 仓库规范，与 Repository 资源的规范一致
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    /// 代码托管平台：github、gitlab 或 gitea
    pub provider: String,
    /// 仓库所有者（用户或组织）
    pub owner: String,
    /// 仓库名称，缺省时使用前缀加 Project 名称
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_name: Option<String>,
    /// 自托管平台的域名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// 访问凭据
    pub credentials: Credentials,
    /// 仓库可见性
    #[serde(default = "default_visibility")]
    pub visibility: String,
    /// 所有者是否为组织
    #[serde(default)]
    pub is_organization: bool,
    /// 默认分支
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// 仓库已存在时的处理策略
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_repository_policy: Option<String>,
    /// 维护者列表
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maintainers: Vec<String>,
    /// 提交模板
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_template: Option<CommitTemplate>,
}

/// 凭据引用
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub secret_ref: LocalObjectReference,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct LocalObjectReference {
    pub name: String,
}

/// 自动提交使用的提交模板
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CommitTemplate {
    pub name: String,
    pub email: String,
    pub message: String,
}

/// 带命名空间的对象引用
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct NamespacedObjectReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Project 状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// 最近一次完成协调的 generation
    #[serde(default)]
    pub observed_generation: i64,

    /// 已成功应用的子对象清单
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<ResourceInventory>,

    /// 控制器创建的 Repository 资源
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_ref: Option<NamespacedObjectReference>,
}

impl Project {
    /// Project 在协调过程中的阶段
    pub fn phase(&self) -> Phase {
        if self.metadata.deletion_timestamp.is_some() {
            Phase::Deleting
        } else if self.finalizers().iter().any(|f| f == PROJECT_FINALIZER) {
            Phase::Reconciling
        } else {
            Phase::Initializing
        }
    }

    /// 项目子对象所在的命名空间
    pub fn target_namespace(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.name_any())
    }

    /// 协调间隔
    pub fn requeue_after(&self) -> Result<Duration> {
        parse_duration(&self.spec.interval)
    }

    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| conditions::is_true(&s.conditions, conditions::READY_CONDITION))
    }

    /// 当前已提交的子对象清单
    pub fn inventory(&self) -> Option<&ResourceInventory> {
        self.status.as_ref().and_then(|s| s.inventory.as_ref())
    }

    /// 从清单中查找项目服务账号
    pub fn service_account(&self) -> Result<ResourceIdentity> {
        let inventory = self
            .inventory()
            .ok_or(Error::MissingObjectKey("status.inventory"))?;
        inventory
            .find_kind("ServiceAccount")?
            .ok_or(Error::MissingObjectKey("status.inventory[ServiceAccount]"))
    }
}

/// Project 协调阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// 尚未添加 finalizer
    Initializing,
    /// 正常协调
    Reconciling,
    /// 已设置删除时间戳
    Deleting,
}

/// 解析 `1h30m`、`5m`、`1.5s`、`250ms` 形式的时长
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || Error::InvalidSpec(format!("无效的时长: {input:?}"));
    if input.is_empty() {
        return Err(invalid());
    }

    let mut millis = 0f64;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let (number, tail) = rest.split_at(digits);
        let (whole, fraction) = number.split_once('.').unwrap_or((number, "0"));
        let is_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if !is_digits(whole) || !is_digits(fraction) {
            return Err(invalid());
        }
        let value: f64 = number.parse().map_err(|_| invalid())?;

        let (scale, tail) = if let Some(tail) = tail.strip_prefix("ms") {
            (1.0, tail)
        } else if let Some(tail) = tail.strip_prefix('s') {
            (1_000.0, tail)
        } else if let Some(tail) = tail.strip_prefix('m') {
            (60_000.0, tail)
        } else if let Some(tail) = tail.strip_prefix('h') {
            (3_600_000.0, tail)
        } else {
            return Err(invalid());
        };

        millis += value * scale;
        rest = tail;
    }

    Ok(Duration::from_millis(millis.round() as u64))
}

/// 默认开启清理
fn default_prune() -> bool {
    true
}

/// 默认协调间隔
fn default_interval() -> String {
    "10m".to_string()
}

/// 默认 Flux 同步间隔
fn default_flux_interval() -> String {
    "5m".to_string()
}

fn default_visibility() -> String {
    "private".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use rstest::rstest;

    #[rstest]
    #[case("5m", 300.0)]
    #[case("1h30m", 5400.0)]
    #[case("1.5s", 1.5)]
    #[case("250ms", 0.25)]
    #[case("1m30s", 90.0)]
    fn test_parse_duration(#[case] input: &str, #[case] seconds: f64) {
        assert_eq!(parse_duration(input).unwrap(), Duration::from_secs_f64(seconds));
    }

    #[rstest]
    #[case("")]
    #[case("5")]
    #[case("m")]
    #[case("5d")]
    #[case("1..2s")]
    #[case(".5s")]
    #[case("1.s")]
    #[case("5m.")]
    fn test_parse_duration_invalid(#[case] input: &str) {
        assert!(matches!(parse_duration(input), Err(Error::InvalidSpec(_))));
    }

    #[test]
    fn test_crd_validates_intervals() {
        use kube::CustomResourceExt;

        let crd = serde_json::to_value(Project::crd()).unwrap();
        let spec = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]["spec"]
            ["properties"];

        assert_eq!(spec["interval"]["pattern"], DURATION_PATTERN);
        let flux = spec["flux"].to_string();
        assert!(flux.contains(&serde_json::to_string(DURATION_PATTERN).unwrap()));
    }

    #[test]
    fn test_spec_defaults() {
        let spec: ProjectSpec = serde_json::from_value(serde_json::json!({
            "git": {
                "provider": "github",
                "owner": "open-component-model",
                "credentials": { "secretRef": { "name": "git-creds" } }
            }
        }))
        .unwrap();

        assert!(spec.prune);
        assert_eq!(spec.interval, "10m");
        assert_eq!(spec.flux.interval, "5m");
        assert_eq!(spec.git.default_branch, "main");
    }

    #[test]
    fn test_phase() {
        let mut project = Project::new("demo", serde_json::from_value(serde_json::json!({
            "git": {
                "provider": "github",
                "owner": "o",
                "credentials": { "secretRef": { "name": "c" } }
            }
        }))
        .unwrap());
        assert_eq!(project.phase(), Phase::Initializing);

        project.metadata.finalizers = Some(vec![PROJECT_FINALIZER.to_string()]);
        assert_eq!(project.phase(), Phase::Reconciling);

        project.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert_eq!(project.phase(), Phase::Deleting);
        assert_eq!(project.target_namespace("mpas"), "mpas-demo");
    }
}
