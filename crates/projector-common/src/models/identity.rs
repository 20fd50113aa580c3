//! 资源身份编码模块
//!
//! 子对象的持久身份由 (group, kind, namespace, name) 四元组构成，
//! 观察到的 API 版本只作为附带信息，不参与身份比较。
//!
//! 身份在内存中始终是结构化的 [`ResourceIdentity`]，只有写入父资源状态时
//! 才编码为字符串。当前编码格式为：
//!
//! ```text
//! v1/<group>/<kind>/<namespace>/<name>
//! ```
//!
//! Kubernetes 的 group、kind、namespace 和对象名称都不允许包含 `/`，
//! 因此该编码是单射的。为了兼容旧版控制器写入的清单，解码同时接受
//! `<namespace>_<name>_<group>_<kind>` 格式（名称中的 `__` 表示 `:`）。

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use kube::core::GroupVersionKind;

use crate::error::{Error, Result};

/// 当前身份编码的版本前缀
pub const IDENTITY_SCHEMA: &str = "v1";

const SEPARATOR: char = '/';
const LEGACY_SEPARATOR: char = '_';
const LEGACY_COLON_ESCAPE: &str = "__";

/// 子对象的持久身份
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceIdentity {
    /// API 组，核心组为空字符串
    pub group: String,
    /// 资源类型
    pub kind: String,
    /// 命名空间，集群级对象为 None
    pub namespace: Option<String>,
    /// 对象名称
    pub name: String,
}

impl ResourceIdentity {
    /// 创建并校验资源身份
    pub fn new(group: &str, kind: &str, namespace: Option<&str>, name: &str) -> Result<Self> {
        if kind.is_empty() {
            return Err(Error::IdentityExtraction(format!(
                "对象 {name:?} 缺少 kind"
            )));
        }
        if name.is_empty() {
            return Err(Error::IdentityExtraction(format!("{kind} 对象缺少名称")));
        }

        let namespace = namespace.filter(|ns| !ns.is_empty());
        for (field, value) in [
            ("group", group),
            ("kind", kind),
            ("namespace", namespace.unwrap_or_default()),
            ("name", name),
        ] {
            if value.contains(SEPARATOR) {
                return Err(Error::IdentityExtraction(format!(
                    "{field} 字段包含非法字符 '{SEPARATOR}': {value:?}"
                )));
            }
        }

        Ok(Self {
            group: group.to_string(),
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        })
    }

    /// 编码为持久化字符串
    pub fn encode(&self) -> String {
        format!(
            "{IDENTITY_SCHEMA}{sep}{}{sep}{}{sep}{}{sep}{}",
            self.group,
            self.kind,
            self.namespace.as_deref().unwrap_or_default(),
            self.name,
            sep = SEPARATOR,
        )
    }

    /// 从持久化字符串解码
    pub fn decode(id: &str) -> Result<Self> {
        match id.split_once(SEPARATOR) {
            Some((IDENTITY_SCHEMA, rest)) => Self::decode_v1(id, rest),
            Some((schema, _)) => Err(Error::malformed(id, format!("未知的编码版本 {schema:?}"))),
            None => Self::decode_legacy(id),
        }
    }

    fn decode_v1(id: &str, rest: &str) -> Result<Self> {
        let parts: Vec<&str> = rest.split(SEPARATOR).collect();
        let [group, kind, namespace, name] = parts.as_slice() else {
            return Err(Error::malformed(
                id,
                format!("应包含 4 个字段，实际为 {}", parts.len()),
            ));
        };

        Self::new(group, kind, Some(*namespace), name)
            .map_err(|e| Error::malformed(id, e.to_string()))
    }

    fn decode_legacy(id: &str) -> Result<Self> {
        let mut tail = id.rsplitn(3, LEGACY_SEPARATOR);
        let (Some(kind), Some(group), Some(head)) = (tail.next(), tail.next(), tail.next()) else {
            return Err(Error::malformed(id, "旧格式应包含 4 个字段"));
        };
        let Some((namespace, name)) = head.split_once(LEGACY_SEPARATOR) else {
            return Err(Error::malformed(id, "旧格式缺少命名空间或名称"));
        };

        let name = name.replace(LEGACY_COLON_ESCAPE, ":");
        Self::new(group, kind, Some(namespace), &name)
            .map_err(|e| Error::malformed(id, e.to_string()))
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

impl FromStr for ResourceIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

/// 可以加入资源清单的对象
///
/// 所有静态类型的 `kube::Resource`（k8s-openapi 类型与派生的自定义资源）
/// 都自动实现该 trait。
pub trait InventoryObject {
    /// API 组
    fn object_group(&self) -> String;
    /// 资源类型
    fn object_kind(&self) -> String;
    /// 命名空间
    fn object_namespace(&self) -> Option<String>;
    /// 对象名称
    fn object_name(&self) -> Option<String>;
    /// 当前观察到的 API 版本，例如 `rbac.authorization.k8s.io/v1`
    fn observed_api_version(&self) -> String;

    /// 提取资源身份
    fn identity(&self) -> Result<ResourceIdentity> {
        let kind = self.object_kind();
        let name = self
            .object_name()
            .ok_or_else(|| Error::IdentityExtraction(format!("{kind} 对象缺少名称")))?;
        ResourceIdentity::new(
            &self.object_group(),
            &kind,
            self.object_namespace().as_deref(),
            &name,
        )
    }
}

impl<K> InventoryObject for K
where
    K: kube::Resource<DynamicType = ()>,
{
    fn object_group(&self) -> String {
        K::group(&()).into_owned()
    }

    fn object_kind(&self) -> String {
        K::kind(&()).into_owned()
    }

    fn object_namespace(&self) -> Option<String> {
        self.meta().namespace.clone()
    }

    fn object_name(&self) -> Option<String> {
        self.meta().name.clone()
    }

    fn observed_api_version(&self) -> String {
        K::api_version(&()).into_owned()
    }
}

/// 可直接用于删除或存在性检查的最小对象句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    pub group: String,
    /// 完整的 API 版本（`group/version` 或核心组的 `version`）
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectHandle {
    /// 由身份与 API 版本构造句柄
    pub fn new(identity: ResourceIdentity, api_version: &str) -> Self {
        Self {
            group: identity.group,
            api_version: api_version.to_string(),
            kind: identity.kind,
            namespace: identity.namespace,
            name: identity.name,
        }
    }

    /// 由任意清单对象构造句柄
    pub fn from_object<O: InventoryObject + ?Sized>(obj: &O) -> Result<Self> {
        Ok(Self::new(obj.identity()?, &obj.observed_api_version()))
    }

    /// 句柄对应的资源身份
    pub fn to_identity(&self) -> ResourceIdentity {
        ResourceIdentity {
            group: self.group.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// API 版本中的版本部分
    pub fn version(&self) -> &str {
        self.api_version
            .rsplit(SEPARATOR)
            .next()
            .unwrap_or(&self.api_version)
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, self.version(), &self.kind)
    }

    /// 删除顺序，见 [`delete_rank`]
    pub fn delete_order(&self, other: &Self) -> Ordering {
        let key = |h: &Self| {
            (
                delete_rank(&h.group, &h.kind, h.namespace.is_some()),
                h.kind.clone(),
                h.group.clone(),
                h.namespace.clone(),
                h.name.clone(),
            )
        };
        key(self).cmp(&key(other))
    }
}

impl InventoryObject for ObjectHandle {
    fn object_group(&self) -> String {
        self.group.clone()
    }

    fn object_kind(&self) -> String {
        self.kind.clone()
    }

    fn object_namespace(&self) -> Option<String> {
        self.namespace.clone()
    }

    fn object_name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn observed_api_version(&self) -> String {
        self.api_version.clone()
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

const FLUX_SYNC_GROUPS: [&str; 2] = ["kustomize.toolkit.fluxcd.io", "helm.toolkit.fluxcd.io"];
const FLUX_SOURCE_GROUP: &str = "source.toolkit.fluxcd.io";
const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// 删除优先级，数值越小越先删除
///
/// 0 Flux 同步对象，1 Flux 源，2 其他命名空间对象，3 RoleBinding，
/// 4 Role，5 ServiceAccount，6 Namespace，7 ClusterRoleBinding，
/// 8 ClusterRole，9 其他集群级对象。
pub fn delete_rank(group: &str, kind: &str, namespaced: bool) -> u8 {
    match (group, kind) {
        (g, _) if FLUX_SYNC_GROUPS.contains(&g) => 0,
        (FLUX_SOURCE_GROUP, _) => 1,
        (RBAC_GROUP, "RoleBinding") => 3,
        (RBAC_GROUP, "Role") => 4,
        ("", "ServiceAccount") => 5,
        ("", "Namespace") => 6,
        (RBAC_GROUP, "ClusterRoleBinding") => 7,
        (RBAC_GROUP, "ClusterRole") => 8,
        _ if namespaced => 2,
        _ => 9,
    }
}
