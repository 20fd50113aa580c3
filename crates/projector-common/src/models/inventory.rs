//! 资源清单模块
//!
//! 资源清单记录父资源在上一次成功协调后拥有的全部子对象，持久化在父资源
//! 状态中。协调时由新旧两份清单求差集得到需要清理的陈旧对象。

use std::collections::HashSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::identity::{InventoryObject, ObjectHandle, ResourceIdentity};
use crate::error::{Error, Result};

/// 清单条目
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ResourceRef {
    /// 编码后的资源身份
    pub id: String,
    /// 最后一次成功协调时观察到的 API 版本
    pub version: String,
}

/// 资源清单
///
/// `Clone` 为深拷贝，不与源清单共享任何存储。
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ResourceInventory {
    /// 按协调顺序排列的条目
    #[serde(default)]
    pub entries: Vec<ResourceRef>,
}

impl ResourceInventory {
    /// 创建空清单
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 将对象加入清单
    ///
    /// 所有对象的身份都提取成功后才会修改清单。已存在的身份保留原位置，
    /// 版本以最后一次写入为准。
    pub fn add<O: InventoryObject>(&mut self, objects: &[O]) -> Result<()> {
        let refs = objects
            .iter()
            .map(|obj| {
                Ok((
                    obj.identity()?,
                    ResourceRef {
                        id: String::new(),
                        version: obj.observed_api_version(),
                    },
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        for (identity, mut entry) in refs {
            entry.id = identity.encode();
            match self.position(&identity) {
                Some(index) => self.entries[index] = entry,
                None => self.entries.push(entry),
            }
        }

        Ok(())
    }

    /// 是否包含指定身份
    pub fn contains(&self, identity: &ResourceIdentity) -> bool {
        self.position(identity).is_some()
    }

    fn position(&self, identity: &ResourceIdentity) -> Option<usize> {
        self.entries.iter().position(|entry| {
            ResourceIdentity::decode(&entry.id)
                .map(|existing| &existing == identity)
                .unwrap_or(false)
        })
    }

    /// 解析全部条目，任一条目无效则整体失败
    pub fn identities(&self) -> Result<Vec<(ResourceIdentity, &str)>> {
        self.entries
            .iter()
            .map(|entry| Ok((ResourceIdentity::decode(&entry.id)?, entry.version.as_str())))
            .collect()
    }

    /// 将全部条目转换为按删除顺序排列的对象句柄
    pub fn list(&self) -> Result<Vec<ObjectHandle>> {
        let mut seen = HashSet::new();
        let mut objects = Vec::with_capacity(self.entries.len());
        for (identity, version) in self.identities()? {
            if seen.insert(identity.clone()) {
                objects.push(materialize(identity, version)?);
            }
        }

        objects.sort_by(ObjectHandle::delete_order);
        Ok(objects)
    }

    /// 计算存在于当前清单（previous）但不在 `current` 中的对象
    ///
    /// 比较只基于身份，忽略版本；结果中的版本取自当前清单。
    pub fn diff(&self, current: &ResourceInventory) -> Result<Vec<ObjectHandle>> {
        let previous = self.identities()?;
        let keep: HashSet<ResourceIdentity> = current
            .identities()?
            .into_iter()
            .map(|(identity, _)| identity)
            .collect();

        let mut seen = HashSet::new();
        let mut stale = Vec::new();
        for (identity, version) in previous {
            if keep.contains(&identity) || !seen.insert(identity.clone()) {
                continue;
            }
            stale.push(materialize(identity, version)?);
        }

        stale.sort_by(ObjectHandle::delete_order);
        Ok(stale)
    }

    /// 查找第一个指定类型的对象
    pub fn find_kind(&self, kind: &str) -> Result<Option<ResourceIdentity>> {
        Ok(self
            .identities()?
            .into_iter()
            .map(|(identity, _)| identity)
            .find(|identity| identity.kind == kind))
    }
}

fn materialize(identity: ResourceIdentity, version: &str) -> Result<ObjectHandle> {
    if version.is_empty() {
        return Err(Error::MalformedIdentity {
            id: identity.encode(),
            reason: "缺少 API 版本".to_string(),
        });
    }
    Ok(ObjectHandle::new(identity, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(group: &str, version: &str, kind: &str, ns: Option<&str>, name: &str) -> ObjectHandle {
        ObjectHandle::new(ResourceIdentity::new(group, kind, ns, name).unwrap(), version)
    }

    fn inventory(objects: &[ObjectHandle]) -> ResourceInventory {
        let mut inv = ResourceInventory::new();
        inv.add(objects).unwrap();
        inv
    }

    fn sa() -> ObjectHandle {
        handle("", "v1", "ServiceAccount", Some("ns"), "sa")
    }

    fn role() -> ObjectHandle {
        handle("rbac.authorization.k8s.io", "rbac.authorization.k8s.io/v1", "Role", Some("proj"), "role")
    }

    #[test]
    fn test_add_records_version() {
        let inv = inventory(&[sa(), role()]);
        assert_eq!(inv.len(), 2);
        assert_eq!(inv.entries[0].id, "v1//ServiceAccount/ns/sa");
        assert_eq!(inv.entries[0].version, "v1");
        assert_eq!(inv.entries[1].version, "rbac.authorization.k8s.io/v1");
    }

    #[test]
    fn test_add_dedupes_last_version_wins() {
        let mut inv = inventory(&[role(), sa()]);
        let mut newer = role();
        newer.api_version = "rbac.authorization.k8s.io/v2".into();
        inv.add(&[newer]).unwrap();

        assert_eq!(inv.len(), 2);
        assert_eq!(inv.entries[0].version, "rbac.authorization.k8s.io/v2");
        assert!(inv.contains(&role().to_identity()));
    }

    #[test]
    fn test_add_is_all_or_nothing() {
        let mut inv = inventory(&[sa()]);
        let mut unnamed = role();
        unnamed.name = String::new();

        let err = inv.add(&[role(), unnamed]).unwrap_err();
        assert!(matches!(err, Error::IdentityExtraction(_)));
        assert_eq!(inv.len(), 1);
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let original = inventory(&[sa()]);
        let mut copy = original.clone();
        copy.add(&[role()]).unwrap();

        assert_eq!(original.len(), 1);
        assert_eq!(copy.len(), 2);
    }

    #[test]
    fn test_diff_ignores_version() {
        let previous = inventory(&[sa(), role()]);
        let mut bumped = role();
        bumped.api_version = "rbac.authorization.k8s.io/v2".into();
        let current = inventory(&[sa(), bumped]);

        assert!(previous.diff(&current).unwrap().is_empty());
    }

    #[test]
    fn test_diff_against_empty_returns_everything() {
        let previous = inventory(&[sa(), role()]);
        let stale = previous.diff(&ResourceInventory::new()).unwrap();

        // Role 先于 ServiceAccount 删除
        assert_eq!(stale, vec![role(), sa()]);
    }

    #[test]
    fn test_diff_of_self_is_empty() {
        let inv = inventory(&[sa(), role()]);
        assert!(inv.diff(&inv).unwrap().is_empty());
        assert!(ResourceInventory::new().diff(&ResourceInventory::new()).unwrap().is_empty());
    }

    #[test]
    fn test_diff_is_deterministic() {
        let previous = inventory(&[
            handle("", "v1", "ConfigMap", Some("b"), "z"),
            handle("", "v1", "ConfigMap", Some("a"), "y"),
            sa(),
            handle("kustomize.toolkit.fluxcd.io", "kustomize.toolkit.fluxcd.io/v1", "Kustomization", Some("a"), "x"),
        ]);
        let current = inventory(&[sa()]);

        let first = previous.diff(&current).unwrap();
        let second = previous.diff(&current).unwrap();
        assert_eq!(first, second);

        let names: Vec<_> = first.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, ["x", "y", "z"]);
    }

    #[test]
    fn test_diff_uses_previous_version() {
        let previous = inventory(&[role()]);
        let stale = previous.diff(&ResourceInventory::new()).unwrap();
        assert_eq!(stale[0].api_version, "rbac.authorization.k8s.io/v1");
        assert_eq!(stale[0].version(), "v1");
    }

    #[test]
    fn test_diff_fails_closed_on_malformed_entry() {
        let mut previous = inventory(&[sa()]);
        previous.entries.push(ResourceRef {
            id: "garbage".into(),
            version: "v1".into(),
        });

        let err = previous.diff(&ResourceInventory::new()).unwrap_err();
        assert!(matches!(err, Error::MalformedIdentity { .. }));

        let err = ResourceInventory::new().diff(&previous).unwrap_err();
        assert!(matches!(err, Error::MalformedIdentity { .. }));
    }

    #[test]
    fn test_diff_matches_legacy_and_current_encoding() {
        let previous = ResourceInventory {
            entries: vec![
                ResourceRef {
                    id: "ns_sa__ServiceAccount".into(),
                    version: "v1".into(),
                },
                ResourceRef {
                    id: "proj_role_rbac.authorization.k8s.io_Role".into(),
                    version: "rbac.authorization.k8s.io/v1".into(),
                },
            ],
        };
        let current = inventory(&[sa()]);

        assert_eq!(previous.diff(&current).unwrap(), vec![role()]);
    }

    #[test]
    fn test_list_sorted_for_deletion() {
        let ns = handle("", "v1", "Namespace", None, "proj");
        let inv = inventory(&[ns.clone(), sa(), role()]);
        assert_eq!(inv.list().unwrap(), vec![role(), sa(), ns]);
    }

    #[test]
    fn test_list_rejects_missing_version() {
        let inv = ResourceInventory {
            entries: vec![ResourceRef {
                id: "v1//ServiceAccount/ns/sa".into(),
                version: String::new(),
            }],
        };
        assert!(matches!(inv.list(), Err(Error::MalformedIdentity { .. })));
    }

    #[test]
    fn test_find_kind() {
        let inv = inventory(&[role(), sa()]);
        let found = inv.find_kind("ServiceAccount").unwrap().unwrap();
        assert_eq!(found.namespace.as_deref(), Some("ns"));
        assert_eq!(found.name, "sa");
        assert!(inv.find_kind("Secret").unwrap().is_none());
    }

    #[test]
    fn test_status_wire_format() {
        let inv = inventory(&[sa()]);
        let json = serde_json::to_value(&inv).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "entries": [{ "id": "v1//ServiceAccount/ns/sa", "version": "v1" }]
            })
        );

        let parsed: ResourceInventory = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(parsed.is_empty());
    }
}
