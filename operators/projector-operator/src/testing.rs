//! 测试辅助：内存中的集群、对象存储与子对象协调器

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use projector_common::{ObjectHandle, ResourceIdentity};

use crate::children::{AppliedChild, ChildStage, Children};
use crate::crd::{Project, PROJECT_FINALIZER};
use crate::error::StoreError;
use crate::store::ObjectStore;

pub fn project(name: &str) -> Project {
    let spec = serde_json::from_value(serde_json::json!({
        "git": {
            "provider": "github",
            "owner": "acme",
            "credentials": { "secretRef": { "name": "git-creds" } }
        }
    }))
    .unwrap();
    let mut project = Project::new(name, spec);
    project.metadata.namespace = Some("mpas-system".to_string());
    project.metadata.generation = Some(1);
    project
}

pub fn with_finalizer(mut project: Project) -> Project {
    project.metadata.finalizers = Some(vec![PROJECT_FINALIZER.to_string()]);
    project
}

pub fn handle(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> ObjectHandle {
    let group = api_version.rsplit_once('/').map(|(g, _)| g).unwrap_or("");
    let id = ResourceIdentity::new(group, kind, namespace, name).unwrap();
    ObjectHandle::new(id, api_version)
}

/// 内存中的集群对象集合
#[derive(Clone, Default)]
pub struct FakeCluster {
    objects: Arc<Mutex<HashSet<ObjectHandle>>>,
}

impl FakeCluster {
    pub fn contains(&self, handle: &ObjectHandle) -> bool {
        self.objects.lock().unwrap().contains(handle)
    }

    pub fn insert(&self, handle: ObjectHandle) -> bool {
        self.objects.lock().unwrap().insert(handle)
    }

    fn remove(&self, handle: &ObjectHandle) -> bool {
        self.objects.lock().unwrap().remove(handle)
    }
}

/// 记录删除调用的对象存储，可按名称注入失败
#[derive(Clone, Default)]
pub struct FakeStore {
    cluster: FakeCluster,
    failing: Arc<Mutex<HashSet<String>>>,
    deletes: Arc<Mutex<Vec<ObjectHandle>>>,
}

impl FakeStore {
    pub fn new(cluster: FakeCluster) -> Self {
        Self {
            cluster,
            ..Default::default()
        }
    }

    pub fn fail_on(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// 按调用顺序返回的删除请求
    pub fn deletes(&self) -> Vec<ObjectHandle> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn delete(&self, handle: &ObjectHandle) -> Result<(), StoreError> {
        self.deletes.lock().unwrap().push(handle.clone());
        if self.failing.lock().unwrap().contains(&handle.name) {
            return Err(StoreError::Other(format!("无法删除 {}", handle.name)));
        }
        if self.cluster.remove(handle) {
            Ok(())
        } else {
            Err(StoreError::NotFound {
                kind: handle.kind.clone(),
                name: handle.name.clone(),
            })
        }
    }
}

/// 按阶段返回预设对象的子对象协调器
#[derive(Clone, Default)]
pub struct FakeChildren {
    cluster: FakeCluster,
    desired: Arc<Mutex<HashMap<ChildStage, Vec<ObjectHandle>>>>,
    failing: Arc<Mutex<Option<ChildStage>>>,
    calls: Arc<Mutex<Vec<ChildStage>>>,
}

impl FakeChildren {
    pub fn new(cluster: FakeCluster) -> Self {
        Self {
            cluster,
            ..Default::default()
        }
    }

    pub fn set(&self, stage: ChildStage, handles: Vec<ObjectHandle>) {
        self.desired.lock().unwrap().insert(stage, handles);
    }

    pub fn fail_at(&self, stage: Option<ChildStage>) {
        *self.failing.lock().unwrap() = stage;
    }

    pub fn calls(&self) -> Vec<ChildStage> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Children for FakeChildren {
    async fn apply(&self, stage: ChildStage, _project: &Project) -> Result<Vec<AppliedChild>, StoreError> {
        self.calls.lock().unwrap().push(stage);
        if *self.failing.lock().unwrap() == Some(stage) {
            return Err(StoreError::Other(format!("{stage} 不可用")));
        }

        let handles = self
            .desired
            .lock()
            .unwrap()
            .get(&stage)
            .cloned()
            .unwrap_or_default();
        Ok(handles
            .into_iter()
            .map(|handle| AppliedChild {
                created: self.cluster.insert(handle.clone()),
                handle,
            })
            .collect())
    }
}
