//! 对象存储模块
//!
//! 按对象句柄删除集群中的对象。句柄只携带 GVK 与名称，因此通过动态 API 访问。

use async_trait::async_trait;
use kube::{
    api::{Api, ApiResource, DeleteParams, DynamicObject},
    Client,
};
#[cfg(test)]
use mockall::automock;
use projector_common::ObjectHandle;
use tracing::debug;

use crate::error::StoreError;

/// 协调器使用的对象存储
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// 删除对象；对象不存在时返回 [`StoreError::NotFound`]
    async fn delete(&self, handle: &ObjectHandle) -> Result<(), StoreError>;
}

/// 基于 Kubernetes API 的对象存储
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, handle: &ObjectHandle) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(&handle.gvk());
        match &handle.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn delete(&self, handle: &ObjectHandle) -> Result<(), StoreError> {
        let api = self.api_for(handle);
        match api.delete(&handle.name, &DeleteParams::background()).await {
            Ok(_) => {
                debug!("已提交删除 {}", handle);
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 404 => Err(StoreError::NotFound {
                kind: handle.kind.clone(),
                name: handle.name.clone(),
            }),
            Err(e) => Err(StoreError::Kube(e)),
        }
    }
}
