//! Projector Operator - 管理 Project 资源的 Kubernetes Operator
//!
//! 该 crate 为每个 Project 创建并维护一组子对象（命名空间、服务账号、RBAC、Git 仓库、
//! Flux 同步对象与证书），在 Project 状态中记录子对象清单，并清理不再需要的对象。
//! 另有一个 Secret 同步器维护项目服务账号的 imagePullSecrets。

pub mod children;
pub mod conditions;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod external;
pub mod reconcile;
pub mod secrets;
pub mod store;

#[cfg(test)]
mod testing;

use anyhow::Result;
use kube::Client;
use tracing::info;

use crate::config::OperatorConfig;

/// Operator 主结构体
pub struct ProjectorOperator {
    /// Kubernetes 客户端
    client: Client,
    /// Operator 配置
    config: OperatorConfig,
}

impl ProjectorOperator {
    /// 创建新的 Operator 实例
    pub async fn new(config: OperatorConfig) -> Result<Self> {
        // 创建 Kubernetes 客户端
        let client = Client::try_default().await?;

        Ok(Self { client, config })
    }

    /// 启动 Operator，直到 Project 控制器退出
    pub async fn start(self) -> Result<()> {
        let projects = controller::Controller::new(self.client.clone(), self.config.clone());
        let secrets = secrets::SecretsSync::new(self.client, self.config);

        info!("Projector Operator 已启动");
        tokio::select! {
            _ = projects.run() => {},
            _ = secrets.run() => {},
        }
        info!("Projector Operator 已停止");

        Ok(())
    }
}
