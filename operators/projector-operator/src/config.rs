//! 配置管理模块
//!
//! 该模块负责加载 Operator 的配置。配置依次由内置默认值、可选的 YAML/JSON
//! 配置文件、`PROJECTOR_` 前缀的环境变量以及命令行参数覆盖组成。

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// 环境变量前缀
const ENV_PREFIX: &str = "PROJECTOR";

/// Operator 配置结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Project 资源所在的命名空间
    pub default_namespace: String,
    /// 项目命名空间与仓库名称前缀
    pub prefix: String,
    /// 绑定到项目服务账号的 ClusterRole
    pub cluster_role_name: String,
    /// 签发注册表证书的 ClusterIssuer
    pub certificate_issuer_name: String,
    /// 集群内 OCI 注册表地址
    pub registry_address: String,
    /// 仓库默认提交模板
    pub default_commit: DefaultCommit,
    /// 单次协调的截止时间（秒）
    pub reconcile_timeout_secs: u64,
    /// 协调失败后重新排队的间隔（秒）
    pub error_requeue_secs: u64,
    /// 日志级别
    pub log_level: String,
}

/// 默认提交模板
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultCommit {
    pub name: String,
    pub email: String,
    pub message: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        create_default_config()
    }
}

impl Default for DefaultCommit {
    fn default() -> Self {
        Self {
            name: "MPAS System".to_string(),
            email: "automated@ocm.software".to_string(),
            message: "Automated commit by MPAS Project Controller".to_string(),
        }
    }
}

impl OperatorConfig {
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }
}

/// 命令行提供的配置覆盖项
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub default_namespace: Option<String>,
    pub prefix: Option<String>,
    pub cluster_role_name: Option<String>,
    pub certificate_issuer_name: Option<String>,
    pub registry_address: Option<String>,
    pub log_level: Option<String>,
}

/// 加载配置
pub fn load_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<OperatorConfig> {
    let mut builder = Config::builder();

    if let Some(path) = path {
        let config_file = path.to_str().ok_or_else(|| anyhow!("配置路径无效"))?;

        // 确定配置文件格式
        let format = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => return Err(anyhow!("不支持的配置文件格式，仅支持 YAML 或 JSON")),
        };

        info!("加载配置文件: {}", config_file);
        builder = builder.add_source(File::with_name(config_file).format(format));
    }

    builder = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .set_override_option("default_namespace", overrides.default_namespace.clone())?
        .set_override_option("prefix", overrides.prefix.clone())?
        .set_override_option("cluster_role_name", overrides.cluster_role_name.clone())?
        .set_override_option(
            "certificate_issuer_name",
            overrides.certificate_issuer_name.clone(),
        )?
        .set_override_option("registry_address", overrides.registry_address.clone())?
        .set_override_option("log_level", overrides.log_level.clone())?;

    let config = builder
        .build()
        .context("构建配置失败")?
        .try_deserialize::<OperatorConfig>()
        .context("配置格式错误")?;

    debug!("已加载配置: {:?}", config);
    Ok(config)
}

/// 创建默认配置
pub fn create_default_config() -> OperatorConfig {
    OperatorConfig {
        default_namespace: "mpas-system".to_string(),
        prefix: "mpas".to_string(),
        cluster_role_name: "mpas-projects-clusterrole".to_string(),
        certificate_issuer_name: "mpas-certificate-issuer".to_string(),
        registry_address: "registry.ocm-system.svc.cluster.local".to_string(),
        default_commit: DefaultCommit::default(),
        reconcile_timeout_secs: 60,
        error_requeue_secs: 30,
        log_level: "info".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("projector-{}-{}", std::process::id(), name));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = load_config(None, &ConfigOverrides::default()).unwrap();
        assert_eq!(config.prefix, "mpas");
        assert_eq!(config.default_namespace, "mpas-system");
        assert_eq!(config.default_commit.email, "automated@ocm.software");
        assert_eq!(config.reconcile_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_file_then_overrides() {
        let path = temp_file(
            "config.yaml",
            "prefix: acme\nerror_requeue_secs: 5\ndefault_commit:\n  name: Bot\n",
        );
        let overrides = ConfigOverrides {
            prefix: Some("cli".to_string()),
            ..Default::default()
        };

        let config = load_config(Some(&path), &overrides).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(config.prefix, "cli");
        assert_eq!(config.error_requeue_secs, 5);
        assert_eq!(config.default_commit.name, "Bot");
        assert_eq!(config.default_commit.email, "automated@ocm.software");
    }

    #[test]
    fn test_unsupported_format() {
        let path = temp_file("config.toml", "prefix = \"x\"\n");
        let result = load_config(Some(&path), &ConfigOverrides::default());
        fs::remove_file(&path).ok();
        assert!(result.is_err());
    }
}
