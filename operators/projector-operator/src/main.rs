use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube::CustomResourceExt;
use projector_operator::config::{load_config, ConfigOverrides};
use projector_operator::crd::Project;
use projector_operator::ProjectorOperator;
use tracing_subscriber::EnvFilter;

/// Projector Operator
#[derive(Debug, Parser)]
#[command(name = "projector-operator", version, about)]
struct Args {
    /// 配置文件路径（YAML 或 JSON）
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Project 资源所在的命名空间
    #[arg(long)]
    default_namespace: Option<String>,

    /// 项目命名空间前缀
    #[arg(long)]
    prefix: Option<String>,

    /// 绑定到项目服务账号的 ClusterRole
    #[arg(long)]
    cluster_role_name: Option<String>,

    /// 签发注册表证书的 ClusterIssuer
    #[arg(long)]
    certificate_issuer_name: Option<String>,

    /// 集群内 OCI 注册表地址
    #[arg(long)]
    registry_address: Option<String>,

    /// 日志级别，RUST_LOG 优先
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 以 YAML 输出 Project CRD
    Crd,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Command::Crd) = args.command {
        print!("{}", serde_yaml::to_string(&Project::crd()).context("序列化 CRD 失败")?);
        return Ok(());
    }

    let overrides = ConfigOverrides {
        default_namespace: args.default_namespace,
        prefix: args.prefix,
        cluster_role_name: args.cluster_role_name,
        certificate_issuer_name: args.certificate_issuer_name,
        registry_address: args.registry_address,
        log_level: args.log_level,
    };
    let config = load_config(args.config.as_deref(), &overrides).context("加载配置失败")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("无效的日志级别")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let operator = ProjectorOperator::new(config)
        .await
        .context("创建 Kubernetes 客户端失败")?;
    operator.start().await
}
