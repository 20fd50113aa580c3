//! 外部资源类型
//!
//! Project 的子对象中包含由其他控制器拥有的自定义资源：git-controller 的
//! Repository、Flux 的 GitRepository 与 Kustomization，以及 cert-manager 的
//! Certificate。这里只声明 Operator 需要写入的字段。

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{CommitTemplate, Credentials, LocalObjectReference};

/// git-controller Repository 规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "mpas.ocm.software", version = "v1alpha1", kind = "Repository", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryResourceSpec {
    pub provider: String,
    pub owner: String,
    pub repository_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub credentials: Credentials,
    pub visibility: String,
    pub is_organization: bool,
    pub default_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_repository_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maintainers: Vec<String>,
    pub commit_template: CommitTemplate,
}

/// Flux GitRepository 规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "source.toolkit.fluxcd.io", version = "v1", kind = "GitRepository", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositorySpec {
    pub url: String,
    pub interval: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<GitRepositoryRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct GitRepositoryRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// Flux Kustomization 规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "kustomize.toolkit.fluxcd.io", version = "v1", kind = "Kustomization", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct KustomizationSpec {
    pub path: String,
    pub interval: String,
    pub prune: bool,
    pub source_ref: CrossNamespaceSourceReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct CrossNamespaceSourceReference {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// cert-manager Certificate 规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "cert-manager.io", version = "v1", kind = "Certificate", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    pub secret_name: String,
    pub dns_names: Vec<String>,
    pub issuer_ref: IssuerReference,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct IssuerReference {
    pub name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}
