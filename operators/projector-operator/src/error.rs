//! 错误处理模块
//!
//! 该模块定义 Operator 的错误类型。协调过程中的错误分为子对象协调失败、
//! 清单解析失败、删除失败（逐个累积）以及超时，控制循环根据这些错误决定
//! 重新排队。

use std::fmt;

use projector_common::ObjectHandle;
use thiserror::Error;

use crate::children::ChildStage;

/// 对象存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    /// 对象不存在
    #[error("对象不存在: {kind} {name}")]
    NotFound { kind: String, name: String },

    /// Kubernetes API 错误
    #[error("Kubernetes API 错误: {0}")]
    Kube(#[from] kube::Error),

    /// 其他错误
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound { .. } => true,
            StoreError::Kube(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }
}

/// 单个对象的删除失败
#[derive(Debug)]
pub struct DeletionFailure {
    pub handle: ObjectHandle,
    pub source: StoreError,
}

/// 删除失败的有序累积
#[derive(Debug, Default)]
pub struct DeletionErrors(Vec<DeletionFailure>);

impl DeletionErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: ObjectHandle, source: StoreError) {
        self.0.push(DeletionFailure { handle, source });
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeletionFailure> {
        self.0.iter()
    }

    /// 删除失败的对象句柄
    pub fn handles(&self) -> Vec<ObjectHandle> {
        self.0.iter().map(|f| f.handle.clone()).collect()
    }
}

impl fmt::Display for DeletionErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} 个对象删除失败", self.0.len())?;
        for failure in &self.0 {
            write!(f, "; {}: {}", failure.handle, failure.source)?;
        }
        Ok(())
    }
}

impl std::error::Error for DeletionErrors {}

/// Operator 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 资源清单错误
    #[error("资源清单错误: {0}")]
    Inventory(#[from] projector_common::Error),

    /// 子对象协调失败
    #[error("{stage} 协调失败: {source}")]
    ChildReconcile {
        stage: ChildStage,
        #[source]
        source: StoreError,
    },

    /// 清理陈旧对象失败
    #[error("清理失败: {0}")]
    Deletion(#[source] DeletionErrors),

    /// 超出本次协调的截止时间
    #[error("协调超时: 尚有 {pending} 个操作未执行 ({failures})")]
    Deadline {
        pending: usize,
        failures: DeletionErrors,
    },

    /// 对象存储错误
    #[error("对象存储错误: {0}")]
    Store(#[from] StoreError),

    /// Kubernetes API 错误
    #[error("Kubernetes API 错误: {0}")]
    Kube(#[from] kube::Error),

    /// Project 规范无效
    #[error("无效的 Project 规范: {0}")]
    InvalidSpec(String),

    /// 对象缺少必需的元数据
    #[error("对象缺少必需字段: {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// 写入 Ready 条件的原因
    pub fn reason(&self) -> &'static str {
        match self {
            Error::ChildReconcile { stage, .. } => stage.failure_reason(),
            Error::Deletion(_) => crate::conditions::DELETION_FAILED_REASON,
            _ => crate::conditions::RECONCILIATION_FAILED_REASON,
        }
    }
}

/// Operator 结果类型别名
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use projector_common::ResourceIdentity;

    #[test]
    fn test_deletion_errors_display_lists_every_failure() {
        let mut errors = DeletionErrors::new();
        for name in ["first", "second"] {
            let id = ResourceIdentity::new("", "ConfigMap", Some("ns"), name).unwrap();
            errors.push(ObjectHandle::new(id, "v1"), StoreError::Other("boom".into()));
        }

        let text = errors.to_string();
        assert_eq!(errors.len(), 2);
        assert!(text.contains("first"));
        assert!(text.contains("second"));
    }

    #[test]
    fn test_not_found_detection() {
        let err = StoreError::NotFound {
            kind: "Secret".into(),
            name: "x".into(),
        };
        assert!(err.is_not_found());
        assert!(!StoreError::Other("x".into()).is_not_found());
    }
}
