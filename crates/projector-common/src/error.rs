//! 错误处理模块
//!
//! 该模块提供资源清单相关的统一错误类型，覆盖身份解析失败、
//! 以及子对象缺少身份字段两类情况。

use thiserror::Error;

/// 资源清单统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 已持久化或新生成的身份字符串无法解析
    #[error("无效的资源身份 {id:?}: {reason}")]
    MalformedIdentity {
        /// 原始身份字符串
        id: String,
        /// 解析失败原因
        reason: String,
    },

    /// 子对象缺少必需的身份字段
    #[error("无法提取对象身份: {0}")]
    IdentityExtraction(String),
}

impl Error {
    pub(crate) fn malformed(id: &str, reason: impl Into<String>) -> Self {
        Error::MalformedIdentity {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

/// 资源清单结果类型别名
pub type Result<T> = std::result::Result<T, Error>;
