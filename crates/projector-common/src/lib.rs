//! Projector Common - 资源清单与共享数据结构
//!
//! 该模块提供 Project 协调过程中跟踪子对象所需的身份编码、资源清单、
//! 清单差集与删除排序，以及统一的错误类型。

pub mod models;
pub mod error;

/// 重新导出常用类型，方便使用
pub use error::Error;
pub use error::Result;
pub use models::identity::*;
pub use models::inventory::*;
