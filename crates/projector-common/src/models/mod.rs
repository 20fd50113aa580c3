//! 数据模型模块
//!
//! 该模块定义子对象身份与资源清单，并提供清单的差集与物化操作。

pub mod identity;
pub mod inventory;
