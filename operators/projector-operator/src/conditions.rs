//! 状态条件模块
//!
//! 维护 Project 状态中的 `Ready` 与 `Reconciling` 条件。

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const READY_CONDITION: &str = "Ready";
pub const RECONCILING_CONDITION: &str = "Reconciling";

pub const SUCCEEDED_REASON: &str = "Succeeded";
pub const PROGRESSING_REASON: &str = "Progressing";
pub const WAITING_ON_RESOURCES_REASON: &str = "WaitingOnResources";
pub const RECONCILIATION_FAILED_REASON: &str = "ReconciliationFailed";
pub const DELETION_FAILED_REASON: &str = "DeletionFailed";

const STATUS_TRUE: &str = "True";
const STATUS_FALSE: &str = "False";

/// 查找指定类型的条件
pub fn get<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    get(conditions, type_).is_some_and(|c| c.status == STATUS_TRUE)
}

/// 设置条件；状态未变化时保留原有的转换时间
pub fn set(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
    generation: Option<i64>,
) {
    let status = if status { STATUS_TRUE } else { STATUS_FALSE };
    let message = message.into();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = Time(Utc::now());
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message;
        existing.observed_generation = generation;
        return;
    }

    conditions.push(Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        observed_generation: generation,
        last_transition_time: Time(Utc::now()),
    });
}

pub fn remove(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}
