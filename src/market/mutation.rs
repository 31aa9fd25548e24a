//! 乐观变更执行框架
//!
//! 每个变更是一个显式状态机：{Idle → OptimisticApplied → (Confirmed | RolledBack)}。
//! 补偿动作（回滚快照）在乐观写入时由各服务捕获。
//!
//! 同一逻辑目标（例如某个购物车条目）同时只允许一个在途变更，
//! 第二个请求被客户端直接拒绝（返回 `Busy`），由调用方稍后重试，
//! 避免丢失更新的竞态。该策略在 DESIGN.md 中记录。

use crate::market::types::{err_code, ApiError};
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::debug;

/// 变更生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Idle,
    /// 乐观结果已写入缓存，等待服务器确认
    OptimisticApplied,
    /// 服务器已确认，缓存中为服务器规范化后的数据
    Confirmed,
    /// 已回滚到乐观写入前的快照
    RolledBack,
}

/// 变更边界上对外暴露的错误分类
///
/// 所有变更失败都在边界处被捕获并转换为本类型，绝不向上抛出未处理的异常；
/// 调用方依据分类决定恢复交互（重试提示 / 内联校验错误 / 重新拉取）。
#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    /// 无有效凭证：依赖该凭证的变更被禁用而非报错
    #[error("未登录，操作已禁用")]
    AuthRequired,
    /// 同一目标已有在途变更，本次请求被拒绝（可稍后重试）
    #[error("目标 {target} 已有在途变更，请稍后重试")]
    Busy { target: String },
    /// 服务器拒绝载荷（如无效促销码），原始输入保留供用户修正
    #[error("校验失败: {0}")]
    Validation(String),
    /// 瞬时网络失败，已回滚，可重试
    #[error("网络错误: {0}")]
    Transient(String),
    /// 引用的实体在服务器侧已不存在，本地引用已清除，应重新拉取
    #[error("资源不存在: {0}")]
    NotFound(String),
}

impl From<ApiError> for MutationError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Server { code, msg } => match code {
                err_code::AUTH_REQUIRED => MutationError::AuthRequired,
                err_code::VALIDATION => MutationError::Validation(msg),
                err_code::NOT_FOUND => MutationError::NotFound(msg),
                _ => MutationError::Transient(format!("服务器错误 {}: {}", code, msg)),
            },
            ApiError::Http { status, body } => {
                if status == reqwest::StatusCode::UNAUTHORIZED {
                    MutationError::AuthRequired
                } else if status == reqwest::StatusCode::NOT_FOUND {
                    MutationError::NotFound(body)
                } else if status.is_client_error() {
                    MutationError::Validation(body)
                } else {
                    MutationError::Transient(format!("HTTP {}: {}", status, body))
                }
            }
            other => MutationError::Transient(other.to_string()),
        }
    }
}

/// 在途变更登记表：按逻辑目标串行化
pub struct MutationTracker {
    in_flight: Mutex<HashSet<String>>,
}

impl MutationTracker {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// 尝试登记一个目标的在途变更
    ///
    /// 成功返回许可凭据，凭据 Drop 时自动释放；目标已被占用时返回 `Busy`。
    pub fn try_acquire(&self, target: &str) -> Result<MutationPermit<'_>, MutationError> {
        let mut set = self.in_flight.lock().unwrap();
        if !set.insert(target.to_string()) {
            debug!("[Mutation] 目标 {} 已有在途变更，拒绝本次请求", target);
            return Err(MutationError::Busy {
                target: target.to_string(),
            });
        }
        Ok(MutationPermit {
            tracker: self,
            target: target.to_string(),
        })
    }

    fn release(&self, target: &str) {
        let mut set = self.in_flight.lock().unwrap();
        set.remove(target);
    }
}

impl Default for MutationTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// 在途变更许可，Drop 即释放目标
pub struct MutationPermit<'a> {
    tracker: &'a MutationTracker,
    target: String,
}

impl Drop for MutationPermit<'_> {
    fn drop(&mut self) {
        self.tracker.release(&self.target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_rejects_concurrent_same_target() {
        let tracker = MutationTracker::new();
        let permit = tracker.try_acquire("cart-item:1").unwrap();
        // 同一目标第二次登记被拒绝
        match tracker.try_acquire("cart-item:1") {
            Err(MutationError::Busy { target }) => assert_eq!(target, "cart-item:1"),
            other => panic!("预期 Busy，实际 {:?}", other.map(|_| ())),
        }
        // 不同目标不受影响
        let _other = tracker.try_acquire("cart-item:2").unwrap();
        drop(permit);
        // 释放后可重新登记
        let _again = tracker.try_acquire("cart-item:1").unwrap();
    }

    #[test]
    fn test_error_classification() {
        let e: MutationError = ApiError::Server {
            code: err_code::VALIDATION,
            msg: "无效促销码".to_string(),
        }
        .into();
        assert!(matches!(e, MutationError::Validation(_)));

        let e: MutationError = ApiError::Server {
            code: err_code::NOT_FOUND,
            msg: "条目不存在".to_string(),
        }
        .into();
        assert!(matches!(e, MutationError::NotFound(_)));

        let e: MutationError = ApiError::Http {
            status: reqwest::StatusCode::UNAUTHORIZED,
            body: String::new(),
        }
        .into();
        assert!(matches!(e, MutationError::AuthRequired));

        let e: MutationError = ApiError::MissingData.into();
        assert!(matches!(e, MutationError::Transient(_)));
    }

    #[test]
    fn test_phase_machine_shape() {
        // 状态机只有四个状态，确认与回滚互斥
        let mut phase = MutationPhase::Idle;
        assert_eq!(phase, MutationPhase::Idle);
        phase = MutationPhase::OptimisticApplied;
        assert_eq!(phase, MutationPhase::OptimisticApplied);
        phase = MutationPhase::RolledBack;
        assert_ne!(phase, MutationPhase::Confirmed);
    }
}
