//! 统一错误处理模块
//!
//! 定义系统中所有共享的错误类型，使用 thiserror 提供良好的错误信息。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum CourierError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    // ==================== 队列错误 ====================
    /// 任务队列基础设施不可用，提交方必须将其视为硬失败
    #[error("任务队列不可用: {0}")]
    QueueUnavailable(String),

    // ==================== 投递错误 ====================
    /// 渠道值不在已知集合内，按单次失败记录且不重试
    #[error("未知渠道: {channel}")]
    UnknownChannel { channel: String },

    /// 渠道发送器返回的失败，受重试策略约束
    #[error("投递失败: 渠道={channel}, 原因={reason}")]
    Delivery { channel: String, reason: String },

    // ==================== 状态机错误 ====================
    #[error("非法状态迁移: {entity} {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    // ==================== 验证错误 ====================
    #[error("参数验证失败: {0}")]
    Validation(String),

    // ==================== 通用错误 ====================
    #[error("配置错误: {0}")]
    Config(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, CourierError>;

impl CourierError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::QueueUnavailable(_) => "QUEUE_UNAVAILABLE",
            Self::UnknownChannel { .. } => "UNKNOWN_CHANNEL",
            Self::Delivery { .. } => "DELIVERY_ERROR",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 未知渠道与状态机错误属于业务终态，重试不会改变结果；
    /// 基础设施故障与投递失败属于瞬时故障，允许按策略重试。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::QueueUnavailable(_) | Self::Delivery { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = CourierError::NotFound {
            entity: "Campaign".to_string(),
            id: "42".to_string(),
        };
        assert_eq!(err.code(), "NOT_FOUND");

        let err = CourierError::UnknownChannel {
            channel: "fax".to_string(),
        };
        assert_eq!(err.code(), "UNKNOWN_CHANNEL");
    }

    #[test]
    fn test_is_retryable() {
        let db_err = CourierError::Database(sqlx::Error::PoolTimedOut);
        assert!(db_err.is_retryable());

        let delivery = CourierError::Delivery {
            channel: "sms".to_string(),
            reason: "网关超时".to_string(),
        };
        assert!(delivery.is_retryable());

        let unknown = CourierError::UnknownChannel {
            channel: "fax".to_string(),
        };
        assert!(!unknown.is_retryable());

        let transition = CourierError::InvalidTransition {
            entity: "ScheduledNotification".to_string(),
            from: "queued".to_string(),
            to: "cancelled".to_string(),
        };
        assert!(!transition.is_retryable());
    }
}
