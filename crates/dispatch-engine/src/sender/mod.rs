//! 渠道发送器
//!
//! 定义发送器 trait 并提供各渠道的具体实现。
//!
//! ## 支持的渠道
//!
//! - **Email**: 邮件通知
//! - **SMS**: 短信通知
//! - **InApp**: 应用内通知
//!
//! 当前均为模拟实现,生产环境需要接入真实的服务商
//! (如 SendGrid、Twilio)。

mod email;
mod in_app;
mod sms;

pub use email::EmailSender;
pub use in_app::InAppSender;
pub use sms::SmsSender;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_shared::model::Channel;

// ---------------------------------------------------------------------------
// 发送结果与错误
// ---------------------------------------------------------------------------

/// 单次投递成功的回执
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    /// 服务商侧的消息标识
    pub provider_message_id: String,
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryReceipt {
    pub fn new(provider_message_id: impl Into<String>) -> Self {
        Self {
            provider_message_id: provider_message_id.into(),
            delivered_at: Utc::now(),
        }
    }
}

/// 投递失败
///
/// 区分可重试错误(服务商故障、超时)与永久失败(无效收件人),
/// worker 据此决定重新入队还是直接记终态。
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("服务商错误: {reason}")]
    Provider { reason: String },

    #[error("发送超时: {0}ms")]
    Timeout(u64),

    #[error("无效收件人: {recipient}")]
    InvalidRecipient { recipient: String },
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider { .. } | Self::Timeout(_))
    }
}

// ---------------------------------------------------------------------------
// 发送器接口
// ---------------------------------------------------------------------------

/// 渠道发送器 trait
///
/// 所有渠道都需要实现此 trait,提供统一的投递接口。
/// 实现应当是无状态的,便于多个 worker 并发调用。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// 渠道类型标识
    fn channel(&self) -> Channel;

    /// 发送器名称(用于日志)
    fn name(&self) -> &str;

    /// 执行一次投递
    ///
    /// 失败通过 [`SendError`] 返回,由错误自身区分是否可重试。
    async fn deliver<'a>(
        &self,
        recipient: &str,
        message: &str,
        subject: Option<&'a str>,
    ) -> Result<DeliveryReceipt, SendError>;
}

// ---------------------------------------------------------------------------
// 注册表
// ---------------------------------------------------------------------------

/// 渠道到发送器的注册表
///
/// worker 解析任务渠道后从这里取发送器,未注册的渠道
/// 与未知渠道走同一条"首次尝试即终态失败"的路径。
#[derive(Default, Clone)]
pub struct SenderRegistry {
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.insert(sender.channel(), sender);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<&Arc<dyn ChannelSender>> {
        self.senders.get(&channel)
    }

    /// 注册全部内置渠道的模拟发送器
    pub fn with_default_senders() -> Self {
        Self::new()
            .register(Arc::new(EmailSender::with_defaults()))
            .register(Arc::new(SmsSender::with_defaults()))
            .register(Arc::new(InAppSender::new()))
    }

    /// 已注册的渠道列表(用于启动日志)
    pub fn channels(&self) -> Vec<Channel> {
        self.senders.keys().copied().collect()
    }
}
