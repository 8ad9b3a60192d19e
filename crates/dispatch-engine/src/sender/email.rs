//! Email 邮件发送器
//!
//! 当前为模拟实现,生产环境需要接入真实的邮件服务(如 SendGrid、AWS SES)。

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use courier_shared::model::Channel;

use super::{ChannelSender, DeliveryReceipt, SendError};

/// Email 邮件发送器
pub struct EmailSender {
    /// 发件人地址
    from_address: String,
    /// 模拟的网络延迟(毫秒)
    simulated_latency_ms: u64,
}

impl EmailSender {
    pub fn new(from_address: impl Into<String>) -> Self {
        Self {
            from_address: from_address.into(),
            simulated_latency_ms: 30,
        }
    }

    /// 使用默认配置创建
    pub fn with_defaults() -> Self {
        Self::new("noreply@courier.dev")
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn name(&self) -> &str {
        "email"
    }

    async fn deliver<'a>(
        &self,
        recipient: &str,
        message: &str,
        subject: Option<&'a str>,
    ) -> Result<DeliveryReceipt, SendError> {
        // 收件人格式校验失败属于永久失败,不进入重试
        if !recipient.contains('@') {
            return Err(SendError::InvalidRecipient {
                recipient: recipient.to_string(),
            });
        }

        // 模拟网络延迟
        tokio::time::sleep(tokio::time::Duration::from_millis(self.simulated_latency_ms)).await;

        debug!(
            from = %self.from_address,
            to = %recipient,
            subject = subject.unwrap_or("(无主题)"),
            content_length = message.len(),
            "Email 发送中..."
        );

        let message_id = format!("email_{}", Uuid::new_v4());

        info!(to = %recipient, message_id = %message_id, "Email 发送成功");

        Ok(DeliveryReceipt::new(message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_email() {
        let sender = EmailSender::with_defaults();
        let receipt = sender
            .deliver("user@example.com", "你好", Some("欢迎"))
            .await
            .unwrap();
        assert!(receipt.provider_message_id.starts_with("email_"));
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_fatal() {
        let sender = EmailSender::with_defaults();
        let err = sender.deliver("not-an-email", "你好", None).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
