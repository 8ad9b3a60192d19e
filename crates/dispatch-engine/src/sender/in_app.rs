//! 应用内通知发送器
//!
//! 把消息写入用户的站内信收件箱。当前为模拟实现,
//! 生产环境应写入站内信服务或推送到在线用户的长连接。

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use courier_shared::model::Channel;

use super::{ChannelSender, DeliveryReceipt, SendError};

/// 应用内通知发送器
#[derive(Default)]
pub struct InAppSender;

impl InAppSender {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChannelSender for InAppSender {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    fn name(&self) -> &str {
        "in-app"
    }

    async fn deliver<'a>(
        &self,
        recipient: &str,
        message: &str,
        subject: Option<&'a str>,
    ) -> Result<DeliveryReceipt, SendError> {
        // 站内信收件人是用户标识,只要求非空
        if recipient.trim().is_empty() {
            return Err(SendError::InvalidRecipient {
                recipient: recipient.to_string(),
            });
        }

        debug!(
            user = %recipient,
            title = subject.unwrap_or(""),
            content_length = message.len(),
            "写入站内信"
        );

        let message_id = format!("inapp_{}", Uuid::new_v4());

        info!(user = %recipient, message_id = %message_id, "站内信写入成功");

        Ok(DeliveryReceipt::new(message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_in_app() {
        let sender = InAppSender::new();
        let receipt = sender.deliver("user-001", "你有一条新消息", None).await.unwrap();
        assert!(receipt.provider_message_id.starts_with("inapp_"));
    }

    #[tokio::test]
    async fn test_empty_recipient() {
        let sender = InAppSender::new();
        assert!(sender.deliver("  ", "你好", None).await.is_err());
    }
}
