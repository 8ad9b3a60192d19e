//! SMS 短信发送器
//!
//! 当前为模拟实现,生产环境需要接入真实的短信网关(如 Twilio、阿里云短信)。

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use courier_shared::model::Channel;

use super::{ChannelSender, DeliveryReceipt, SendError};

/// 短信正文长度上限,超过会被网关拒绝
const MAX_SMS_LENGTH: usize = 500;

/// SMS 短信发送器
pub struct SmsSender {
    /// 短信签名
    sign_name: String,
    simulated_latency_ms: u64,
}

impl SmsSender {
    pub fn new(sign_name: impl Into<String>) -> Self {
        Self {
            sign_name: sign_name.into(),
            simulated_latency_ms: 20,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new("Courier")
    }

    fn is_valid_phone(recipient: &str) -> bool {
        let digits = recipient.strip_prefix('+').unwrap_or(recipient);
        !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
    }
}

#[async_trait]
impl ChannelSender for SmsSender {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn name(&self) -> &str {
        "sms"
    }

    async fn deliver<'a>(
        &self,
        recipient: &str,
        message: &str,
        _subject: Option<&'a str>,
    ) -> Result<DeliveryReceipt, SendError> {
        if !Self::is_valid_phone(recipient) {
            return Err(SendError::InvalidRecipient {
                recipient: recipient.to_string(),
            });
        }

        // 超长正文网关会拒收,属于永久失败
        if message.len() > MAX_SMS_LENGTH {
            return Err(SendError::InvalidRecipient {
                recipient: format!("{recipient} (正文超长 {} 字节)", message.len()),
            });
        }

        tokio::time::sleep(tokio::time::Duration::from_millis(self.simulated_latency_ms)).await;

        debug!(
            to = %recipient,
            sign = %self.sign_name,
            content_length = message.len(),
            "SMS 发送中..."
        );

        let message_id = format!("sms_{}", Uuid::new_v4());

        info!(to = %recipient, message_id = %message_id, "SMS 发送成功");

        Ok(DeliveryReceipt::new(message_id))
    }
}
