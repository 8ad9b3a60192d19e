//! 领域模型定义
//!
//! 定义通知任务、计划通知、投递日志与活动相关的数据结构和状态枚举。
//! 状态枚举同时携带字符串表示（用于数据库 TEXT 列）和迁移合法性校验。

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CourierError;

// ---------------------------------------------------------------------------
// Channel — 通知渠道
// ---------------------------------------------------------------------------

/// 通知渠道
///
/// 三种已知渠道之外的值（如 "fax"）在投递阶段解析失败，
/// 按单次终态失败记录，不进入重试。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    Email,
    Sms,
    InApp,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::InApp => "in-app",
        }
    }

    /// 所有已知渠道，用于注册发送器时的完整性检查
    pub fn all() -> [Channel; 3] {
        [Self::Email, Self::Sms, Self::InApp]
    }
}

impl FromStr for Channel {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "sms" => Ok(Self::Sms),
            "in-app" => Ok(Self::InApp),
            other => Err(CourierError::UnknownChannel {
                channel: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// NotificationJob — 通知任务
// ---------------------------------------------------------------------------

/// 通知任务
///
/// 队列中的瞬态工作单元，一条任务对应一个收件人的一次投递意图。
/// `channel` 保持为原始字符串，在 worker 解析时才校验——
/// 这样非法渠道值走"首次尝试即终态失败"的日志路径而非提交期报错。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationJob {
    /// 任务唯一标识
    pub id: Uuid,
    /// 收件人（邮箱 / 手机号 / 用户 ID，语义由渠道决定）
    pub recipient: String,
    /// 渠道原始值
    pub channel: String,
    /// 消息正文
    pub body: String,
    /// 邮件主题（仅 email 渠道使用）
    pub subject: Option<String>,
    /// 模板引用
    pub template_id: Option<i64>,
    /// 所属活动引用（一条任务至多属于一个活动）
    pub campaign_id: Option<i64>,
    /// 由计划通知提升而来时，回指原计划记录
    pub scheduled_id: Option<i64>,
    /// 附加元数据
    pub metadata: HashMap<String, String>,
    /// 发起用户（系统路径下为空）
    pub user_id: Option<String>,
    /// 已执行的投递尝试次数，创建时为 0，由队列在每次出租时递增
    pub attempts: u32,
    /// 创建时间
    pub created_at: DateTime<Utc>,
}

impl NotificationJob {
    /// 创建新任务
    pub fn new(
        recipient: impl Into<String>,
        channel: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient: recipient.into(),
            channel: channel.into(),
            body: body.into(),
            subject: None,
            template_id: None,
            campaign_id: None,
            scheduled_id: None,
            metadata: HashMap::new(),
            user_id: None,
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_template(mut self, template_id: i64) -> Self {
        self.template_id = Some(template_id);
        self
    }

    pub fn with_campaign(mut self, campaign_id: i64) -> Self {
        self.campaign_id = Some(campaign_id);
        self
    }

    pub fn with_scheduled(mut self, scheduled_id: i64) -> Self {
        self.scheduled_id = Some(scheduled_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// 解析渠道值，失败返回 UnknownChannel
    pub fn parse_channel(&self) -> Result<Channel, CourierError> {
        self.channel.parse()
    }
}

// ---------------------------------------------------------------------------
// ScheduledStatus — 计划通知状态
// ---------------------------------------------------------------------------

/// 计划通知状态
///
/// 合法迁移：pending -> queued -> (sent | failed)，pending -> cancelled。
/// 状态永不回退，失败只能发生在认领入队之后。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduledStatus {
    Pending,
    Queued,
    Sent,
    Failed,
    Cancelled,
}

impl ScheduledStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// 是否为终态（sent / failed / cancelled 不再变化）
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Cancelled)
    }

    /// 校验状态迁移是否合法
    pub fn can_transition(&self, to: ScheduledStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Queued)
                | (Self::Pending, Self::Cancelled)
                | (Self::Queued, Self::Sent)
                | (Self::Queued, Self::Failed)
        )
    }
}

impl FromStr for ScheduledStatus {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(CourierError::Internal(format!(
                "未知计划通知状态: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for ScheduledStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CampaignStatus — 活动状态
// ---------------------------------------------------------------------------

/// 活动状态
///
/// completed 为终态，且仅由调度器的完成检测扫描写入——
/// worker 只负责累加计数器，避免多个 worker 同时判定"自己是最后一个"。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Completed,
    Paused,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Paused => "paused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// 是否允许发起扇出（start 的前置状态）
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Draft | Self::Scheduled)
    }
}

impl FromStr for CampaignStatus {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "paused" => Ok(Self::Paused),
            other => Err(CourierError::Internal(format!("未知活动状态: {other}"))),
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// DeliveryStatus — 投递日志状态
// ---------------------------------------------------------------------------

/// 单次投递尝试的结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Success,
    Failed,
    Pending,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Pending => "pending",
        }
    }

    /// pending 状态的日志不参与保留期清理
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl FromStr for DeliveryStatus {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "pending" => Ok(Self::Pending),
            other => Err(CourierError::Internal(format!("未知投递状态: {other}"))),
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
