//! 调度存储层
//!
//! 定义调度引擎的持久化接口 [`DispatchStore`] 以及相关的记录类型:
//! 定时通知、投递日志、活动(批量发送)与消息模板。
//! 生产环境使用 Postgres 实现,测试与本地开发使用内存实现。

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_shared::error::Result;
use courier_shared::model::{CampaignStatus, DeliveryStatus, NotificationJob, ScheduledStatus};

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---------------------------------------------------------------------------
// 定时通知
// ---------------------------------------------------------------------------

/// 定时通知记录
///
/// 状态机: pending -> queued -> sent/failed,pending 还可以被取消
/// (cancelled) 或在入队失败时直接标记为 failed。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledNotification {
    pub id: i64,
    pub recipient: String,
    /// 渠道名保持为字符串,未知渠道在投递阶段报错而不是在入库阶段
    pub channel: String,
    pub body: String,
    pub subject: Option<String>,
    pub template_id: Option<i64>,
    pub campaign_id: Option<i64>,
    pub user_id: Option<String>,
    pub metadata: HashMap<String, String>,
    pub send_at: DateTime<Utc>,
    pub status: ScheduledStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledNotification {
    /// 把到期的定时通知转换为队列任务,保留回写用的 scheduled_id
    pub fn to_job(&self) -> NotificationJob {
        let mut job = NotificationJob::new(&self.recipient, &self.channel, &self.body)
            .with_scheduled(self.id);
        job.subject = self.subject.clone();
        job.template_id = self.template_id;
        job.campaign_id = self.campaign_id;
        job.user_id = self.user_id.clone();
        job.metadata = self.metadata.clone();
        job
    }
}

/// 新建定时通知的输入
#[derive(Debug, Clone)]
pub struct NewScheduledNotification {
    pub recipient: String,
    pub channel: String,
    pub body: String,
    pub subject: Option<String>,
    pub template_id: Option<i64>,
    pub campaign_id: Option<i64>,
    pub user_id: Option<String>,
    pub metadata: HashMap<String, String>,
    pub send_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// 投递日志
// ---------------------------------------------------------------------------

/// 单次投递尝试的日志,每次尝试恰好产生一条
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub id: i64,
    pub job_id: Uuid,
    pub recipient: String,
    pub channel: String,
    pub message: String,
    pub subject: Option<String>,
    pub template_id: Option<i64>,
    pub campaign_id: Option<i64>,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    /// 第几次尝试,从 1 开始
    pub attempt: i32,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// 新建投递日志的输入
#[derive(Debug, Clone)]
pub struct NewDeliveryLog {
    pub job_id: Uuid,
    pub recipient: String,
    pub channel: String,
    pub message: String,
    pub subject: Option<String>,
    pub template_id: Option<i64>,
    pub campaign_id: Option<i64>,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub attempt: i32,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl NewDeliveryLog {
    /// 从任务构造一条尝试日志,attempt 取任务当前的尝试次数
    pub fn for_attempt(job: &NotificationJob, status: DeliveryStatus, error: Option<String>) -> Self {
        let delivered_at = match status {
            DeliveryStatus::Success => Some(Utc::now()),
            _ => None,
        };
        Self {
            job_id: job.id,
            recipient: job.recipient.clone(),
            channel: job.channel.clone(),
            message: job.body.clone(),
            subject: job.subject.clone(),
            template_id: job.template_id,
            campaign_id: job.campaign_id,
            status,
            error,
            attempt: job.attempts as i32,
            delivered_at,
        }
    }
}

// ---------------------------------------------------------------------------
// 活动
// ---------------------------------------------------------------------------

/// 批量发送活动
///
/// 成功/失败计数只在任务到达终态时累加一次,完成状态由调度器的
/// 完成巡检统一翻转,保证 success + failure 不会超过 total。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub channel: String,
    pub recipients: Vec<String>,
    pub template_id: Option<i64>,
    pub status: CampaignStatus,
    pub total_recipients: i32,
    pub success_count: i32,
    pub failure_count: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 新建活动的输入,活动创建后处于 draft 状态
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub name: String,
    pub channel: String,
    pub recipients: Vec<String>,
    pub template_id: Option<i64>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
}

/// 投递结果对活动计数的影响
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignOutcome {
    Success,
    Failure,
}

// ---------------------------------------------------------------------------
// 消息模板
// ---------------------------------------------------------------------------

/// 消息模板,提交时未显式给正文则回落到模板内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub id: i64,
    pub name: String,
    pub channel: String,
    pub subject: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// 新建模板的输入
#[derive(Debug, Clone)]
pub struct NewTemplate {
    pub name: String,
    pub channel: String,
    pub subject: Option<String>,
    pub body: String,
}

// ---------------------------------------------------------------------------
// 存储接口
// ---------------------------------------------------------------------------

/// 调度引擎的持久化接口
///
/// 所有状态迁移方法都带守卫条件:迁移成功返回 `true`,记录不在
/// 预期状态时返回 `false`,调用方据此决定是报错还是跳过。
#[async_trait]
pub trait DispatchStore: Send + Sync {
    // ---- 定时通知 ----

    async fn create_scheduled(&self, new: NewScheduledNotification) -> Result<ScheduledNotification>;

    async fn get_scheduled(&self, id: i64) -> Result<ScheduledNotification>;

    /// 认领到期的 pending 定时通知:原子地置为 queued 并返回,按 send_at 升序
    ///
    /// 认领与状态翻转在同一个原子操作内完成,并发的取消要么在认领前
    /// 胜出(记录不会被返回),要么被 pending 守卫拒绝——被认领的记录
    /// 不可能再变成 cancelled。
    async fn claim_due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledNotification>>;

    /// pending -> queued
    async fn mark_scheduled_queued(&self, id: i64) -> Result<bool>;

    /// queued -> sent
    async fn mark_scheduled_sent(&self, id: i64) -> Result<bool>;

    /// queued -> failed,写入 failure_reason
    async fn mark_scheduled_failed(&self, id: i64, reason: &str) -> Result<bool>;

    /// pending -> cancelled,其它状态不允许取消
    async fn cancel_scheduled(&self, id: i64) -> Result<bool>;

    /// 删除终态且创建时间早于 cutoff 的定时通知,返回删除条数
    async fn delete_terminal_scheduled_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // ---- 投递日志 ----

    async fn insert_delivery_log(&self, log: NewDeliveryLog) -> Result<DeliveryLogEntry>;

    /// 某个任务的全部尝试日志,按 attempt 升序
    async fn delivery_logs_for_job(&self, job_id: Uuid) -> Result<Vec<DeliveryLogEntry>>;

    /// 删除终态且创建时间早于 cutoff 的日志,返回删除条数
    async fn delete_terminal_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // ---- 活动 ----

    async fn create_campaign(&self, new: NewCampaign) -> Result<Campaign>;

    async fn get_campaign(&self, id: i64) -> Result<Campaign>;

    /// draft/scheduled -> running,同时固化 total_recipients 与 started_at
    async fn mark_campaign_running(&self, id: i64, now: DateTime<Utc>) -> Result<bool>;

    /// running -> paused
    async fn pause_campaign(&self, id: i64) -> Result<bool>;

    /// paused -> running
    async fn resume_campaign(&self, id: i64) -> Result<bool>;

    /// 只允许删除 draft 状态的活动
    async fn delete_draft_campaign(&self, id: i64) -> Result<bool>;

    /// 终态结果对计数的原子累加,每个任务只调用一次
    async fn record_campaign_outcome(&self, id: i64, outcome: CampaignOutcome) -> Result<()>;

    /// 所有 running 状态的活动,供完成巡检使用
    async fn running_campaigns(&self) -> Result<Vec<Campaign>>;

    /// 活动名下仍未到终态(pending/queued)的定时通知数量
    async fn outstanding_scheduled(&self, campaign_id: i64) -> Result<i64>;

    /// running -> completed,带守卫
    async fn complete_campaign(&self, id: i64, now: DateTime<Utc>) -> Result<bool>;

    // ---- 模板 ----

    async fn create_template(&self, new: NewTemplate) -> Result<MessageTemplate>;

    async fn get_template(&self, id: i64) -> Result<MessageTemplate>;
}
