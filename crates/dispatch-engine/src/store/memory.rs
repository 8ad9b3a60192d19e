//! 内存存储实现
//!
//! 供测试和本地开发使用,语义与 Postgres 实现保持一致:
//! 同样的守卫条件、同样的 NotFound 行为。

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use courier_shared::error::{CourierError, Result};
use courier_shared::model::{CampaignStatus, ScheduledStatus};

use super::{
    Campaign, CampaignOutcome, DeliveryLogEntry, DispatchStore, MessageTemplate, NewCampaign,
    NewDeliveryLog, NewScheduledNotification, NewTemplate, ScheduledNotification,
};

/// 基于 DashMap 的内存存储
#[derive(Default)]
pub struct MemoryStore {
    scheduled: DashMap<i64, ScheduledNotification>,
    logs: DashMap<i64, DeliveryLogEntry>,
    campaigns: DashMap<i64, Campaign>,
    templates: DashMap<i64, MessageTemplate>,
    scheduled_seq: AtomicI64,
    log_seq: AtomicI64,
    campaign_seq: AtomicI64,
    template_seq: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(seq: &AtomicI64) -> i64 {
        seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
impl MemoryStore {
    /// 测试辅助:回拨日志创建时间,构造超过保留期的旧记录
    pub fn backdate_log(&self, id: i64, created_at: DateTime<Utc>) {
        if let Some(mut e) = self.logs.get_mut(&id) {
            e.created_at = created_at;
        }
    }
}

#[async_trait]
impl DispatchStore for MemoryStore {
    // ---- 定时通知 ----

    async fn create_scheduled(
        &self,
        new: NewScheduledNotification,
    ) -> Result<ScheduledNotification> {
        let now = Utc::now();
        let record = ScheduledNotification {
            id: Self::next(&self.scheduled_seq),
            recipient: new.recipient,
            channel: new.channel,
            body: new.body,
            subject: new.subject,
            template_id: new.template_id,
            campaign_id: new.campaign_id,
            user_id: new.user_id,
            metadata: new.metadata,
            send_at: new.send_at,
            status: ScheduledStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.scheduled.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_scheduled(&self, id: i64) -> Result<ScheduledNotification> {
        self.scheduled
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| CourierError::NotFound {
                entity: "scheduled_notification".to_string(),
                id: id.to_string(),
            })
    }

    async fn claim_due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledNotification>> {
        let mut candidates: Vec<(i64, DateTime<Utc>)> = self
            .scheduled
            .iter()
            .filter(|r| r.status == ScheduledStatus::Pending && r.send_at <= now)
            .map(|r| (r.id, r.send_at))
            .collect();
        candidates.sort_by_key(|(_, send_at)| *send_at);
        candidates.truncate(limit as usize);

        // 逐条走 pending 守卫翻转,先到的取消会让这里的认领落空
        let mut claimed = Vec::with_capacity(candidates.len());
        for (id, _) in candidates {
            if let Some(mut r) = self.scheduled.get_mut(&id) {
                if r.status != ScheduledStatus::Pending {
                    continue;
                }
                r.status = ScheduledStatus::Queued;
                r.updated_at = Utc::now();
                claimed.push(r.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_scheduled_queued(&self, id: i64) -> Result<bool> {
        match self.scheduled.get_mut(&id) {
            Some(mut r) if r.status == ScheduledStatus::Pending => {
                r.status = ScheduledStatus::Queued;
                r.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_scheduled_sent(&self, id: i64) -> Result<bool> {
        match self.scheduled.get_mut(&id) {
            Some(mut r) if r.status == ScheduledStatus::Queued => {
                r.status = ScheduledStatus::Sent;
                r.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_scheduled_failed(&self, id: i64, reason: &str) -> Result<bool> {
        match self.scheduled.get_mut(&id) {
            Some(mut r) if r.status == ScheduledStatus::Queued => {
                r.status = ScheduledStatus::Failed;
                r.metadata
                    .insert("failure_reason".to_string(), reason.to_string());
                r.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_scheduled(&self, id: i64) -> Result<bool> {
        match self.scheduled.get_mut(&id) {
            Some(mut r) if r.status == ScheduledStatus::Pending => {
                r.status = ScheduledStatus::Cancelled;
                r.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_terminal_scheduled_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let before = self.scheduled.len();
        self.scheduled
            .retain(|_, r| !(r.status.is_terminal() && r.created_at < cutoff));
        Ok((before - self.scheduled.len()) as u64)
    }

    // ---- 投递日志 ----

    async fn insert_delivery_log(&self, log: NewDeliveryLog) -> Result<DeliveryLogEntry> {
        let entry = DeliveryLogEntry {
            id: Self::next(&self.log_seq),
            job_id: log.job_id,
            recipient: log.recipient,
            channel: log.channel,
            message: log.message,
            subject: log.subject,
            template_id: log.template_id,
            campaign_id: log.campaign_id,
            status: log.status,
            error: log.error,
            attempt: log.attempt,
            delivered_at: log.delivered_at,
            created_at: Utc::now(),
        };
        self.logs.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn delivery_logs_for_job(&self, job_id: Uuid) -> Result<Vec<DeliveryLogEntry>> {
        let mut entries: Vec<DeliveryLogEntry> = self
            .logs
            .iter()
            .filter(|e| e.job_id == job_id)
            .map(|e| e.clone())
            .collect();
        entries.sort_by_key(|e| e.attempt);
        Ok(entries)
    }

    async fn delete_terminal_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let before = self.logs.len();
        self.logs
            .retain(|_, e| !(e.status.is_terminal() && e.created_at < cutoff));
        Ok((before - self.logs.len()) as u64)
    }

    // ---- 活动 ----

    async fn create_campaign(&self, new: NewCampaign) -> Result<Campaign> {
        let status = if new.scheduled_at.is_some() {
            CampaignStatus::Scheduled
        } else {
            CampaignStatus::Draft
        };
        let campaign = Campaign {
            id: Self::next(&self.campaign_seq),
            name: new.name,
            channel: new.channel,
            recipients: new.recipients,
            template_id: new.template_id,
            status,
            total_recipients: 0,
            success_count: 0,
            failure_count: 0,
            scheduled_at: new.scheduled_at,
            started_at: None,
            completed_at: None,
            created_by: new.created_by,
            created_at: Utc::now(),
        };
        self.campaigns.insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    async fn get_campaign(&self, id: i64) -> Result<Campaign> {
        self.campaigns
            .get(&id)
            .map(|c| c.clone())
            .ok_or_else(|| CourierError::NotFound {
                entity: "campaign".to_string(),
                id: id.to_string(),
            })
    }

    async fn mark_campaign_running(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        match self.campaigns.get_mut(&id) {
            Some(mut c) if c.status.can_start() => {
                c.status = CampaignStatus::Running;
                c.started_at = Some(now);
                c.total_recipients = c.recipients.len() as i32;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pause_campaign(&self, id: i64) -> Result<bool> {
        match self.campaigns.get_mut(&id) {
            Some(mut c) if c.status == CampaignStatus::Running => {
                c.status = CampaignStatus::Paused;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn resume_campaign(&self, id: i64) -> Result<bool> {
        match self.campaigns.get_mut(&id) {
            Some(mut c) if c.status == CampaignStatus::Paused => {
                c.status = CampaignStatus::Running;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_draft_campaign(&self, id: i64) -> Result<bool> {
        let removed = self
            .campaigns
            .remove_if(&id, |_, c| c.status == CampaignStatus::Draft);
        Ok(removed.is_some())
    }

    async fn record_campaign_outcome(&self, id: i64, outcome: CampaignOutcome) -> Result<()> {
        if let Some(mut c) = self.campaigns.get_mut(&id) {
            match outcome {
                CampaignOutcome::Success => c.success_count += 1,
                CampaignOutcome::Failure => c.failure_count += 1,
            }
        }
        Ok(())
    }

    async fn running_campaigns(&self) -> Result<Vec<Campaign>> {
        let mut running: Vec<Campaign> = self
            .campaigns
            .iter()
            .filter(|c| c.status == CampaignStatus::Running)
            .map(|c| c.clone())
            .collect();
        running.sort_by_key(|c| c.started_at);
        Ok(running)
    }

    async fn outstanding_scheduled(&self, campaign_id: i64) -> Result<i64> {
        let count = self
            .scheduled
            .iter()
            .filter(|r| {
                r.campaign_id == Some(campaign_id)
                    && matches!(r.status, ScheduledStatus::Pending | ScheduledStatus::Queued)
            })
            .count();
        Ok(count as i64)
    }

    async fn complete_campaign(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        match self.campaigns.get_mut(&id) {
            Some(mut c) if c.status == CampaignStatus::Running => {
                c.status = CampaignStatus::Completed;
                c.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // ---- 模板 ----

    async fn create_template(&self, new: NewTemplate) -> Result<MessageTemplate> {
        let template = MessageTemplate {
            id: Self::next(&self.template_seq),
            name: new.name,
            channel: new.channel,
            subject: new.subject,
            body: new.body,
            created_at: Utc::now(),
        };
        self.templates.insert(template.id, template.clone());
        Ok(template)
    }

    async fn get_template(&self, id: i64) -> Result<MessageTemplate> {
        self.templates
            .get(&id)
            .map(|t| t.clone())
            .ok_or_else(|| CourierError::NotFound {
                entity: "message_template".to_string(),
                id: id.to_string(),
            })
    }
}
