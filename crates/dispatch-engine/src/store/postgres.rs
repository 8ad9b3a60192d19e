//! Postgres 存储实现
//!
//! 状态列使用 TEXT 存储,守卫式迁移通过 `WHERE status = ...` 条件
//! 加 `rows_affected` 判定实现,并发下同一迁移只会成功一次。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use courier_shared::error::{CourierError, Result};
use courier_shared::model::{CampaignStatus, DeliveryStatus, ScheduledStatus};

use super::{
    Campaign, CampaignOutcome, DeliveryLogEntry, DispatchStore, MessageTemplate, NewCampaign,
    NewDeliveryLog, NewScheduledNotification, NewTemplate, ScheduledNotification,
};

// ---------------------------------------------------------------------------
// 行映射
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct ScheduledRow {
    id: i64,
    recipient: String,
    channel: String,
    body: String,
    subject: Option<String>,
    template_id: Option<i64>,
    campaign_id: Option<i64>,
    user_id: Option<String>,
    metadata: Json<HashMap<String, String>>,
    send_at: DateTime<Utc>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ScheduledRow {
    fn into_domain(self) -> Result<ScheduledNotification> {
        Ok(ScheduledNotification {
            id: self.id,
            recipient: self.recipient,
            channel: self.channel,
            body: self.body,
            subject: self.subject,
            template_id: self.template_id,
            campaign_id: self.campaign_id,
            user_id: self.user_id,
            metadata: self.metadata.0,
            send_at: self.send_at,
            status: self.status.parse::<ScheduledStatus>()?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeliveryLogRow {
    id: i64,
    job_id: Uuid,
    recipient: String,
    channel: String,
    message: String,
    subject: Option<String>,
    template_id: Option<i64>,
    campaign_id: Option<i64>,
    status: String,
    error: Option<String>,
    attempt: i32,
    delivered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl DeliveryLogRow {
    fn into_domain(self) -> Result<DeliveryLogEntry> {
        Ok(DeliveryLogEntry {
            id: self.id,
            job_id: self.job_id,
            recipient: self.recipient,
            channel: self.channel,
            message: self.message,
            subject: self.subject,
            template_id: self.template_id,
            campaign_id: self.campaign_id,
            status: self.status.parse::<DeliveryStatus>()?,
            error: self.error,
            attempt: self.attempt,
            delivered_at: self.delivered_at,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CampaignRow {
    id: i64,
    name: String,
    channel: String,
    recipients: Json<Vec<String>>,
    template_id: Option<i64>,
    status: String,
    total_recipients: i32,
    success_count: i32,
    failure_count: i32,
    scheduled_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
}

impl CampaignRow {
    fn into_domain(self) -> Result<Campaign> {
        Ok(Campaign {
            id: self.id,
            name: self.name,
            channel: self.channel,
            recipients: self.recipients.0,
            template_id: self.template_id,
            status: self.status.parse::<CampaignStatus>()?,
            total_recipients: self.total_recipients,
            success_count: self.success_count,
            failure_count: self.failure_count,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            created_by: self.created_by,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TemplateRow {
    id: i64,
    name: String,
    channel: String,
    subject: Option<String>,
    body: String,
    created_at: DateTime<Utc>,
}

impl TemplateRow {
    fn into_domain(self) -> MessageTemplate {
        MessageTemplate {
            id: self.id,
            name: self.name,
            channel: self.channel,
            subject: self.subject,
            body: self.body,
            created_at: self.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

/// 基于 Postgres 的存储实现
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DispatchStore for PgStore {
    // ---- 定时通知 ----

    async fn create_scheduled(
        &self,
        new: NewScheduledNotification,
    ) -> Result<ScheduledNotification> {
        let row = sqlx::query_as::<_, ScheduledRow>(
            r#"
            INSERT INTO scheduled_notifications
                (recipient, channel, body, subject, template_id, campaign_id,
                 user_id, metadata, send_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending')
            RETURNING id, recipient, channel, body, subject, template_id, campaign_id,
                      user_id, metadata, send_at, status, created_at, updated_at
            "#,
        )
        .bind(&new.recipient)
        .bind(&new.channel)
        .bind(&new.body)
        .bind(&new.subject)
        .bind(new.template_id)
        .bind(new.campaign_id)
        .bind(&new.user_id)
        .bind(Json(&new.metadata))
        .bind(new.send_at)
        .fetch_one(&self.pool)
        .await?;

        row.into_domain()
    }

    async fn get_scheduled(&self, id: i64) -> Result<ScheduledNotification> {
        let row = sqlx::query_as::<_, ScheduledRow>(
            r#"
            SELECT id, recipient, channel, body, subject, template_id, campaign_id,
                   user_id, metadata, send_at, status, created_at, updated_at
            FROM scheduled_notifications
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CourierError::NotFound {
            entity: "scheduled_notification".to_string(),
            id: id.to_string(),
        })?;

        row.into_domain()
    }

    async fn claim_due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledNotification>> {
        // 抢占与状态翻转在同一事务内完成,认领后的记录对并发的
        // 取消不可见;SKIP LOCKED 让多实例巡检互不阻塞
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<_, ScheduledRow>(
            r#"
            UPDATE scheduled_notifications
            SET status = 'queued', updated_at = NOW()
            WHERE id IN (
                SELECT id FROM scheduled_notifications
                WHERE status = 'pending' AND send_at <= $1
                ORDER BY send_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, recipient, channel, body, subject, template_id, campaign_id,
                      user_id, metadata, send_at, status, created_at, updated_at
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut claimed: Vec<ScheduledNotification> = rows
            .into_iter()
            .map(ScheduledRow::into_domain)
            .collect::<Result<_>>()?;
        claimed.sort_by_key(|r| r.send_at);
        Ok(claimed)
    }

    async fn mark_scheduled_queued(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_notifications
            SET status = 'queued', updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_scheduled_sent(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_notifications
            SET status = 'sent', updated_at = NOW()
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_scheduled_failed(&self, id: i64, reason: &str) -> Result<bool> {
        // queued 覆盖入队失败与投递耗尽两条路径,记录认领后才可能失败
        let result = sqlx::query(
            r#"
            UPDATE scheduled_notifications
            SET status = 'failed',
                metadata = metadata || jsonb_build_object('failure_reason', $2::text),
                updated_at = NOW()
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel_scheduled(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_notifications
            SET status = 'cancelled', updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_terminal_scheduled_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM scheduled_notifications
            WHERE status IN ('sent', 'failed', 'cancelled') AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ---- 投递日志 ----

    async fn insert_delivery_log(&self, log: NewDeliveryLog) -> Result<DeliveryLogEntry> {
        let row = sqlx::query_as::<_, DeliveryLogRow>(
            r#"
            INSERT INTO delivery_logs
                (job_id, recipient, channel, message, subject, template_id,
                 campaign_id, status, error, attempt, delivered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id, job_id, recipient, channel, message, subject, template_id,
                      campaign_id, status, error, attempt, delivered_at, created_at
            "#,
        )
        .bind(log.job_id)
        .bind(&log.recipient)
        .bind(&log.channel)
        .bind(&log.message)
        .bind(&log.subject)
        .bind(log.template_id)
        .bind(log.campaign_id)
        .bind(log.status.as_str())
        .bind(&log.error)
        .bind(log.attempt)
        .bind(log.delivered_at)
        .fetch_one(&self.pool)
        .await?;

        row.into_domain()
    }

    async fn delivery_logs_for_job(&self, job_id: Uuid) -> Result<Vec<DeliveryLogEntry>> {
        let rows = sqlx::query_as::<_, DeliveryLogRow>(
            r#"
            SELECT id, job_id, recipient, channel, message, subject, template_id,
                   campaign_id, status, error, attempt, delivered_at, created_at
            FROM delivery_logs
            WHERE job_id = $1
            ORDER BY attempt ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeliveryLogRow::into_domain).collect()
    }

    async fn delete_terminal_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM delivery_logs
            WHERE status IN ('success', 'failed') AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ---- 活动 ----

    async fn create_campaign(&self, new: NewCampaign) -> Result<Campaign> {
        // 带 scheduled_at 的活动直接进入 scheduled 状态
        let status = if new.scheduled_at.is_some() {
            CampaignStatus::Scheduled
        } else {
            CampaignStatus::Draft
        };

        let row = sqlx::query_as::<_, CampaignRow>(
            r#"
            INSERT INTO campaigns
                (name, channel, recipients, template_id, status, scheduled_at, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, name, channel, recipients, template_id, status,
                      total_recipients, success_count, failure_count,
                      scheduled_at, started_at, completed_at, created_by, created_at
            "#,
        )
        .bind(&new.name)
        .bind(&new.channel)
        .bind(Json(&new.recipients))
        .bind(new.template_id)
        .bind(status.as_str())
        .bind(new.scheduled_at)
        .bind(&new.created_by)
        .fetch_one(&self.pool)
        .await?;

        row.into_domain()
    }

    async fn get_campaign(&self, id: i64) -> Result<Campaign> {
        let row = sqlx::query_as::<_, CampaignRow>(
            r#"
            SELECT id, name, channel, recipients, template_id, status,
                   total_recipients, success_count, failure_count,
                   scheduled_at, started_at, completed_at, created_by, created_at
            FROM campaigns
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CourierError::NotFound {
            entity: "campaign".to_string(),
            id: id.to_string(),
        })?;

        row.into_domain()
    }

    async fn mark_campaign_running(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        // total_recipients 在启动时固化,后续计数器只和这个值比较
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'running', started_at = $2,
                total_recipients = jsonb_array_length(recipients)
            WHERE id = $1 AND status IN ('draft', 'scheduled')
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn pause_campaign(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE campaigns SET status = 'paused' WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn resume_campaign(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE campaigns SET status = 'running' WHERE id = $1 AND status = 'paused'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_draft_campaign(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM campaigns WHERE id = $1 AND status = 'draft'")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_campaign_outcome(&self, id: i64, outcome: CampaignOutcome) -> Result<()> {
        let sql = match outcome {
            CampaignOutcome::Success => {
                "UPDATE campaigns SET success_count = success_count + 1 WHERE id = $1"
            }
            CampaignOutcome::Failure => {
                "UPDATE campaigns SET failure_count = failure_count + 1 WHERE id = $1"
            }
        };

        sqlx::query(sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn running_campaigns(&self) -> Result<Vec<Campaign>> {
        let rows = sqlx::query_as::<_, CampaignRow>(
            r#"
            SELECT id, name, channel, recipients, template_id, status,
                   total_recipients, success_count, failure_count,
                   scheduled_at, started_at, completed_at, created_by, created_at
            FROM campaigns
            WHERE status = 'running'
            ORDER BY started_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CampaignRow::into_domain).collect()
    }

    async fn outstanding_scheduled(&self, campaign_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM scheduled_notifications
            WHERE campaign_id = $1 AND status IN ('pending', 'queued')
            "#,
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn complete_campaign(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'completed', completed_at = $2
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // ---- 模板 ----

    async fn create_template(&self, new: NewTemplate) -> Result<MessageTemplate> {
        let row = sqlx::query_as::<_, TemplateRow>(
            r#"
            INSERT INTO message_templates (name, channel, subject, body)
            VALUES ($1, $2, $3, $4)
            RETURNING id, name, channel, subject, body, created_at
            "#,
        )
        .bind(&new.name)
        .bind(&new.channel)
        .bind(&new.subject)
        .bind(&new.body)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into_domain())
    }

    async fn get_template(&self, id: i64) -> Result<MessageTemplate> {
        let row = sqlx::query_as::<_, TemplateRow>(
            "SELECT id, name, channel, subject, body, created_at FROM message_templates WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CourierError::NotFound {
            entity: "message_template".to_string(),
            id: id.to_string(),
        })?;

        Ok(row.into_domain())
    }
}
