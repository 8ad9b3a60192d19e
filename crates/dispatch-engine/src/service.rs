//! 提交与状态查询门面
//!
//! 对外统一入口:提交单条通知(立即或定时)、取消定时通知、
//! 查询任务与定时通知状态。活动相关操作见 [`crate::campaign`]。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use courier_shared::error::{CourierError, Result};
use courier_shared::model::{DeliveryStatus, NotificationJob, ScheduledStatus};
use courier_shared::observability::metrics;

use crate::queue::JobQueue;
use crate::store::{DispatchStore, NewScheduledNotification, ScheduledNotification};

// ---------------------------------------------------------------------------
// 请求与结果
// ---------------------------------------------------------------------------

/// 单条通知的提交请求
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub recipient: String,
    pub channel: String,
    /// 消息正文,缺省时回落到模板内容
    pub body: Option<String>,
    pub subject: Option<String>,
    pub template_id: Option<i64>,
    /// 发送时间:缺省或早于当前时间时立即入队
    pub send_at: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// 提交结果:立即路径返回任务 ID,定时路径返回定时记录 ID
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SubmitOutcome {
    Queued { job_id: Uuid },
    Scheduled { scheduled_id: i64 },
}

/// 任务投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// 已成功投递
    Delivered,
    /// 终态失败(重试耗尽或永久失败)
    Failed,
    /// 至少失败过一次,仍在队列中等待重投
    Retrying,
    /// 在队列中尚未尝试
    InFlight,
}

/// 任务状态视图,由投递日志与队列状态推导
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub state: JobState,
    pub attempts: i32,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// DispatchService
// ---------------------------------------------------------------------------

/// 提交与状态查询服务
pub struct DispatchService {
    store: Arc<dyn DispatchStore>,
    queue: Arc<dyn JobQueue>,
}

impl DispatchService {
    pub fn new(store: Arc<dyn DispatchStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    /// 提交一条通知
    ///
    /// send_at 在未来则落库为定时通知,等待提升巡检;
    /// 否则立即入队。正文缺省时取模板内容,两者都缺省报验证错误。
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome> {
        if request.recipient.trim().is_empty() {
            return Err(CourierError::Validation("收件人不能为空".to_string()));
        }
        if request.channel.trim().is_empty() {
            return Err(CourierError::Validation("渠道不能为空".to_string()));
        }

        let (body, subject) = self.resolve_content(&request).await?;

        let now = Utc::now();
        match request.send_at {
            Some(send_at) if send_at > now => {
                let record = self
                    .store
                    .create_scheduled(NewScheduledNotification {
                        recipient: request.recipient,
                        channel: request.channel,
                        body,
                        subject,
                        template_id: request.template_id,
                        campaign_id: None,
                        user_id: request.user_id,
                        metadata: request.metadata,
                        send_at,
                    })
                    .await?;

                info!(
                    scheduled_id = record.id,
                    channel = %record.channel,
                    send_at = %record.send_at,
                    "定时通知已登记"
                );
                Ok(SubmitOutcome::Scheduled {
                    scheduled_id: record.id,
                })
            }
            _ => {
                let mut job = NotificationJob::new(&request.recipient, &request.channel, body);
                job.subject = subject;
                job.template_id = request.template_id;
                job.user_id = request.user_id;
                job.metadata = request.metadata;
                let job_id = job.id;

                self.queue.enqueue(job).await?;
                metrics::record_enqueue(&request.channel);

                info!(job_id = %job_id, channel = %request.channel, "通知已入队");
                Ok(SubmitOutcome::Queued { job_id })
            }
        }
    }

    /// 正文与主题解析:显式值优先,缺省回落到模板
    async fn resolve_content(
        &self,
        request: &SubmitRequest,
    ) -> Result<(String, Option<String>)> {
        if let Some(body) = &request.body {
            return Ok((body.clone(), request.subject.clone()));
        }

        let template_id = request.template_id.ok_or_else(|| {
            CourierError::Validation("正文与模板不能同时缺省".to_string())
        })?;
        let template = self.store.get_template(template_id).await?;
        Ok((
            template.body,
            request.subject.clone().or(template.subject),
        ))
    }

    /// 取消定时通知,只有 pending 状态允许取消
    pub async fn cancel_scheduled(&self, id: i64) -> Result<()> {
        if !self.store.cancel_scheduled(id).await? {
            let record = self.store.get_scheduled(id).await?;
            return Err(CourierError::InvalidTransition {
                entity: "scheduled_notification".to_string(),
                from: record.status.to_string(),
                to: ScheduledStatus::Cancelled.to_string(),
            });
        }
        info!(scheduled_id = id, "定时通知已取消");
        Ok(())
    }

    /// 查询任务状态
    ///
    /// 从投递日志与队列状态推导:有成功日志即 delivered;
    /// 仍在队列中按是否尝试过区分 in-flight / retrying;
    /// 不在队列且有失败日志即终态 failed。
    pub async fn job_status(&self, job_id: Uuid) -> Result<JobStatusView> {
        let logs = self.store.delivery_logs_for_job(job_id).await?;
        let attempts = logs.iter().map(|l| l.attempt).max().unwrap_or(0);
        let last_error = logs.last().and_then(|l| l.error.clone());

        if logs.iter().any(|l| l.status == DeliveryStatus::Success) {
            return Ok(JobStatusView {
                job_id,
                state: JobState::Delivered,
                attempts,
                last_error: None,
            });
        }

        if self.queue.contains(job_id).await? {
            let state = if attempts > 0 {
                JobState::Retrying
            } else {
                JobState::InFlight
            };
            return Ok(JobStatusView {
                job_id,
                state,
                attempts,
                last_error,
            });
        }

        if logs.is_empty() {
            return Err(CourierError::NotFound {
                entity: "notification_job".to_string(),
                id: job_id.to_string(),
            });
        }

        Ok(JobStatusView {
            job_id,
            state: JobState::Failed,
            attempts,
            last_error,
        })
    }

    /// 查询定时通知
    pub async fn scheduled_status(&self, id: i64) -> Result<ScheduledNotification> {
        self.store.get_scheduled(id).await
    }
}
