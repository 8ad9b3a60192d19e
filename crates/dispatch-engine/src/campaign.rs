//! 活动服务
//!
//! 活动是对一批收件人发送同一模板消息的批量任务。
//! 启动时按分片把收件人扇出为队列任务,分片之间重新检查
//! 活动状态,暂停能在分片边界及时生效。

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use courier_shared::error::{CourierError, Result};
use courier_shared::model::{CampaignStatus, NotificationJob};
use courier_shared::observability::metrics;

use crate::queue::JobQueue;
use crate::store::{Campaign, DispatchStore, NewCampaign};

/// 每个扇出分片的收件人数量
const FANOUT_CHUNK_SIZE: usize = 50;

/// 活动进度快照
#[derive(Debug, Clone, Serialize)]
pub struct CampaignProgress {
    pub campaign_id: i64,
    pub status: CampaignStatus,
    pub total_recipients: i32,
    pub success_count: i32,
    pub failure_count: i32,
    /// 已终结比例(0-100),total 为 0 时记 0
    pub percent: i32,
}

/// 活动服务
pub struct CampaignService {
    store: Arc<dyn DispatchStore>,
    queue: Arc<dyn JobQueue>,
}

impl CampaignService {
    pub fn new(store: Arc<dyn DispatchStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    /// 创建活动,初始状态为 draft(带 scheduled_at 时为 scheduled)
    pub async fn create(&self, new: NewCampaign) -> Result<Campaign> {
        if new.name.trim().is_empty() {
            return Err(CourierError::Validation("活动名称不能为空".to_string()));
        }
        if new.recipients.is_empty() {
            return Err(CourierError::Validation("收件人列表不能为空".to_string()));
        }

        let campaign = self.store.create_campaign(new).await?;
        info!(
            campaign_id = campaign.id,
            recipients = campaign.recipients.len(),
            status = %campaign.status,
            "活动已创建"
        );
        Ok(campaign)
    }

    /// 启动活动:置为 running 并把收件人扇出为队列任务
    ///
    /// 消息内容取自活动绑定的模板,未绑定模板的活动不能启动。
    /// 扇出过程中入队失败视为硬失败直接返回,已入队的任务
    /// 照常投递,剩余收件人留待人工处理。
    pub async fn start(&self, id: i64) -> Result<Campaign> {
        let campaign = self.store.get_campaign(id).await?;

        if !campaign.status.can_start() {
            return Err(CourierError::InvalidTransition {
                entity: "campaign".to_string(),
                from: campaign.status.to_string(),
                to: CampaignStatus::Running.to_string(),
            });
        }

        let template_id = campaign.template_id.ok_or_else(|| {
            CourierError::Validation(format!("活动 {id} 未绑定消息模板，无法启动"))
        })?;
        let template = self.store.get_template(template_id).await?;

        // 守卫式迁移,并发 start 只有一个能成功
        if !self.store.mark_campaign_running(id, Utc::now()).await? {
            return Err(CourierError::InvalidTransition {
                entity: "campaign".to_string(),
                from: campaign.status.to_string(),
                to: CampaignStatus::Running.to_string(),
            });
        }

        info!(
            campaign_id = id,
            total = campaign.recipients.len(),
            channel = %campaign.channel,
            "活动启动，开始扇出"
        );

        let mut fanned_out = 0usize;
        for chunk in campaign.recipients.chunks(FANOUT_CHUNK_SIZE) {
            // 分片边界重新读状态,暂停的活动停止扇出
            let current = self.store.get_campaign(id).await?;
            if current.status != CampaignStatus::Running {
                warn!(
                    campaign_id = id,
                    status = %current.status,
                    fanned_out,
                    "活动已不在 running 状态，扇出中止"
                );
                break;
            }

            let enqueues = chunk.iter().map(|recipient| {
                let mut job =
                    NotificationJob::new(recipient, &campaign.channel, &template.body)
                        .with_template(template.id)
                        .with_campaign(id);
                job.subject = template.subject.clone();
                self.queue.enqueue(job)
            });

            for result in join_all(enqueues).await {
                result?;
                metrics::record_enqueue(&campaign.channel);
                fanned_out += 1;
            }
        }

        info!(campaign_id = id, fanned_out, "活动扇出完成");
        self.store.get_campaign(id).await
    }

    /// 暂停 running 状态的活动
    ///
    /// 已入队的任务不会撤回,暂停只阻止后续扇出与 resume 前的完成判定。
    pub async fn pause(&self, id: i64) -> Result<()> {
        if !self.store.pause_campaign(id).await? {
            let campaign = self.store.get_campaign(id).await?;
            return Err(CourierError::InvalidTransition {
                entity: "campaign".to_string(),
                from: campaign.status.to_string(),
                to: CampaignStatus::Paused.to_string(),
            });
        }
        info!(campaign_id = id, "活动已暂停");
        Ok(())
    }

    /// 恢复 paused 状态的活动
    pub async fn resume(&self, id: i64) -> Result<()> {
        if !self.store.resume_campaign(id).await? {
            let campaign = self.store.get_campaign(id).await?;
            return Err(CourierError::InvalidTransition {
                entity: "campaign".to_string(),
                from: campaign.status.to_string(),
                to: CampaignStatus::Running.to_string(),
            });
        }
        info!(campaign_id = id, "活动已恢复");
        Ok(())
    }

    /// 删除活动,只允许 draft 状态
    pub async fn delete(&self, id: i64) -> Result<()> {
        if !self.store.delete_draft_campaign(id).await? {
            let campaign = self.store.get_campaign(id).await?;
            return Err(CourierError::Validation(format!(
                "活动 {id} 处于 {} 状态，只有草稿可以删除",
                campaign.status
            )));
        }
        info!(campaign_id = id, "草稿活动已删除");
        Ok(())
    }

    /// 查询活动进度
    pub async fn progress(&self, id: i64) -> Result<CampaignProgress> {
        let campaign = self.store.get_campaign(id).await?;
        let settled = campaign.success_count + campaign.failure_count;

        Ok(CampaignProgress {
            campaign_id: campaign.id,
            status: campaign.status,
            total_recipients: campaign.total_recipients,
            success_count: campaign.success_count,
            failure_count: campaign.failure_count,
            percent: settled_percent(settled, campaign.total_recipients),
        })
    }
}

/// 已终结比例(0-100),中间乘法用 i64 避免大收件人规模下溢出
fn settled_percent(settled: i32, total: i32) -> i32 {
    if total <= 0 {
        return 0;
    }
    ((settled as i64 * 100) / total as i64) as i32
}

#[cfg(test)]
mod tests {
    use courier_shared::retry::RetryPolicy;

    use crate::queue::MemoryJobQueue;
    use crate::store::{MemoryStore, NewTemplate};

    use super::*;

    async fn service_with_template() -> (CampaignService, Arc<MemoryStore>, Arc<MemoryJobQueue>, i64)
    {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new(RetryPolicy::default()));
        let template = store
            .create_template(NewTemplate {
                name: "欢迎邮件".to_string(),
                channel: "email".to_string(),
                subject: Some("欢迎".to_string()),
                body: "你好，{name}".to_string(),
            })
            .await
            .unwrap();
        let service = CampaignService::new(store.clone(), queue.clone());
        (service, store, queue, template.id)
    }

    fn sample_campaign(template_id: Option<i64>, recipients: Vec<String>) -> NewCampaign {
        NewCampaign {
            name: "发布公告".to_string(),
            channel: "email".to_string(),
            recipients,
            template_id,
            scheduled_at: None,
            created_by: Some("ops".to_string()),
        }
    }

    #[tokio::test]
    async fn test_create_validates_input() {
        let (service, _store, _queue, template_id) = service_with_template().await;

        let err = service
            .create(sample_campaign(Some(template_id), vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let mut empty_name = sample_campaign(Some(template_id), vec!["a@x.com".to_string()]);
        empty_name.name = "  ".to_string();
        assert!(service.create(empty_name).await.is_err());
    }

    #[tokio::test]
    async fn test_start_fans_out_all_recipients() {
        let (service, _store, queue, template_id) = service_with_template().await;

        let recipients: Vec<String> = (0..120).map(|i| format!("user{i}@x.com")).collect();
        let campaign = service
            .create(sample_campaign(Some(template_id), recipients))
            .await
            .unwrap();

        let started = service.start(campaign.id).await.unwrap();
        assert_eq!(started.status, CampaignStatus::Running);
        assert_eq!(started.total_recipients, 120);
        assert_eq!(queue.depth().await.unwrap(), 120);

        // 入队的任务带活动与模板引用
        let leased = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(leased.job.campaign_id, Some(campaign.id));
        assert_eq!(leased.job.template_id, Some(template_id));
        assert_eq!(leased.job.subject.as_deref(), Some("欢迎"));

        // 二次启动被状态机拦下
        let err = service.start(campaign.id).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }

    #[tokio::test]
    async fn test_start_requires_template() {
        let (service, _store, _queue, _template_id) = service_with_template().await;

        let campaign = service
            .create(sample_campaign(None, vec!["a@x.com".to_string()]))
            .await
            .unwrap();
        let err = service.start(campaign.id).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_pause_resume_guards() {
        let (service, _store, _queue, template_id) = service_with_template().await;

        let campaign = service
            .create(sample_campaign(Some(template_id), vec!["a@x.com".to_string()]))
            .await
            .unwrap();

        // draft 不能暂停
        assert!(service.pause(campaign.id).await.is_err());

        service.start(campaign.id).await.unwrap();
        service.pause(campaign.id).await.unwrap();
        // 重复暂停被拦下
        assert!(service.pause(campaign.id).await.is_err());

        service.resume(campaign.id).await.unwrap();
        assert!(service.resume(campaign.id).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_only_draft() {
        let (service, _store, _queue, template_id) = service_with_template().await;

        let campaign = service
            .create(sample_campaign(Some(template_id), vec!["a@x.com".to_string()]))
            .await
            .unwrap();
        service.start(campaign.id).await.unwrap();
        assert!(service.delete(campaign.id).await.is_err());

        let draft = service
            .create(sample_campaign(Some(template_id), vec!["b@x.com".to_string()]))
            .await
            .unwrap();
        service.delete(draft.id).await.unwrap();
        assert!(service.progress(draft.id).await.is_err());
    }

    #[test]
    fn test_settled_percent_large_totals() {
        // 千万级收件人规模下 i32 乘法会溢出,比例计算必须走 i64
        assert_eq!(settled_percent(21_000_000, 22_000_000), 95);
        assert_eq!(settled_percent(30_000_000, 30_000_000), 100);
        assert_eq!(settled_percent(0, 0), 0);
        assert_eq!(settled_percent(1, 3), 33);
    }

    #[tokio::test]
    async fn test_progress_percent() {
        let (service, store, _queue, template_id) = service_with_template().await;

        let campaign = service
            .create(sample_campaign(
                Some(template_id),
                vec!["a@x.com".to_string(), "b@x.com".to_string()],
            ))
            .await
            .unwrap();
        service.start(campaign.id).await.unwrap();

        store
            .record_campaign_outcome(campaign.id, crate::store::CampaignOutcome::Success)
            .await
            .unwrap();

        let progress = service.progress(campaign.id).await.unwrap();
        assert_eq!(progress.total_recipients, 2);
        assert_eq!(progress.success_count, 1);
        assert_eq!(progress.percent, 50);
    }
}
