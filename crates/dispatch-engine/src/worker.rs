//! 投递 worker 池
//!
//! 固定数量的 worker 并发从队列拉取任务执行投递。
//! 每次尝试恰好写一条投递日志;终态结果回写定时通知状态
//! 与活动计数,可重试失败交还队列按退避重投。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use courier_shared::error::Result;
use courier_shared::model::{Channel, DeliveryStatus, NotificationJob};
use courier_shared::observability::metrics;

use crate::queue::{JobQueue, LeasedJob, RequeueDecision};
use crate::sender::{SenderRegistry, SendError};
use crate::store::{CampaignOutcome, DispatchStore, NewDeliveryLog};

/// 单次尝试的结果分类
enum AttemptOutcome {
    /// 投递成功,任务终态完成
    Delivered,
    /// 可重试失败,交还队列决定重投或丢弃
    RetryableFailure(String),
    /// 永久失败,首次即终态(未知渠道、无效收件人)
    FatalFailure(String),
}

/// 投递 worker 池
///
/// `run` 按配置的并发度启动 worker 循环,所有循环共享同一个
/// 队列与存储。克隆是浅拷贝,worker 之间通过队列租约互斥。
#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn DispatchStore>,
    senders: SenderRegistry,
    concurrency: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn DispatchStore>,
        senders: SenderRegistry,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            senders,
            concurrency,
            poll_interval,
        }
    }

    /// 启动全部 worker,返回各自的 JoinHandle
    pub fn run(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            concurrency = self.concurrency,
            poll_interval = ?self.poll_interval,
            "worker 池已启动"
        );

        (0..self.concurrency)
            .map(|worker_id| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    pool.worker_loop(worker_id, shutdown).await;
                })
            })
            .collect()
    }

    /// 单个 worker 的主循环,直到收到关闭信号
    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                // 偏向关闭信号，保证收到关闭时能尽快退出
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker_id, "收到关闭信号，worker 退出");
                        break;
                    }
                }

                _ = tokio::time::sleep(self.poll_interval) => {
                    // 连续拉取直到队列暂时为空,期间随时响应关闭
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        match self.process_next().await {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => {
                                error!(worker_id, error = %e, "任务处理出错");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// 拉取并处理一个任务,返回是否处理了任务
    ///
    /// 独立暴露,便于测试确定性地逐个驱动任务。
    pub async fn process_next(&self) -> Result<bool> {
        let leased = match self.queue.dequeue().await? {
            Some(l) => l,
            None => return Ok(false),
        };

        self.process(&leased).await?;
        Ok(true)
    }

    async fn process(&self, leased: &LeasedJob) -> Result<()> {
        let job = &leased.job;
        let start = Instant::now();

        let outcome = self.attempt_delivery(job).await;
        let duration = start.elapsed().as_secs_f64();

        match outcome {
            AttemptOutcome::Delivered => {
                self.write_log(job, DeliveryStatus::Success, None).await;
                metrics::record_delivery(&job.channel, "success", duration);

                self.queue.ack(leased).await?;
                self.finalize_success(job).await;
            }
            AttemptOutcome::RetryableFailure(reason) => {
                self.write_log(job, DeliveryStatus::Failed, Some(&reason)).await;
                metrics::record_delivery(&job.channel, "failed", duration);

                match self.queue.retry(leased).await? {
                    RequeueDecision::Requeued { delay } => {
                        warn!(
                            job_id = %job.id,
                            attempt = job.attempts,
                            delay_secs = delay.as_secs(),
                            reason = %reason,
                            "投递失败，已按退避重新入队"
                        );
                    }
                    RequeueDecision::Dropped => {
                        warn!(
                            job_id = %job.id,
                            attempts = job.attempts,
                            reason = %reason,
                            "重试次数耗尽，任务终态失败"
                        );
                        self.finalize_failure(job, &reason).await;
                    }
                }
            }
            AttemptOutcome::FatalFailure(reason) => {
                self.write_log(job, DeliveryStatus::Failed, Some(&reason)).await;
                metrics::record_delivery(&job.channel, "failed", duration);

                warn!(job_id = %job.id, reason = %reason, "永久失败，不进入重试");
                self.queue.ack(leased).await?;
                self.finalize_failure(job, &reason).await;
            }
        }

        Ok(())
    }

    /// 执行一次投递尝试并分类结果
    async fn attempt_delivery(&self, job: &NotificationJob) -> AttemptOutcome {
        // 渠道在这里才解析,非法渠道值走永久失败路径
        let channel: Channel = match job.parse_channel() {
            Ok(c) => c,
            Err(e) => return AttemptOutcome::FatalFailure(e.to_string()),
        };

        let sender = match self.senders.get(channel) {
            Some(s) => s,
            None => {
                return AttemptOutcome::FatalFailure(format!("渠道 {channel} 未注册发送器"));
            }
        };

        match sender
            .deliver(&job.recipient, &job.body, job.subject.as_deref())
            .await
        {
            Ok(receipt) => {
                info!(
                    job_id = %job.id,
                    channel = %channel,
                    message_id = %receipt.provider_message_id,
                    attempt = job.attempts,
                    "投递成功"
                );
                AttemptOutcome::Delivered
            }
            Err(e @ SendError::InvalidRecipient { .. }) => {
                AttemptOutcome::FatalFailure(e.to_string())
            }
            Err(e) => AttemptOutcome::RetryableFailure(e.to_string()),
        }
    }

    /// 写一条尝试日志
    ///
    /// 日志写入失败不影响投递结果,只告警并记指标。
    async fn write_log(&self, job: &NotificationJob, status: DeliveryStatus, error: Option<&str>) {
        let log = NewDeliveryLog::for_attempt(job, status, error.map(str::to_string));
        if let Err(e) = self.store.insert_delivery_log(log).await {
            warn!(job_id = %job.id, error = %e, "投递日志写入失败");
            metrics::record_log_write_failure();
        }
    }

    /// 成功终态的回写:定时通知置 sent,活动成功数加一
    async fn finalize_success(&self, job: &NotificationJob) {
        if let Some(scheduled_id) = job.scheduled_id {
            match self.store.mark_scheduled_sent(scheduled_id).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(job_id = %job.id, scheduled_id, "定时通知已不在 queued 状态，跳过回写");
                }
                Err(e) => warn!(job_id = %job.id, scheduled_id, error = %e, "定时通知回写失败"),
            }
        }

        if let Some(campaign_id) = job.campaign_id {
            if let Err(e) = self
                .store
                .record_campaign_outcome(campaign_id, CampaignOutcome::Success)
                .await
            {
                warn!(job_id = %job.id, campaign_id, error = %e, "活动计数更新失败");
            }
        }
    }

    /// 失败终态的回写:定时通知置 failed,活动失败数加一
    ///
    /// 只在任务真正终结时调用——重投路径上不做任何回写,
    /// 保证每个任务对活动计数至多贡献一次。
    async fn finalize_failure(&self, job: &NotificationJob, reason: &str) {
        if let Some(scheduled_id) = job.scheduled_id {
            match self.store.mark_scheduled_failed(scheduled_id, reason).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(job_id = %job.id, scheduled_id, "定时通知已到终态，跳过失败回写");
                }
                Err(e) => warn!(job_id = %job.id, scheduled_id, error = %e, "定时通知回写失败"),
            }
        }

        if let Some(campaign_id) = job.campaign_id {
            if let Err(e) = self
                .store
                .record_campaign_outcome(campaign_id, CampaignOutcome::Failure)
                .await
            {
                warn!(job_id = %job.id, campaign_id, error = %e, "活动计数更新失败");
            }
        }
    }
}
