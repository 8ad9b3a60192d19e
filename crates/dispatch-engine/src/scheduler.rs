//! 调度器
//!
//! 三个相互独立的巡检循环:
//! - 提升巡检:把到期的 pending 定时通知转成队列任务
//! - 完成巡检:把已全部终结的 running 活动置为 completed
//! - 保留期巡检:清理超过保留期的终态日志与定时通知
//!
//! 单次巡检出错只记录日志,不影响后续轮次。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use courier_shared::config::SchedulerConfig;
use courier_shared::error::Result;
use courier_shared::observability::metrics;

use crate::queue::JobQueue;
use crate::store::DispatchStore;

/// 调度器
pub struct Scheduler {
    store: Arc<dyn DispatchStore>,
    queue: Arc<dyn JobQueue>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        queue: Arc<dyn JobQueue>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// 启动三个巡检循环,返回各自的 JoinHandle
    pub fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            promotion_interval = self.config.promotion_interval_seconds,
            completion_interval = self.config.completion_interval_seconds,
            retention_interval = self.config.retention_interval_seconds,
            retention_days = self.config.retention_days,
            "调度器已启动"
        );

        let promotion = {
            let scheduler = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                scheduler.promotion_loop(shutdown).await;
            })
        };
        let completion = {
            let scheduler = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                scheduler.completion_loop(shutdown).await;
            })
        };
        let retention = tokio::spawn(async move {
            self.retention_loop(shutdown).await;
        });

        vec![promotion, completion, retention]
    }

    async fn promotion_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.promotion_interval_seconds);
        loop {
            tokio::select! {
                // 偏向关闭信号，保证收到关闭时能尽快退出
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，提升巡检退出");
                        break;
                    }
                }

                _ = tokio::time::sleep(interval) => {
                    let start = Instant::now();
                    let outcome = match self.promote_due().await {
                        Ok(_) => "success",
                        Err(e) => {
                            error!(error = %e, "提升巡检出错");
                            "error"
                        }
                    };
                    metrics::record_sweep("promotion", outcome, start.elapsed().as_secs_f64());
                    metrics::set_sweep_last_run("promotion");
                }
            }
        }
    }

    async fn completion_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.completion_interval_seconds);
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，完成巡检退出");
                        break;
                    }
                }

                _ = tokio::time::sleep(interval) => {
                    let start = Instant::now();
                    let outcome = match self.sweep_completions().await {
                        Ok(_) => "success",
                        Err(e) => {
                            error!(error = %e, "完成巡检出错");
                            "error"
                        }
                    };
                    metrics::record_sweep("completion", outcome, start.elapsed().as_secs_f64());
                    metrics::set_sweep_last_run("completion");
                }
            }
        }
    }

    async fn retention_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.retention_interval_seconds);
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，保留期巡检退出");
                        break;
                    }
                }

                _ = tokio::time::sleep(interval) => {
                    let start = Instant::now();
                    let outcome = match self.sweep_retention().await {
                        Ok(_) => "success",
                        Err(e) => {
                            error!(error = %e, "保留期清理出错");
                            "error"
                        }
                    };
                    metrics::record_sweep("retention", outcome, start.elapsed().as_secs_f64());
                    metrics::set_sweep_last_run("retention");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // 提升巡检
    // -----------------------------------------------------------------------

    /// 认领到期的定时通知并入队,返回提升条数
    ///
    /// 认领在存储层原子完成(pending -> queued),之后的并发取消会被
    /// 守卫拒绝,不会出现已取消记录仍被投递的情况。按批循环直到
    /// 当前到期集合处理完。入队失败的记录置为 failed,失败原因写入
    /// metadata,不阻塞同批其它记录。
    pub async fn promote_due(&self) -> Result<u64> {
        let batch_size = self.config.promotion_batch_size;
        let mut promoted = 0u64;

        loop {
            let now = Utc::now();
            let claimed = self.store.claim_due_scheduled(now, batch_size).await?;
            let batch_len = claimed.len();

            for record in claimed {
                let job = record.to_job();
                match self.queue.enqueue(job).await {
                    Ok(()) => {
                        metrics::record_enqueue(&record.channel);
                        promoted += 1;
                    }
                    Err(e) => {
                        // 入队的基础设施故障,已认领的记录回落为 failed
                        error!(scheduled_id = record.id, error = %e, "定时通知入队失败");
                        if let Err(mark_err) = self
                            .store
                            .mark_scheduled_failed(record.id, &e.to_string())
                            .await
                        {
                            error!(
                                scheduled_id = record.id,
                                error = %mark_err,
                                "入队失败后状态回写失败"
                            );
                        }
                    }
                }
            }

            if batch_len < batch_size as usize {
                break;
            }
        }

        if promoted > 0 {
            info!(promoted, "提升巡检完成");
        }
        Ok(promoted)
    }

    // -----------------------------------------------------------------------
    // 完成巡检
    // -----------------------------------------------------------------------

    /// 检查 running 活动是否已全部终结,返回置为 completed 的数量
    ///
    /// 完成条件:名下没有未终结的定时通知,且成功数 + 失败数
    /// 达到总收件人数。完成状态只由这里翻转,worker 不参与判定。
    pub async fn sweep_completions(&self) -> Result<u64> {
        let mut completed = 0u64;

        for campaign in self.store.running_campaigns().await? {
            let outstanding = self.store.outstanding_scheduled(campaign.id).await?;
            let settled = campaign.success_count + campaign.failure_count;

            if outstanding > 0 || settled < campaign.total_recipients {
                continue;
            }

            if self.store.complete_campaign(campaign.id, Utc::now()).await? {
                info!(
                    campaign_id = campaign.id,
                    success = campaign.success_count,
                    failure = campaign.failure_count,
                    total = campaign.total_recipients,
                    "活动已完成"
                );
                metrics::record_campaign_completed();
                completed += 1;
            }
        }

        Ok(completed)
    }

    // -----------------------------------------------------------------------
    // 保留期巡检
    // -----------------------------------------------------------------------

    /// 清理超过保留期的终态记录,返回(日志删除数, 定时通知删除数)
    pub async fn sweep_retention(&self) -> Result<(u64, u64)> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days);

        let logs_deleted = self.store.delete_terminal_logs_before(cutoff).await?;
        let scheduled_deleted = self.store.delete_terminal_scheduled_before(cutoff).await?;

        if logs_deleted > 0 || scheduled_deleted > 0 {
            info!(logs_deleted, scheduled_deleted, %cutoff, "保留期清理完成");
        }
        metrics::record_retention_deleted("delivery_log", logs_deleted);
        metrics::record_retention_deleted("scheduled_notification", scheduled_deleted);

        Ok((logs_deleted, scheduled_deleted))
    }
}
