//! 调度引擎集成测试
//!
//! 用内存队列与内存存储搭建完整链路(提交 -> 队列 -> worker ->
//! 日志/回写 -> 巡检),验证端到端行为与并发不变量。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;

use courier_shared::config::SchedulerConfig;
use courier_shared::model::{CampaignStatus, Channel, DeliveryStatus, ScheduledStatus};
use courier_shared::retry::RetryPolicy;

use dispatch_engine::campaign::CampaignService;
use dispatch_engine::queue::{JobQueue, MemoryJobQueue};
use dispatch_engine::scheduler::Scheduler;
use dispatch_engine::sender::{
    ChannelSender, DeliveryReceipt, EmailSender, SendError, SenderRegistry,
};
use dispatch_engine::service::{DispatchService, JobState, SubmitOutcome, SubmitRequest};
use dispatch_engine::store::{DispatchStore, MemoryStore, NewCampaign, NewTemplate};
use dispatch_engine::worker::WorkerPool;

// ============================================================================
// 测试辅助
// ============================================================================

/// 按收件人脚本返回结果的发送器
///
/// 脚本值为该收件人成功前需要失败的次数,u32::MAX 表示永远失败。
struct ScriptedSender {
    channel: Channel,
    script: HashMap<String, u32>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedSender {
    fn new(channel: Channel, script: HashMap<String, u32>) -> Self {
        Self {
            channel,
            script,
            calls: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ChannelSender for ScriptedSender {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn name(&self) -> &str {
        "scripted"
    }

    async fn deliver<'a>(
        &self,
        recipient: &str,
        _message: &str,
        _subject: Option<&'a str>,
    ) -> Result<DeliveryReceipt, SendError> {
        let failures_needed = self.script.get(recipient).copied().unwrap_or(0);
        let call = {
            let mut calls = self.calls.lock();
            let entry = calls.entry(recipient.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        if call <= failures_needed {
            Err(SendError::Provider {
                reason: "服务商暂时不可用".to_string(),
            })
        } else {
            Ok(DeliveryReceipt::new(format!("msg_{recipient}_{call}")))
        }
    }
}

/// 以固定概率随机失败的发送器,用于并发压测
struct RandomSender {
    failure_rate: f64,
    deliveries: AtomicU32,
}

impl RandomSender {
    fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate,
            deliveries: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ChannelSender for RandomSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn name(&self) -> &str {
        "random"
    }

    async fn deliver<'a>(
        &self,
        _recipient: &str,
        _message: &str,
        _subject: Option<&'a str>,
    ) -> Result<DeliveryReceipt, SendError> {
        let roll: f64 = rand::rng().random();
        if roll < self.failure_rate {
            Err(SendError::Provider {
                reason: "随机故障".to_string(),
            })
        } else {
            self.deliveries.fetch_add(1, Ordering::SeqCst);
            Ok(DeliveryReceipt::new("msg_random"))
        }
    }
}

fn zero_delay_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        multiplier: 2.0,
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryJobQueue>,
    pool: WorkerPool,
}

impl Harness {
    fn new(sender: Arc<dyn ChannelSender>, max_attempts: u32, concurrency: usize) -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new(zero_delay_policy(max_attempts)));
        let registry = SenderRegistry::new().register(sender);
        let pool = WorkerPool::new(
            queue.clone(),
            store.clone(),
            registry,
            concurrency,
            Duration::from_millis(5),
        );
        Self { store, queue, pool }
    }

    /// 单线程驱动 worker 直到队列清空
    async fn drain(&self) {
        while self.pool.process_next().await.unwrap() {}
    }
}

// ============================================================================
// 端到端场景
// ============================================================================

#[tokio::test]
async fn test_immediate_email_end_to_end() {
    let harness = Harness::new(Arc::new(EmailSender::with_defaults()), 3, 1);
    let service = DispatchService::new(harness.store.clone(), harness.queue.clone());

    let outcome = service
        .submit(SubmitRequest {
            recipient: "user@example.com".to_string(),
            channel: "email".to_string(),
            body: Some("欢迎加入".to_string()),
            subject: Some("欢迎".to_string()),
            template_id: None,
            send_at: None,
            user_id: Some("user-001".to_string()),
            metadata: HashMap::new(),
        })
        .await
        .unwrap();

    let SubmitOutcome::Queued { job_id } = outcome else {
        panic!("应走立即路径");
    };

    harness.drain().await;

    let view = service.job_status(job_id).await.unwrap();
    assert_eq!(view.state, JobState::Delivered);
    assert_eq!(view.attempts, 1);

    let logs = harness.store.delivery_logs_for_job(job_id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, DeliveryStatus::Success);
    assert!(logs[0].delivered_at.is_some());
}

#[tokio::test]
async fn test_unknown_channel_terminal_failure() {
    let harness = Harness::new(Arc::new(EmailSender::with_defaults()), 3, 1);
    let service = DispatchService::new(harness.store.clone(), harness.queue.clone());

    let SubmitOutcome::Queued { job_id } = service
        .submit(SubmitRequest {
            recipient: "13800138000".to_string(),
            channel: "fax".to_string(),
            body: Some("测试".to_string()),
            subject: None,
            template_id: None,
            send_at: None,
            user_id: None,
            metadata: HashMap::new(),
        })
        .await
        .unwrap()
    else {
        panic!("应走立即路径");
    };

    harness.drain().await;

    // 首次尝试即终态失败,没有重试
    let view = service.job_status(job_id).await.unwrap();
    assert_eq!(view.state, JobState::Failed);
    assert_eq!(view.attempts, 1);
    assert!(view.last_error.unwrap().contains("fax"));

    let logs = harness.store.delivery_logs_for_job(job_id).await.unwrap();
    assert_eq!(logs.len(), 1);
}

#[tokio::test]
async fn test_retry_until_success_logs_every_attempt() {
    let script = HashMap::from([("flaky@x.com".to_string(), 2u32)]);
    let harness = Harness::new(
        Arc::new(ScriptedSender::new(Channel::Email, script)),
        3,
        1,
    );
    let service = DispatchService::new(harness.store.clone(), harness.queue.clone());

    let SubmitOutcome::Queued { job_id } = service
        .submit(SubmitRequest {
            recipient: "flaky@x.com".to_string(),
            channel: "email".to_string(),
            body: Some("重试测试".to_string()),
            subject: None,
            template_id: None,
            send_at: None,
            user_id: None,
            metadata: HashMap::new(),
        })
        .await
        .unwrap()
    else {
        panic!("应走立即路径");
    };

    harness.drain().await;

    // 2 次失败 + 1 次成功,每次尝试一条日志,attempt 连续递增
    let logs = harness.store.delivery_logs_for_job(job_id).await.unwrap();
    assert_eq!(logs.len(), 3);
    for (i, log) in logs.iter().enumerate() {
        assert_eq!(log.attempt, (i + 1) as i32);
    }
    assert_eq!(logs[2].status, DeliveryStatus::Success);

    let view = service.job_status(job_id).await.unwrap();
    assert_eq!(view.state, JobState::Delivered);
}

// ============================================================================
// 定时通知与巡检
// ============================================================================

#[tokio::test]
async fn test_scheduled_promotion_and_delivery() {
    let harness = Harness::new(Arc::new(EmailSender::with_defaults()), 3, 1);
    let service = DispatchService::new(harness.store.clone(), harness.queue.clone());
    let scheduler = Scheduler::new(
        harness.store.clone(),
        harness.queue.clone(),
        SchedulerConfig::default(),
    );

    // 提交一条已到期的定时通知(send_at 在未来才走定时路径,
    // 这里直接落库后把时间拨回过去)
    let SubmitOutcome::Scheduled { scheduled_id } = service
        .submit(SubmitRequest {
            recipient: "later@x.com".to_string(),
            channel: "email".to_string(),
            body: Some("定时消息".to_string()),
            subject: None,
            template_id: None,
            send_at: Some(Utc::now() + chrono::Duration::milliseconds(50)),
            user_id: None,
            metadata: HashMap::new(),
        })
        .await
        .unwrap()
    else {
        panic!("应走定时路径");
    };

    // 到期前提升巡检不应动它
    assert_eq!(scheduler.promote_due().await.unwrap(), 0);
    assert_eq!(
        service.scheduled_status(scheduled_id).await.unwrap().status,
        ScheduledStatus::Pending
    );

    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(scheduler.promote_due().await.unwrap(), 1);
    assert_eq!(
        service.scheduled_status(scheduled_id).await.unwrap().status,
        ScheduledStatus::Queued
    );

    harness.drain().await;

    assert_eq!(
        service.scheduled_status(scheduled_id).await.unwrap().status,
        ScheduledStatus::Sent
    );
}

#[tokio::test]
async fn test_cancel_before_promotion_prevents_delivery() {
    let harness = Harness::new(Arc::new(EmailSender::with_defaults()), 3, 1);
    let service = DispatchService::new(harness.store.clone(), harness.queue.clone());
    let scheduler = Scheduler::new(
        harness.store.clone(),
        harness.queue.clone(),
        SchedulerConfig::default(),
    );

    let SubmitOutcome::Scheduled { scheduled_id } = service
        .submit(SubmitRequest {
            recipient: "later@x.com".to_string(),
            channel: "email".to_string(),
            body: Some("定时消息".to_string()),
            subject: None,
            template_id: None,
            send_at: Some(Utc::now() + chrono::Duration::milliseconds(10)),
            user_id: None,
            metadata: HashMap::new(),
        })
        .await
        .unwrap()
    else {
        panic!("应走定时路径");
    };

    service.cancel_scheduled(scheduled_id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(scheduler.promote_due().await.unwrap(), 0);
    assert_eq!(harness.queue.depth().await.unwrap(), 0);
    assert_eq!(
        service.scheduled_status(scheduled_id).await.unwrap().status,
        ScheduledStatus::Cancelled
    );
}

// ============================================================================
// 活动链路
// ============================================================================

#[tokio::test]
async fn test_campaign_end_to_end_with_mixed_outcomes() {
    // 3 个收件人:2 个成功,1 个重试耗尽后终态失败
    let script = HashMap::from([
        ("ok1@x.com".to_string(), 0u32),
        ("ok2@x.com".to_string(), 1u32),
        ("bad@x.com".to_string(), u32::MAX),
    ]);
    let harness = Harness::new(
        Arc::new(ScriptedSender::new(Channel::Email, script)),
        3,
        1,
    );
    let campaigns = CampaignService::new(harness.store.clone(), harness.queue.clone());
    let scheduler = Scheduler::new(
        harness.store.clone(),
        harness.queue.clone(),
        SchedulerConfig::default(),
    );

    let template = harness
        .store
        .create_template(NewTemplate {
            name: "通知".to_string(),
            channel: "email".to_string(),
            subject: Some("通知".to_string()),
            body: "活动内容".to_string(),
        })
        .await
        .unwrap();

    let campaign = campaigns
        .create(NewCampaign {
            name: "混合结果活动".to_string(),
            channel: "email".to_string(),
            recipients: vec![
                "ok1@x.com".to_string(),
                "ok2@x.com".to_string(),
                "bad@x.com".to_string(),
            ],
            template_id: Some(template.id),
            scheduled_at: None,
            created_by: None,
        })
        .await
        .unwrap();

    campaigns.start(campaign.id).await.unwrap();
    assert_eq!(harness.queue.depth().await.unwrap(), 3);

    // 投递未完成前,完成巡检不应翻转状态
    assert_eq!(scheduler.sweep_completions().await.unwrap(), 0);

    harness.drain().await;

    let progress = campaigns.progress(campaign.id).await.unwrap();
    assert_eq!(progress.success_count, 2);
    assert_eq!(progress.failure_count, 1);
    assert_eq!(progress.percent, 100);
    assert_eq!(progress.status, CampaignStatus::Running);

    // 完成状态只由巡检翻转
    assert_eq!(scheduler.sweep_completions().await.unwrap(), 1);
    let done = harness.store.get_campaign(campaign.id).await.unwrap();
    assert_eq!(done.status, CampaignStatus::Completed);
    assert!(done.completed_at.is_some());
}

// ============================================================================
// 并发不变量
// ============================================================================

/// 100 个收件人、5 个并发 worker、随机失败:
/// 运行中任意时刻 success + failure 不超过总数,清空后恰好等于总数。
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_campaign_counters_under_concurrency() {
    const TOTAL: usize = 100;

    let sender = Arc::new(RandomSender::new(0.3));
    let harness = Harness::new(sender.clone(), 3, 5);
    let campaigns = CampaignService::new(harness.store.clone(), harness.queue.clone());

    let template = harness
        .store
        .create_template(NewTemplate {
            name: "压测".to_string(),
            channel: "email".to_string(),
            subject: None,
            body: "压测内容".to_string(),
        })
        .await
        .unwrap();

    let recipients: Vec<String> = (0..TOTAL).map(|i| format!("user{i}@x.com")).collect();
    let campaign = campaigns
        .create(NewCampaign {
            name: "并发压测".to_string(),
            channel: "email".to_string(),
            recipients,
            template_id: Some(template.id),
            scheduled_at: None,
            created_by: None,
        })
        .await
        .unwrap();
    campaigns.start(campaign.id).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = harness.pool.run(shutdown_rx);

    // 运行过程中持续采样计数不变量
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let c = harness.store.get_campaign(campaign.id).await.unwrap();
        let settled = c.success_count + c.failure_count;
        assert!(
            settled <= TOTAL as i32,
            "计数超过总数: success={} failure={}",
            c.success_count,
            c.failure_count
        );

        if harness.queue.depth().await.unwrap() == 0 && settled == TOTAL as i32 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "队列在限时内未清空"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let _ = shutdown_tx.send(true);
    for handle in handles {
        handle.await.unwrap();
    }

    let c = harness.store.get_campaign(campaign.id).await.unwrap();
    assert_eq!(c.success_count + c.failure_count, TOTAL as i32);
    assert!(c.success_count > 0, "随机失败率 0.3 下不应全军覆没");

    // 发送器侧的成功次数与活动成功计数一致,说明每个任务只计一次
    assert_eq!(
        sender.deliveries.load(Ordering::SeqCst) as i32,
        c.success_count
    );
}

// ============================================================================
// 数据库后端冒烟
// ============================================================================

/// Postgres 后端完整链路:提交 -> 租约出队 -> 投递 -> 日志落库
#[tokio::test]
#[ignore = "需要 PostgreSQL 数据库连接"]
async fn test_postgres_backend_smoke() {
    use courier_shared::config::DatabaseConfig;
    use courier_shared::database::Database;
    use dispatch_engine::queue::PgJobQueue;
    use dispatch_engine::store::PgStore;

    let mut config = DatabaseConfig::default();
    if let Ok(url) = std::env::var("DATABASE_URL") {
        config.url = url;
    }
    let db = Database::connect(&config)
        .await
        .expect("无法连接数据库,请确保 PostgreSQL 正在运行");
    db.run_migrations().await.unwrap();

    let store: Arc<dyn DispatchStore> = Arc::new(PgStore::new(db.pool().clone()));
    let queue = Arc::new(PgJobQueue::new(
        db.pool().clone(),
        zero_delay_policy(3),
        Duration::from_secs(300),
    ));
    let service = DispatchService::new(store.clone(), queue.clone());

    // 唯一收件人避免与历史测试数据冲突
    let recipient = format!("smoke_{}@example.com", Utc::now().timestamp_millis());
    let SubmitOutcome::Queued { job_id } = service
        .submit(SubmitRequest {
            recipient,
            channel: "email".to_string(),
            body: Some("冒烟测试".to_string()),
            subject: Some("冒烟".to_string()),
            template_id: None,
            send_at: None,
            user_id: None,
            metadata: HashMap::new(),
        })
        .await
        .unwrap()
    else {
        panic!("应走立即路径");
    };

    let registry = SenderRegistry::new().register(Arc::new(EmailSender::with_defaults()));
    let pool = WorkerPool::new(
        queue.clone(),
        store.clone(),
        registry,
        1,
        Duration::from_millis(5),
    );
    // 清空队列(共享库中可能残留其他运行的任务)
    while pool.process_next().await.unwrap() {}

    let view = service.job_status(job_id).await.unwrap();
    assert_eq!(view.state, JobState::Delivered);

    let logs = store.delivery_logs_for_job(job_id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, DeliveryStatus::Success);

    db.close().await;
}
