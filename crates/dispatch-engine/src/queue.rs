//! 任务队列
//!
//! 租约式队列:出队即租约,worker 处理完成后显式 ack,
//! 可重试失败通过 `retry` 按退避策略重新入队,超过上限则丢弃。
//! 租约超时未 ack 的任务(worker 崩溃)会被重新投递。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::PgPool;
use sqlx::types::Json;
use tracing::warn;
use uuid::Uuid;

use courier_shared::error::Result;
use courier_shared::model::NotificationJob;
use courier_shared::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// 接口
// ---------------------------------------------------------------------------

/// 已出租的任务,attempts 在出租时已经递增
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: NotificationJob,
}

/// 重试入队的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueDecision {
    /// 已按退避延迟重新入队
    Requeued { delay: Duration },
    /// 尝试次数耗尽,任务被丢弃
    Dropped,
}

/// 任务队列接口
///
/// `dequeue` 为非阻塞语义:无可用任务时返回 `None`,
/// 由调用方按轮询间隔自行等待。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: NotificationJob) -> Result<()>;

    /// 取出一个到期任务并建立租约,同时把 attempts 加一
    async fn dequeue(&self) -> Result<Option<LeasedJob>>;

    /// 终态完成(成功或致命失败),释放租约并删除任务
    async fn ack(&self, leased: &LeasedJob) -> Result<()>;

    /// 可重试失败:未耗尽则按退避重新入队,否则丢弃
    async fn retry(&self, leased: &LeasedJob) -> Result<RequeueDecision>;

    /// 任务是否仍在队列中(就绪或在租),供状态查询使用
    async fn contains(&self, job_id: Uuid) -> Result<bool>;

    /// 队列深度(就绪 + 在租),供巡检指标和压测断言使用
    async fn depth(&self) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// Postgres 实现
// ---------------------------------------------------------------------------

/// 基于 Postgres 的队列实现
///
/// 出队在事务内用 `FOR UPDATE SKIP LOCKED` 抢占,多个 worker
/// 并发拉取时每条任务只会被一个 worker 拿到。
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    policy: RetryPolicy,
    lease_timeout: Duration,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    payload: Json<NotificationJob>,
    attempts: i32,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, policy: RetryPolicy, lease_timeout: Duration) -> Self {
        Self {
            pool,
            policy,
            lease_timeout,
        }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: NotificationJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_jobs (id, payload, status, attempts, next_attempt_at)
            VALUES ($1, $2, 'ready', $3, NOW())
            "#,
        )
        .bind(job.id)
        .bind(Json(&job))
        .bind(job.attempts as i32)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<LeasedJob>> {
        let mut tx = self.pool.begin().await?;

        // 就绪任务之外,把租约过期的任务(worker 崩溃未 ack)一并纳入抢占范围
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, payload, attempts
            FROM notification_jobs
            WHERE (status = 'ready' AND next_attempt_at <= NOW())
               OR (status = 'leased' AND leased_at < NOW() - $1::interval)
            ORDER BY next_attempt_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .bind(format!("{} seconds", self.lease_timeout.as_secs()))
        .fetch_optional(&mut *tx)
        .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        sqlx::query(
            r#"
            UPDATE notification_jobs
            SET status = 'leased', leased_at = NOW(), attempts = attempts + 1
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut job = row.payload.0;
        job.attempts = (row.attempts + 1) as u32;
        Ok(Some(LeasedJob { job }))
    }

    async fn ack(&self, leased: &LeasedJob) -> Result<()> {
        sqlx::query("DELETE FROM notification_jobs WHERE id = $1")
            .bind(leased.job.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retry(&self, leased: &LeasedJob) -> Result<RequeueDecision> {
        if self.policy.is_exhausted(leased.job.attempts) {
            sqlx::query("DELETE FROM notification_jobs WHERE id = $1")
                .bind(leased.job.id)
                .execute(&self.pool)
                .await?;
            return Ok(RequeueDecision::Dropped);
        }

        let delay = self.policy.delay_after_attempt(leased.job.attempts);
        let result = sqlx::query(
            r#"
            UPDATE notification_jobs
            SET status = 'ready', leased_at = NULL,
                next_attempt_at = NOW() + $2::interval
            WHERE id = $1 AND status = 'leased'
            "#,
        )
        .bind(leased.job.id)
        .bind(format!("{} seconds", delay.as_secs()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // 租约已被回收并重新投递,当前持有者放弃即可
            warn!(job_id = %leased.job.id, "重试入队时租约已失效");
        }

        Ok(RequeueDecision::Requeued { delay })
    }

    async fn contains(&self, job_id: Uuid) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM notification_jobs WHERE id = $1)")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn depth(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notification_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

// ---------------------------------------------------------------------------
// 内存实现
// ---------------------------------------------------------------------------

struct ReadyJob {
    job: NotificationJob,
    next_attempt_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryQueueState {
    ready: Vec<ReadyJob>,
    leased: HashMap<Uuid, NotificationJob>,
}

/// 内存队列实现,语义与 Postgres 版本一致(不含崩溃恢复)
pub struct MemoryJobQueue {
    state: Mutex<MemoryQueueState>,
    policy: RetryPolicy,
}

impl MemoryJobQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(MemoryQueueState::default()),
            policy,
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: NotificationJob) -> Result<()> {
        let mut state = self.state.lock();
        state.ready.push(ReadyJob {
            job,
            next_attempt_at: Utc::now(),
        });
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<LeasedJob>> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let idx = state
            .ready
            .iter()
            .enumerate()
            .filter(|(_, r)| r.next_attempt_at <= now)
            .min_by_key(|(_, r)| r.next_attempt_at)
            .map(|(i, _)| i);

        let idx = match idx {
            Some(i) => i,
            None => return Ok(None),
        };

        let mut entry = state.ready.swap_remove(idx);
        entry.job.attempts += 1;
        state.leased.insert(entry.job.id, entry.job.clone());
        Ok(Some(LeasedJob { job: entry.job }))
    }

    async fn ack(&self, leased: &LeasedJob) -> Result<()> {
        self.state.lock().leased.remove(&leased.job.id);
        Ok(())
    }

    async fn retry(&self, leased: &LeasedJob) -> Result<RequeueDecision> {
        let mut state = self.state.lock();
        state.leased.remove(&leased.job.id);

        if self.policy.is_exhausted(leased.job.attempts) {
            return Ok(RequeueDecision::Dropped);
        }

        let delay = self.policy.delay_after_attempt(leased.job.attempts);
        state.ready.push(ReadyJob {
            job: leased.job.clone(),
            next_attempt_at: Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
        });
        Ok(RequeueDecision::Requeued { delay })
    }

    async fn contains(&self, job_id: Uuid) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.leased.contains_key(&job_id)
            || state.ready.iter().any(|r| r.job.id == job_id))
    }

    async fn depth(&self) -> Result<u64> {
        let state = self.state.lock();
        Ok((state.ready.len() + state.leased.len()) as u64)
    }
}
