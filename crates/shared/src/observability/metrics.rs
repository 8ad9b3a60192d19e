//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过导出器自带的 HTTP 监听器暴露，供 Prometheus 抓取。

use std::net::SocketAddr;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use super::ObservabilityConfig;

/// 初始化 Prometheus 指标导出
///
/// 在指定端口启动 HTTP 监听器暴露 `/metrics` 端点。
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    register_common_metrics(&config.service_name);

    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

/// 注册通用指标（预定义的业务指标）
///
/// 这些描述会出现在 /metrics 端点的 HELP 注释中。
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "courier_deliveries_total",
        "Total delivery attempts by channel and outcome"
    );
    metrics::describe_histogram!(
        "courier_delivery_duration_seconds",
        "Delivery attempt duration in seconds"
    );

    metrics::describe_counter!(
        "courier_jobs_enqueued_total",
        "Total jobs enqueued by channel"
    );
    metrics::describe_counter!(
        "courier_log_write_failures_total",
        "Delivery log writes that failed (non-fatal)"
    );

    metrics::describe_counter!(
        "courier_sweep_runs_total",
        "Scheduler sweep executions by sweep and outcome"
    );
    metrics::describe_histogram!(
        "courier_sweep_duration_seconds",
        "Scheduler sweep duration in seconds"
    );
    metrics::describe_gauge!(
        "courier_sweep_last_run_timestamp",
        "Unix timestamp of the last run per sweep"
    );
    metrics::describe_counter!(
        "courier_retention_deleted_total",
        "Rows removed by the retention sweep, by entity"
    );

    metrics::describe_counter!(
        "courier_campaigns_completed_total",
        "Campaigns flipped to completed by the completion sweep"
    );

    // 记录服务启动
    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 记录一次投递尝试的结果
pub fn record_delivery(channel: &str, outcome: &str, duration_secs: f64) {
    metrics::counter!(
        "courier_deliveries_total",
        "channel" => channel.to_string(),
        "outcome" => outcome.to_string(),
    )
    .increment(1);
    metrics::histogram!(
        "courier_delivery_duration_seconds",
        "channel" => channel.to_string(),
    )
    .record(duration_secs);
}

/// 记录一次任务入队
pub fn record_enqueue(channel: &str) {
    metrics::counter!(
        "courier_jobs_enqueued_total",
        "channel" => channel.to_string(),
    )
    .increment(1);
}

/// 记录一次投递日志写入失败（非致命，仅上报）
pub fn record_log_write_failure() {
    metrics::counter!("courier_log_write_failures_total").increment(1);
}

/// 记录一次调度器扫描执行结果
pub fn record_sweep(sweep: &str, outcome: &str, duration_secs: f64) {
    metrics::counter!(
        "courier_sweep_runs_total",
        "sweep" => sweep.to_string(),
        "outcome" => outcome.to_string(),
    )
    .increment(1);
    metrics::histogram!(
        "courier_sweep_duration_seconds",
        "sweep" => sweep.to_string(),
    )
    .record(duration_secs);
}

/// 记录扫描的最近执行时间，供告警判断调度器是否存活
pub fn set_sweep_last_run(sweep: &str) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    metrics::gauge!(
        "courier_sweep_last_run_timestamp",
        "sweep" => sweep.to_string(),
    )
    .set(now);
}

/// 记录保留期清理删除的行数
pub fn record_retention_deleted(entity: &str, count: u64) {
    metrics::counter!(
        "courier_retention_deleted_total",
        "entity" => entity.to_string(),
    )
    .increment(count);
}

/// 记录一次活动完成
pub fn record_campaign_completed() {
    metrics::counter!("courier_campaigns_completed_total").increment(1);
}
