//! 通知调度引擎
//!
//! 接收通知提交(立即或定时),经任务队列由 worker 池投递到
//! 各渠道,调度器负责定时提升、活动完成判定与保留期清理。

pub mod campaign;
pub mod queue;
pub mod scheduler;
pub mod sender;
pub mod service;
pub mod store;
pub mod worker;
