//! 轮询策略与时钟
//!
//! PollPolicy 把「每隔 poll_interval 查询一次，最多等 max_wait_time」表达为有上限的尝试次数；
//! Clock 抽象出 now / sleep，生产环境用 TokioClock，测试用 ManualClock 推进虚拟时间。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// 时钟：当前时间与挂起等待
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// 基于 tokio 定时器的真实时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// 虚拟时钟：sleep 立即返回并把时间向前推进，用于确定性测试
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
    sleeps: AtomicUsize,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            sleeps: AtomicUsize::new(0),
        }
    }

    /// 自创建以来推进的虚拟时间
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 手动推进时间
    pub fn advance(&self, duration: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += duration;
    }

    pub fn sleep_count(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// 轮询策略：固定间隔、墙钟上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub poll_interval: Duration,
    pub max_wait_time: Duration,
}

impl PollPolicy {
    /// poll_interval 为 0 时按 1ms 处理，避免忙等与除零
    pub fn new(poll_interval: Duration, max_wait_time: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            max_wait_time,
        }
    }

    /// 状态查询次数上限：floor(max_wait_time / poll_interval) + 1
    pub fn max_attempts(&self) -> usize {
        let interval = self.poll_interval.as_nanos().max(1);
        (self.max_wait_time.as_nanos() / interval) as usize + 1
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(600))
    }
}
