use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;

/// 取消原语：多个任务共享同一原子位。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 连接上的每个挂起点（建连、读、flush、握手）都需要可被外部中止；
///   用一个原子布尔即可在任务之间传播“停止”信号，无需引入调度器相关的回调。
///
/// ## 契约（What）
/// - `cancel` 首次成功返回 `true`，重复调用返回 `false`；
/// - `child` 与父令牌共享同一原子位。
///
/// ## 风险与权衡（Trade-offs）
/// - 框架以轮询方式观察取消位，存在毫秒级响应延迟。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询当前是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// 将令牌标记为取消。
    pub fn cancel(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 派生共享同一原子位的子令牌。
    pub fn child(&self) -> Self {
        self.clone()
    }
}

/// 操作的最迟完成时间；`None` 表示不设硬超时。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadline {
    instant: Option<Instant>,
}

impl Deadline {
    pub const fn none() -> Self {
        Self { instant: None }
    }

    pub fn at(instant: Instant) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    /// 以当前时间为起点加上 `timeout`。
    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    pub fn instant(&self) -> Option<Instant> {
        self.instant
    }

    pub fn is_expired(&self) -> bool {
        match self.instant {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// 距离截止时间的剩余时长；已过期时为零。
    pub fn remaining(&self) -> Option<Duration> {
        self.instant
            .map(|instant| instant.saturating_duration_since(Instant::now()))
    }
}

/// 调用上下文：聚合取消令牌与截止时间，随每个挂起操作传入。
///
/// `CallContext` 克隆成本为常数，多个连接可共享同一个上下文，
/// 以便服务端在关停时一次性取消所有挂起操作。
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    inner: Arc<CallContextInner>,
}

#[derive(Debug, Default)]
struct CallContextInner {
    cancellation: Cancellation,
    deadline: Deadline,
}

impl CallContext {
    pub fn builder() -> CallContextBuilder {
        CallContextBuilder::default()
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.inner.cancellation
    }

    pub fn deadline(&self) -> Deadline {
        self.inner.deadline
    }
}

impl fmt::Display for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let deadline = match self.deadline().remaining() {
            Some(remaining) => format!("{remaining:?}"),
            None => "none".to_string(),
        };
        write!(
            f,
            "CallContext{{cancelled={}, deadline={}}}",
            self.cancellation().is_cancelled(),
            deadline
        )
    }
}

/// `CallContext` 构建器。
#[derive(Default)]
pub struct CallContextBuilder {
    cancellation: Cancellation,
    deadline: Deadline,
}

impl CallContextBuilder {
    /// 设置取消原语。
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// 设置截止时间。
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// 以“当前时间 + timeout”设置截止时间。
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Deadline::after(timeout))
    }

    pub fn build(self) -> CallContext {
        CallContext {
            inner: Arc::new(CallContextInner {
                cancellation: self.cancellation,
                deadline: self.deadline,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_visible_through_children() {
        let parent = Cancellation::new();
        let child = parent.child();
        assert!(parent.cancel());
        assert!(!parent.cancel(), "second cancel must report already cancelled");
        assert!(child.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires_after_timeout() {
        let deadline = Deadline::after(Duration::from_millis(20));
        assert!(!deadline.is_expired());
        tokio::time::advance(Duration::from_millis(25)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn default_context_has_no_deadline() {
        let ctx = CallContext::default();
        assert!(ctx.deadline().instant().is_none());
        assert!(!ctx.cancellation().is_cancelled());
        assert!(ctx.to_string().contains("deadline=none"));
    }
}
