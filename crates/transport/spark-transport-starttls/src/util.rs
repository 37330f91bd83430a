use std::{future::Future, io, sync::Once, time::Duration};

use crate::{
    context::{CallContext, Cancellation},
    error::{OperationKind, Result, StarttlsError},
};

const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// 挂起操作被上下文打断的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Interrupted {
    Cancelled,
    TimedOut,
}

impl Interrupted {
    pub(crate) fn into_error(self, op: OperationKind) -> StarttlsError {
        match self {
            Interrupted::Cancelled => StarttlsError::Cancelled { op },
            Interrupted::TimedOut => StarttlsError::TimedOut { op },
        }
    }
}

async fn wait_for_cancellation(cancellation: &Cancellation) {
    while !cancellation.is_cancelled() {
        tokio::time::sleep(CANCELLATION_POLL_INTERVAL).await;
    }
}

/// 在取消/截止语义下驱动任意 Future。
///
/// # 教案级注释
///
/// ## 逻辑（How）
/// 1. 先同步检查截止与取消，已触发则不轮询 `future`；
/// 2. 以 `biased` 的 `select!` 依次观察取消、截止与业务 Future，取消优先。
///
/// ## 契约（What）
/// - 被打断时 `future` 会被丢弃；调用方必须保证被丢弃的 Future 是取消安全的，
///   或者在打断后不再使用其操作的资源。
pub(crate) async fn guard_with_context<F>(
    ctx: &CallContext,
    future: F,
) -> std::result::Result<F::Output, Interrupted>
where
    F: Future,
{
    if ctx.deadline().is_expired() {
        return Err(Interrupted::TimedOut);
    }
    if ctx.cancellation().is_cancelled() {
        return Err(Interrupted::Cancelled);
    }

    let cancel = wait_for_cancellation(ctx.cancellation());
    tokio::pin!(cancel);
    tokio::pin!(future);

    if let Some(deadline) = ctx.deadline().instant() {
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        tokio::select! {
            biased;
            _ = &mut cancel => Err(Interrupted::Cancelled),
            _ = &mut sleep => Err(Interrupted::TimedOut),
            output = &mut future => Ok(output),
        }
    } else {
        tokio::select! {
            biased;
            _ = &mut cancel => Err(Interrupted::Cancelled),
            output = &mut future => Ok(output),
        }
    }
}

/// 在保留取消/超时语义的前提下执行 IO Future，并把 `io::Error` 映射为结构化错误。
pub(crate) async fn run_with_context<F, T>(
    ctx: &CallContext,
    kind: OperationKind,
    future: F,
) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match guard_with_context(ctx, future).await {
        Ok(result) => result.map_err(|err| StarttlsError::io(kind, err)),
        Err(interrupted) => Err(interrupted.into_error(kind)),
    }
}

/// 进程级安装 AWS-LC 作为 rustls 默认 provider。
///
/// 若宿主程序已安装其他 provider，则保留宿主的选择。
pub(crate) fn ensure_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed, keeping it");
        }
    });
}

/// 从 `host:port` 形式的地址中取出主机部分，兼容 `[::1]:443`。
pub(crate) fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[')
        && let Some((host, _)) = rest.split_once(']')
    {
        return host;
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => addr,
    }
}
