use std::{fmt, future::Future, io, net::SocketAddr, sync::Arc};

use arc_swap::ArcSwapOption;
use futures::Stream;
use tokio::net::TcpListener;

use crate::{
    capability::UpgradeCapability,
    config::StreamOptions,
    connection::ConnectionCore,
    context::CallContext,
    error::{ACCEPT, BIND, Result, StarttlsError},
    reader::Reader,
    state::Role,
    util::run_with_context,
    writer::Writer,
};

/// 受理方连接工厂：监听端口，为每个入站连接产出一对明文读写句柄。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 与 [`Connector`](crate::Connector) 对称，升级能力在绑定时显式提供；
///   没有能力的监听器产出不可升级的普通流；
/// - 升级能力存放在 [`ArcSwapOption`] 中：证书轮换只影响之后受理的连接，
///   已建立的连接各自持有创建时的不可变快照。
///
/// ## 逻辑（How）
/// - `accept`：借助 `run_with_context` 注入取消/截止，建立连接后应用流参数并封装为第 0 代句柄；
/// - `incoming`：把 `accept` 展开为 `futures::Stream`，上下文取消或超时时流结束；
/// - `serve`：为每个连接派生一个任务执行处理器，直到上下文取消。
///
/// ## 契约（What）
/// - 绑定前校验能力角色必须为受理方，否则返回 [`StarttlsError::Configuration`]，不触碰网络；
/// - 单个连接的处理失败只记录日志，不影响监听循环。
///
/// ## 风险与权衡（Trade-offs）
/// - `serve` 派生的任务不随监听器停止而终止；处理器应自行观察传入的 [`CallContext`]。
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    capability: ArcSwapOption<UpgradeCapability>,
    options: StreamOptions,
}

/// 一次受理的结果。
#[derive(Debug)]
pub struct Accepted {
    pub reader: Reader,
    pub writer: Writer,
    pub peer_addr: SocketAddr,
}

impl Listener {
    /// 以默认流参数绑定监听地址。
    pub async fn bind(addr: &str, capability: Option<UpgradeCapability>) -> Result<Self> {
        Self::bind_with_options(addr, capability, StreamOptions::default()).await
    }

    pub async fn bind_with_options(
        addr: &str,
        capability: Option<UpgradeCapability>,
        options: StreamOptions,
    ) -> Result<Self> {
        ensure_acceptor(capability.as_ref())?;
        options.validate()?;
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|err| StarttlsError::io(BIND, err))?;
        let local_addr = inner
            .local_addr()
            .map_err(|err| StarttlsError::io(BIND, err))?;
        tracing::info!(
            addr = %local_addr,
            upgradeable = capability.is_some(),
            "starttls listener bound"
        );
        Ok(Self {
            inner,
            local_addr,
            capability: ArcSwapOption::new(capability.map(Arc::new)),
            options,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// 当前用于新连接的升级能力快照。
    pub fn capability(&self) -> Option<Arc<UpgradeCapability>> {
        self.capability.load_full()
    }

    /// 替换之后受理的连接所使用的升级能力；已建立的连接不受影响。
    pub fn replace_capability(&self, capability: Option<UpgradeCapability>) -> Result<()> {
        ensure_acceptor(capability.as_ref())?;
        self.capability.store(capability.map(Arc::new));
        tracing::info!(addr = %self.local_addr, "starttls listener capability replaced");
        Ok(())
    }

    /// 受理一个入站连接。
    pub async fn accept(&self, ctx: &CallContext) -> Result<Accepted> {
        let (stream, peer_addr) = run_with_context(ctx, ACCEPT, self.inner.accept()).await?;
        let (reader, writer) = ConnectionCore::establish(
            stream,
            Role::Acceptor,
            self.capability.load_full(),
            None,
            self.options.clone(),
        )?;
        Ok(Accepted {
            reader,
            writer,
            peer_addr,
        })
    }

    /// 入站连接流；上下文取消或超时后结束。
    pub fn incoming<'a>(
        &'a self,
        ctx: &'a CallContext,
    ) -> impl Stream<Item = Result<Accepted>> + 'a {
        futures::stream::unfold((), move |()| async move {
            match self.accept(ctx).await {
                Err(StarttlsError::Cancelled { .. } | StarttlsError::TimedOut { .. }) => None,
                outcome => Some((outcome, ())),
            }
        })
    }

    /// 为每个入站连接派生任务运行 `handler`，直到上下文被取消。
    pub async fn serve<F, Fut, E>(&self, ctx: &CallContext, handler: F) -> Result<()>
    where
        F: Fn(CallContext, Accepted) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let handler = Arc::new(handler);
        loop {
            match self.accept(ctx).await {
                Ok(accepted) => {
                    let handler = Arc::clone(&handler);
                    let ctx = ctx.clone();
                    let peer = accepted.peer_addr;
                    tokio::spawn(async move {
                        if let Err(err) = (*handler)(ctx, accepted).await {
                            tracing::warn!(peer = %peer, error = %err, "connection handler failed");
                        }
                    });
                }
                Err(StarttlsError::Cancelled { .. } | StarttlsError::TimedOut { .. }) => {
                    tracing::info!(addr = %self.local_addr, "starttls listener stopped");
                    return Ok(());
                }
                Err(err) if is_transient(&err) => {
                    tracing::debug!(error = %err, "transient accept failure");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn ensure_acceptor(capability: Option<&UpgradeCapability>) -> Result<()> {
    match capability {
        Some(capability) if capability.role() != Role::Acceptor => Err(
            StarttlsError::configuration("listener requires an acceptor upgrade capability"),
        ),
        _ => Ok(()),
    }
}

/// 单个连接在受理阶段即被对端放弃，不影响监听器本身。
fn is_transient(err: &StarttlsError) -> bool {
    match err {
        StarttlsError::Io { source, .. } => matches!(
            source.kind(),
            io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::NotConnected
                | io::ErrorKind::Interrupted
        ),
        _ => false,
    }
}
