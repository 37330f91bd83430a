use std::{io, sync::Arc};

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;

use crate::{
    binding::TlsSessionInfo,
    connection::{ConnectionCore, ConnectionInfo},
    context::CallContext,
    error::{FLUSH, HandleKind, Result, SHUTDOWN, StarttlsError},
    reader::Reader,
    state::{Generation, Role, UpgradeState},
    upgrade,
    util::{guard_with_context, run_with_context},
};

/// 顺序的出站字节生产者，同时是升级操作的唯一入口。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - `write` 只把数据追加到句柄内部缓冲，不挂起；`flush` 才真正把缓冲交给传输层，
///   这让应用可以先写入协商指令、显式 `flush`，再调用 [`Writer::upgrade`]，
///   从而严格保证“协商指令先于握手首字节”；
/// - 升级以 `&mut self` 调用：旧句柄在升级后依然存活，任何误用都会被检测为
///   [`StarttlsError::StaleHandle`] 或 [`StarttlsError::AlreadyUpgraded`]，而不是未定义行为。
///
/// ## 契约（What）
/// - 每次操作都会比对签发代与连接当前代，不一致即快速失败；
/// - `close` 幂等：先冲刷缓冲，再发送半关闭（TLS 代会先发送 `close_notify`），最后释放传输绑定；
/// - 升级成功后返回的新 `Writer` 写出的所有字节都经过加密。
#[derive(Debug)]
pub struct Writer {
    pub(crate) core: Arc<ConnectionCore>,
    pub(crate) generation: Generation,
    pub(crate) buffer: BytesMut,
    session: Option<Arc<TlsSessionInfo>>,
}

impl Writer {
    pub(crate) fn new(
        core: Arc<ConnectionCore>,
        generation: Generation,
        session: Option<Arc<TlsSessionInfo>>,
    ) -> Self {
        Self {
            core,
            generation,
            buffer: BytesMut::new(),
            session,
        }
    }

    /// 追加数据到发送缓冲，不挂起。
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.core.ensure_current(HandleKind::Writer, self.generation)?;
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// 将缓冲数据全部交给传输层并冲刷。
    pub async fn flush(&mut self, ctx: &CallContext) -> Result<()> {
        self.core.ensure_current(HandleKind::Writer, self.generation)?;
        let core = Arc::clone(&self.core);
        let mut slot = guard_with_context(ctx, core.outbound.lock())
            .await
            .map_err(|interrupted| interrupted.into_error(FLUSH))?;
        if slot.generation != self.generation {
            return Err(StarttlsError::StaleHandle {
                handle: HandleKind::Writer,
                issued: self.generation,
                current: self.core.router.current(),
            });
        }
        let half = slot.half.as_mut().ok_or(StarttlsError::Closed)?;
        let buffer = &mut self.buffer;
        run_with_context(ctx, FLUSH, async {
            half.write_all_buf(buffer).await?;
            half.flush().await
        })
        .await
    }

    /// `write` + `flush`。
    pub async fn send(&mut self, ctx: &CallContext, data: &[u8]) -> Result<()> {
        self.write(data)?;
        self.flush(ctx).await
    }

    /// 执行明文 → TLS 原地升级，返回新一代的读写句柄。
    ///
    /// 调用前应用必须已写入并 `flush` 协商指令；仍留在本句柄缓冲中的字节会在握手前以明文发出。
    /// 连接入站缓冲中尚未被读取的字节被视为握手数据交给 TLS 引擎，不会再出现在任何 `Reader` 中。
    ///
    /// # Errors
    /// - [`StarttlsError::UpgradeNotSupported`]：连接创建时未提供升级能力，连接保持可用；
    /// - [`StarttlsError::AlreadyUpgraded`]：已升级或升级在途；
    /// - [`StarttlsError::UpgradeFailed`]：握手失败、取消或超时，连接已关闭。
    pub async fn upgrade(&mut self, ctx: &CallContext) -> Result<(Reader, Writer)> {
        upgrade::upgrade(self, ctx).await
    }

    /// 冲刷缓冲、半关闭写方向并释放传输绑定。
    pub async fn close(&mut self, ctx: &CallContext) -> Result<()> {
        if self.core.is_closed() {
            return Ok(());
        }
        self.core.ensure_current(HandleKind::Writer, self.generation)?;

        let flushed = if self.buffer.is_empty() {
            Ok(())
        } else {
            self.flush(ctx).await
        };

        let shutdown = {
            let core = Arc::clone(&self.core);
            let mut slot = guard_with_context(ctx, core.outbound.lock())
                .await
                .map_err(|interrupted| interrupted.into_error(SHUTDOWN))?;
            match slot.half.as_mut() {
                Some(half) => run_with_context(ctx, SHUTDOWN, half.shutdown()).await,
                None => Ok(()),
            }
        };

        self.core.close();
        // 连接此时已关闭；对端先行断开导致的冲刷或半关闭失败不再上报。
        flushed
            .or_else(ignore_disconnected)
            .and(shutdown.or_else(ignore_disconnected))
    }

    pub fn is_upgradeable(&self) -> bool {
        self.core.capability.is_some()
    }

    pub fn upgrade_state(&self) -> UpgradeState {
        self.core.upgrade_state()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn role(&self) -> Role {
        self.core.role
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// 本代 TLS 会话参数；明文代为 `None`。
    pub fn tls_session(&self) -> Option<&TlsSessionInfo> {
        self.session.as_deref()
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.core.info(self.session.clone())
    }

    /// 缓冲中尚未冲刷的字节数。
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// 对端先行断开时，半关闭失败不影响本地关闭的结果。
fn ignore_disconnected(err: StarttlsError) -> Result<()> {
    let disconnected = matches!(
        &err,
        StarttlsError::Io { source, .. }
            if matches!(
                source.kind(),
                io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
            )
    );
    if disconnected {
        tracing::debug!(error = %err, "peer already gone during shutdown");
        return Ok(());
    }
    Err(err)
}
