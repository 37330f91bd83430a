//! 升级协调器：在已建立的连接上完成明文 → TLS 的原地切换。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 升级是整个连接生命周期中唯一一次“替换传输绑定”的操作；它必须对调用方表现为原子的：
//!   要么返回一对可立即使用的新代句柄，要么连接被关闭并返回错误，不存在跨两代的中间态；
//! - 握手一旦开始，对端可能已认为自己处于 TLS 状态，因此失败后不可回退到明文。
//!
//! ## 逻辑（How）
//! 1. 校验升级能力，原子地将状态推进到 `Upgrading`；此后任何路径的提前返回（包括 Future 被丢弃）
//!    都会经由 [`UpgradeGuard`] 关闭连接；
//! 2. 取出写半部，把句柄缓冲中剩余的明文冲刷出去；
//! 3. 通过入站路由摘下读半部：路由先广播 `Detached`，挂起的旧代读者随即醒来并失败；
//! 4. 合并读写半部得到原始套接字，用 [`Rewind`] 把入站残余字节放在握手输入最前面；
//! 5. 按角色调用 `TlsConnector`/`TlsAcceptor` 完成握手，受上下文与 `handshake_timeout` 约束；
//! 6. 成功后拆分 TLS 流，新读半部装入路由，新写半部装入出站槽位，提交 `Upgraded` 并广播新代。
//!
//! ## 契约（What）
//! - 升级前已 `flush` 的字节以明文、按序先于握手首字节到达对端；
//! - 升级返回后写出的字节全部加密；握手开始后收到的字节不会以未解密形式出现在任何 `Reader` 中；
//! - 同一连接至多执行一次握手。
//!
//! ## 风险与权衡（Trade-offs）
//! - 入站残余字节不会交还给应用：应用必须在调用升级前读完所有已知完整的明文数据。

use std::{io, sync::Arc};

use rustls_pki_types::ServerName;
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::Instrument;

use crate::{
    binding::{Rewind, TlsSessionInfo, Transport},
    capability::TrustConfig,
    connection::ConnectionCore,
    context::CallContext,
    error::{HandshakeError, Result, StarttlsError},
    reader::Reader,
    state::Generation,
    util::{Interrupted, guard_with_context},
    writer::Writer,
};

/// 按角色准备好的握手入口。
enum Handshaker {
    Connect {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
    Accept(TlsAcceptor),
}

impl Handshaker {
    fn prepare(core: &ConnectionCore) -> Result<Self> {
        let capability = core
            .capability
            .as_deref()
            .ok_or(StarttlsError::UpgradeNotSupported)?;
        match capability.trust() {
            TrustConfig::Initiator(config) => {
                let server_name = core
                    .server_name
                    .clone()
                    .or_else(|| capability.server_name().cloned())
                    .ok_or_else(|| {
                        StarttlsError::configuration("initiator has no server name to verify")
                    })?;
                Ok(Handshaker::Connect {
                    connector: TlsConnector::from(Arc::clone(config)),
                    server_name,
                })
            }
            TrustConfig::Acceptor(config) => {
                Ok(Handshaker::Accept(TlsAcceptor::from(Arc::clone(config))))
            }
        }
    }

    async fn run(
        self,
        io: Rewind<TcpStream>,
    ) -> std::result::Result<(TlsStream<Rewind<TcpStream>>, TlsSessionInfo), HandshakeError> {
        match self {
            Handshaker::Connect {
                connector,
                server_name,
            } => {
                let verified = server_name.to_str().into_owned();
                let stream = connector
                    .connect(server_name, io)
                    .await
                    .map_err(HandshakeError::from_io)?;
                let session = TlsSessionInfo::from_state(stream.get_ref().1, Some(verified));
                Ok((TlsStream::Client(stream), session))
            }
            Handshaker::Accept(acceptor) => {
                let stream = acceptor.accept(io).await.map_err(HandshakeError::from_io)?;
                let connection = stream.get_ref().1;
                let sni = connection.server_name().map(str::to_owned);
                let session = TlsSessionInfo::from_state(connection, sni);
                Ok((TlsStream::Server(stream), session))
            }
        }
    }
}

/// 升级未完成即退出时关闭连接。
struct UpgradeGuard<'a> {
    core: &'a ConnectionCore,
    armed: bool,
}

impl<'a> UpgradeGuard<'a> {
    fn new(core: &'a ConnectionCore) -> Self {
        Self { core, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for UpgradeGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.core.close() {
            tracing::warn!(
                connection = %self.core.id,
                role = %self.core.role,
                "upgrade did not complete, connection closed"
            );
        }
    }
}

pub(crate) async fn upgrade(writer: &mut Writer, ctx: &CallContext) -> Result<(Reader, Writer)> {
    let core = Arc::clone(&writer.core);
    let handshaker = Handshaker::prepare(&core)?;
    core.begin_upgrade(writer.generation)?;

    let span = tracing::info_span!(
        "starttls.upgrade",
        connection = %core.id,
        role = %core.role,
        from = %writer.generation,
    );
    let mut guard = UpgradeGuard::new(&core);
    let outcome = perform(&core, handshaker, writer, ctx)
        .instrument(span.clone())
        .await;

    match outcome {
        Ok((generation, session)) => {
            guard.disarm();
            span.in_scope(|| {
                tracing::info!(
                    to = %generation,
                    protocol = ?session.protocol_version,
                    cipher = ?session.cipher_suite,
                    "connection upgraded to tls"
                );
            });
            let reader = Reader::new(Arc::clone(&core), generation, Some(Arc::clone(&session)));
            let writer = Writer::new(Arc::clone(&core), generation, Some(session));
            Ok((reader, writer))
        }
        Err(source) => {
            drop(guard);
            span.in_scope(|| tracing::warn!(error = %source, "tls upgrade failed"));
            Err(StarttlsError::UpgradeFailed { source })
        }
    }
}

async fn perform(
    core: &ConnectionCore,
    handshaker: Handshaker,
    writer: &mut Writer,
    ctx: &CallContext,
) -> std::result::Result<(Generation, Arc<TlsSessionInfo>), HandshakeError> {
    let from = writer.generation;

    let mut write_half = {
        let mut slot = guard_with_context(ctx, core.outbound.lock())
            .await
            .map_err(interrupted)?;
        slot.half.take().ok_or_else(released)?
    };
    if !writer.buffer.is_empty() {
        let buffer = &mut writer.buffer;
        guard_with_context(ctx, async {
            write_half.write_all_buf(buffer).await?;
            write_half.flush().await
        })
        .await
        .map_err(interrupted)?
        .map_err(|source| HandshakeError::Preflight { source })?;
    }

    let (read_half, residual) = guard_with_context(ctx, core.router.detach(from))
        .await
        .map_err(interrupted)?
        .ok_or_else(released)?;
    if !read_half.is_pair_of(&write_half) {
        return Err(released());
    }
    let Transport::Plain(tcp) = read_half.unsplit(write_half) else {
        return Err(released());
    };
    let io = Rewind::new(tcp, residual);
    if io.pending() > 0 {
        tracing::debug!(
            bytes = io.pending(),
            "feeding buffered inbound bytes to the tls handshake"
        );
    }

    let handshake = handshaker.run(io);
    let bounded = async {
        match core.options.handshake_timeout() {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .unwrap_or(Err(HandshakeError::TimedOut)),
            None => handshake.await,
        }
    };
    let (stream, session) = guard_with_context(ctx, bounded).await.map_err(interrupted)??;

    let generation = from.next();
    let session = Arc::new(session);
    let (read_half, write_half) = tokio::io::split(Transport::new_tls(stream));
    core.router.attach(generation, read_half).await;
    {
        let mut slot = core.outbound.lock().await;
        slot.generation = generation;
        slot.half = Some(write_half);
    }
    core.complete_upgrade(generation);
    core.router.notify_upgraded(generation);
    Ok((generation, session))
}

fn interrupted(reason: Interrupted) -> HandshakeError {
    match reason {
        Interrupted::Cancelled => HandshakeError::Cancelled,
        Interrupted::TimedOut => HandshakeError::TimedOut,
    }
}

fn released() -> HandshakeError {
    HandshakeError::Preflight {
        source: io::Error::new(
            io::ErrorKind::NotConnected,
            "transport was released before the handshake started",
        ),
    }
}
