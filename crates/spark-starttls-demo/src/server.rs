use std::net::SocketAddr;

use spark_transport_starttls::{
    Accepted, CallContext, Listener, Result, StarttlsError, TlsSessionInfo, UpgradeState,
};

use crate::protocol::{self, Command};

/// 无升级能力的服务端收到 `STARTTLS` 时的应答。
pub const TLS_UNAVAILABLE_REPLY: &[u8] = b"ERR tls not available\n";

/// 单个会话结束时的摘要。
#[derive(Clone, Debug)]
pub struct SessionReport {
    pub peer: SocketAddr,
    pub pings: usize,
    pub state: UpgradeState,
    pub tls: Option<TlsSessionInfo>,
    /// 会话是否以 `QUIT` 正常结束；对端直接断开时为 `false`。
    pub quit: bool,
}

/// 服务端会话循环。
///
/// # 教案级注释
///
/// ## 逻辑（How）
/// 1. 逐行读取指令：`PING` 回复 `PONG`；`QUIT` 退出循环；
/// 2. `STARTTLS` 触发原地升级，成功后以返回的新一代句柄替换当前读写句柄，
///    会话在加密通道上继续；连接不可升级时回复 `ERR` 并保持明文；
/// 3. 对端在未发送 `QUIT` 的情况下关闭连接，视为会话结束而非错误；
/// 4. 退出循环后关闭写方向并释放连接。
///
/// ## 契约（What）
/// - 升级失败时连接已被关闭，错误原样返回给调用方；
/// - 返回的 [`SessionReport`] 记录最终升级状态与协商出的 TLS 参数。
pub async fn handle_session(ctx: CallContext, accepted: Accepted) -> Result<SessionReport> {
    let Accepted {
        mut reader,
        mut writer,
        peer_addr,
    } = accepted;
    tracing::info!(peer = %peer_addr, "client connected");

    let mut pings = 0;
    let mut quit = false;
    loop {
        let line = match reader.read_line(&ctx).await {
            Ok(line) => line,
            Err(StarttlsError::ConnectionClosed { partial }) => {
                tracing::info!(
                    peer = %peer_addr,
                    discarded = partial.len(),
                    "client disconnected without QUIT"
                );
                break;
            }
            Err(err) => return Err(err),
        };
        let command = Command::parse(&line);
        tracing::debug!(peer = %peer_addr, %command, "command received");

        match command {
            Command::Ping => {
                pings += 1;
                writer.send(&ctx, protocol::PONG).await?;
            }
            Command::StartTls => match writer.upgrade(&ctx).await {
                Ok((next_reader, next_writer)) => {
                    reader = next_reader;
                    writer = next_writer;
                }
                Err(StarttlsError::UpgradeNotSupported) => {
                    tracing::warn!(peer = %peer_addr, "STARTTLS requested on a plain listener");
                    writer.send(&ctx, TLS_UNAVAILABLE_REPLY).await?;
                }
                Err(err) => return Err(err),
            },
            Command::Quit => {
                quit = true;
                break;
            }
            Command::Unknown(raw) => {
                tracing::warn!(peer = %peer_addr, command = %raw, "unknown command");
                writer.send(&ctx, protocol::UNKNOWN_REPLY).await?;
            }
        }
    }

    let report = SessionReport {
        peer: peer_addr,
        pings,
        state: writer.upgrade_state(),
        tls: writer.tls_session().cloned(),
        quit,
    };
    writer.close(&ctx).await?;
    tracing::info!(peer = %peer_addr, state = %report.state, pings, "client closed");
    Ok(report)
}

/// 为每个入站连接运行 [`handle_session`]，直到上下文被取消。
pub async fn run(listener: &Listener, ctx: &CallContext) -> Result<()> {
    tracing::info!(
        addr = %listener.local_addr(),
        upgradeable = listener.capability().is_some(),
        "demo server listening"
    );
    listener
        .serve(ctx, |ctx, accepted| async move {
            handle_session(ctx, accepted).await.map(|report| {
                tracing::debug!(
                    peer = %report.peer,
                    quit = report.quit,
                    protocol = ?report.tls.as_ref().and_then(|tls| tls.protocol_version),
                    "session finished"
                );
            })
        })
        .await
}
