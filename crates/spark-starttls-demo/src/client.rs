use anyhow::{Context, Result, ensure};
use spark_transport_starttls::{CallContext, Connector, Reader, TlsSessionInfo, Writer};

use crate::protocol;

/// 一次演示会话的观察结果。
#[derive(Clone, Debug)]
pub struct ClientReport {
    /// 明文阶段 `PING` 的应答。
    pub plain_reply: String,
    /// 升级后 `PING` 的应答。
    pub tls_reply: String,
    pub tls: Option<TlsSessionInfo>,
}

/// 演示客户端：明文 `PING` → `STARTTLS` + 升级 → 加密 `PING` → `QUIT`。
///
/// 连接器必须携带发起方升级能力，否则升级步骤返回 `UpgradeNotSupported`。
pub async fn run(ctx: &CallContext, connector: &Connector, addr: &str) -> Result<ClientReport> {
    let (mut reader, mut writer) = connector
        .connect(ctx, addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    tracing::info!(
        addr,
        upgradeable = writer.is_upgradeable(),
        tls = ?writer.tls_session(),
        "connected in plaintext"
    );

    let plain_reply = ping(ctx, &mut reader, &mut writer).await?;

    tracing::info!("sending STARTTLS");
    writer.send(ctx, protocol::STARTTLS).await?;
    let (mut reader, mut writer) = writer
        .upgrade(ctx)
        .await
        .context("upgrading the connection to tls")?;
    let tls = writer.tls_session().cloned();
    tracing::info!(
        protocol = ?tls.as_ref().and_then(|session| session.protocol_version),
        cipher = ?tls.as_ref().and_then(|session| session.cipher_suite),
        "connection upgraded"
    );

    let tls_reply = ping(ctx, &mut reader, &mut writer).await?;

    tracing::info!("sending QUIT");
    writer.send(ctx, protocol::QUIT).await?;
    writer.close(ctx).await.context("closing the connection")?;
    tracing::info!("client disconnected");

    Ok(ClientReport {
        plain_reply,
        tls_reply,
        tls,
    })
}

async fn ping(ctx: &CallContext, reader: &mut Reader, writer: &mut Writer) -> Result<String> {
    tracing::info!("sending PING");
    writer.send(ctx, protocol::PING).await?;
    let reply = reader.read_line(ctx).await.context("waiting for PONG")?;
    let reply = protocol::display_line(&reply);
    tracing::info!(%reply, "received");
    ensure!(
        reply == protocol::display_line(protocol::PONG),
        "unexpected reply to PING: {reply:?}"
    );
    Ok(reply)
}
