//! 演示服务端与客户端的端到端会话。

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use spark_starttls_demo::{
    cli::{Cli, Mode},
    client, protocol, server,
};
use spark_transport_starttls::{CallContext, Cancellation, Listener, UpgradeState};

/// 生成 `localhost` 自签名证书并写入 `dir`，返回（证书路径，私钥路径）。
fn write_identity(dir: &Path) -> Result<(String, String)> {
    let key_pair = rcgen::KeyPair::generate().context("生成密钥对失败")?;
    let certificate = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .context("构造证书参数失败")?
        .self_signed(&key_pair)
        .context("自签名证书失败")?;
    let cert = dir.join("server.crt");
    let key = dir.join("server.key");
    std::fs::write(&cert, certificate.pem())?;
    std::fs::write(&key, key_pair.serialize_pem())?;
    Ok((cert.display().to_string(), key.display().to_string()))
}

fn bounded_context() -> CallContext {
    CallContext::builder()
        .with_timeout(Duration::from_secs(10))
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn demo_client_completes_the_full_exchange() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (cert, key) = write_identity(dir.path())?;

    let server_cli = Cli::try_parse_from([
        "starttls-demo",
        "server",
        "--listen",
        "127.0.0.1:0",
        "--cert",
        cert.as_str(),
        "--key",
        key.as_str(),
    ])?;
    let Mode::Server(server_args) = &server_cli.mode else {
        anyhow::bail!("expected server mode");
    };
    let listener = server_args.bind(&server_cli.resolve_config()?).await?;
    let addr = listener.local_addr().to_string();

    let cancellation = Cancellation::new();
    let serve_ctx = CallContext::builder()
        .with_cancellation(cancellation.clone())
        .build();
    let serving = tokio::spawn(async move { server::run(&listener, &serve_ctx).await });

    let client_cli = Cli::try_parse_from([
        "starttls-demo",
        "client",
        "--connect",
        addr.as_str(),
        "--ca",
        cert.as_str(),
        "--server-name",
        "localhost",
    ])?;
    let Mode::Client(client_args) = &client_cli.mode else {
        anyhow::bail!("expected client mode");
    };
    let connector = client_args.connector(&client_cli.resolve_config()?)?;
    let report = client::run(&bounded_context(), &connector, &client_args.connect).await?;

    assert_eq!(report.plain_reply, "PONG");
    assert_eq!(report.tls_reply, "PONG");
    let session = report.tls.context("升级后应有 TLS 会话")?;
    assert!(session.protocol_version.is_some());

    cancellation.cancel();
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .context("服务端未在取消后退出")???;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_server_refuses_starttls_and_keeps_the_session() -> Result<()> {
    let listener = Listener::bind("127.0.0.1:0", None).await?;
    let addr = listener.local_addr().to_string();

    let session = tokio::spawn(async move {
        let ctx = bounded_context();
        let accepted = listener.accept(&ctx).await?;
        server::handle_session(ctx, accepted).await
    });

    let ctx = bounded_context();
    let (mut reader, mut writer) = spark_transport_starttls::connect(&ctx, &addr, None).await?;
    writer.send(&ctx, b"starttls\r\n").await?;
    assert_eq!(
        &reader.read_line(&ctx).await?[..],
        server::TLS_UNAVAILABLE_REPLY
    );
    writer.send(&ctx, b"HELO\n").await?;
    assert_eq!(&reader.read_line(&ctx).await?[..], protocol::UNKNOWN_REPLY);
    writer.send(&ctx, protocol::PING).await?;
    assert_eq!(&reader.read_line(&ctx).await?[..], protocol::PONG);
    writer.send(&ctx, protocol::QUIT).await?;

    let report = session.await??;
    assert!(report.quit);
    assert_eq!(report.pings, 1);
    assert_eq!(report.state, UpgradeState::Plain);
    assert!(report.tls.is_none());
    writer.close(&ctx).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_ends_quietly_when_the_client_disconnects() -> Result<()> {
    let listener = Listener::bind("127.0.0.1:0", None).await?;
    let addr = listener.local_addr().to_string();

    let session = tokio::spawn(async move {
        let ctx = bounded_context();
        let accepted = listener.accept(&ctx).await?;
        server::handle_session(ctx, accepted).await
    });

    let ctx = bounded_context();
    let (_reader, mut writer) = spark_transport_starttls::connect(&ctx, &addr, None).await?;
    writer.send(&ctx, b"PING").await?;
    writer.close(&ctx).await?;

    let report = session.await??;
    assert!(!report.quit);
    assert_eq!(report.pings, 0);
    Ok(())
}
