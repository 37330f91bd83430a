use anyhow::{Context, Result};
use clap::Parser;
use spark_starttls_demo::{
    cli::{Cli, Mode},
    client, init_tracing, server,
};
use spark_transport_starttls::{CallContext, Cancellation};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.resolve_config()?;

    match &cli.mode {
        Mode::Server(args) => {
            let listener = args.bind(&config).await?;
            let cancellation = Cancellation::new();
            let ctx = CallContext::builder()
                .with_cancellation(cancellation.clone())
                .build();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown requested");
                    cancellation.cancel();
                }
            });
            server::run(&listener, &ctx)
                .await
                .context("serving connections")?;
        }
        Mode::Client(args) => {
            let connector = args.connector(&config)?;
            let ctx = CallContext::default();
            let report = client::run(&ctx, &connector, &args.connect).await?;
            println!("plaintext reply: {}", report.plain_reply);
            println!("tls reply:       {}", report.tls_reply);
            if let Some(session) = &report.tls {
                println!(
                    "negotiated:      {:?} / {:?}",
                    session.protocol_version, session.cipher_suite
                );
            }
        }
    }
    Ok(())
}
