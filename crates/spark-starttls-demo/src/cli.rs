use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use spark_transport_starttls::{Connector, Listener, Role, StartTlsConfig, UpgradeCapability};

pub const DEFAULT_ADDR: &str = "127.0.0.1:10001";

/// `starttls-demo`：在同一条 TCP 连接上从明文切换到 TLS 的演示程序。
#[derive(Debug, Parser)]
#[command(name = "starttls-demo", version, about)]
pub struct Cli {
    /// TOML 配置文件（`[stream]` 与 `[tls]` 两个表）。
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// 握手超时（毫秒），覆盖配置文件中的 `stream.handshake_timeout_ms`。
    #[arg(long, global = true)]
    pub handshake_timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Debug, Subcommand)]
pub enum Mode {
    /// 监听并处理 PING/STARTTLS/QUIT 会话。
    Server(ServerArgs),
    /// 连接服务端并执行一次完整的演示会话。
    Client(ClientArgs),
}

#[derive(Debug, Args)]
pub struct ServerArgs {
    #[arg(long, default_value = DEFAULT_ADDR)]
    pub listen: String,
    /// PEM 证书链。
    #[arg(long)]
    pub cert: Option<PathBuf>,
    /// PEM 私钥。
    #[arg(long)]
    pub key: Option<PathBuf>,
    /// 不提供升级能力，`STARTTLS` 将被拒绝。
    #[arg(long)]
    pub plain: bool,
}

#[derive(Debug, Args)]
pub struct ClientArgs {
    #[arg(long, default_value = DEFAULT_ADDR)]
    pub connect: String,
    /// 用于校验服务端证书的 PEM 根证书。
    #[arg(long)]
    pub ca: Option<PathBuf>,
    /// 校验证书时使用的服务器名；缺省时取连接地址的主机部分。
    #[arg(long)]
    pub server_name: Option<String>,
}

impl Cli {
    /// 读取配置文件（若有）并叠加命令行覆盖项。
    pub fn resolve_config(&self) -> Result<StartTlsConfig> {
        let mut config = match &self.config {
            Some(path) => StartTlsConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => StartTlsConfig::default(),
        };
        if let Some(timeout) = self.handshake_timeout_ms {
            config.stream = config
                .stream
                .with_handshake_timeout(Duration::from_millis(timeout));
        }
        match &self.mode {
            Mode::Server(args) => {
                if let Some(cert) = &args.cert {
                    config.tls.certificate_chain = Some(cert.clone());
                }
                if let Some(key) = &args.key {
                    config.tls.private_key = Some(key.clone());
                }
            }
            Mode::Client(args) => {
                if let Some(ca) = &args.ca {
                    config.tls.ca_certificates = Some(ca.clone());
                }
                if let Some(name) = &args.server_name {
                    config.tls.server_name = Some(name.clone());
                }
            }
        }
        Ok(config)
    }
}

impl ServerArgs {
    pub async fn bind(&self, config: &StartTlsConfig) -> Result<Listener> {
        let capability = if self.plain {
            None
        } else {
            Some(
                UpgradeCapability::from_settings(Role::Acceptor, &config.tls)
                    .context("building the acceptor tls capability")?,
            )
        };
        Listener::bind_with_options(&self.listen, capability, config.stream.clone())
            .await
            .with_context(|| format!("binding {}", self.listen))
    }
}

impl ClientArgs {
    pub fn connector(&self, config: &StartTlsConfig) -> Result<Connector> {
        let capability = UpgradeCapability::from_settings(Role::Initiator, &config.tls)
            .context("building the initiator tls capability")?;
        Ok(Connector::new()
            .with_upgrade(capability)
            .with_options(config.stream.clone()))
    }
}
