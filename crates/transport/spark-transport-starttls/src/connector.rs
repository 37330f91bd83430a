use std::sync::Arc;

use rustls_pki_types::ServerName;
use tokio::net::TcpStream;

use crate::{
    capability::UpgradeCapability,
    config::StreamOptions,
    connection::ConnectionCore,
    context::CallContext,
    error::{CONNECT, Result, StarttlsError},
    reader::Reader,
    state::Role,
    util::{host_of, run_with_context},
    writer::Writer,
};

/// 发起方连接工厂。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 升级能力必须显式申请：未调用 [`Connector::with_upgrade`] 时返回的句柄是普通明文流，
///   对其调用升级会得到 [`StarttlsError::UpgradeNotSupported`]；
/// - 所有配置校验（角色、服务器名、流参数）在建连之前完成，错误不会伴随半开的套接字。
///
/// ## 契约（What）
/// - `connect` 成功后返回第 0 代（明文）读写句柄；
/// - 服务器名优先取能力上的显式提示，否则由地址中的主机部分推导。
#[derive(Clone, Debug, Default)]
pub struct Connector {
    capability: Option<Arc<UpgradeCapability>>,
    options: StreamOptions,
}

impl Connector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为之后建立的连接附加升级能力。
    pub fn with_upgrade(mut self, capability: UpgradeCapability) -> Self {
        self.capability = Some(Arc::new(capability));
        self
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// 建立到 `addr`（`host:port`）的明文连接。
    pub async fn connect(&self, ctx: &CallContext, addr: &str) -> Result<(Reader, Writer)> {
        self.options.validate()?;
        let server_name = self.resolve_server_name(addr)?;
        let stream = run_with_context(ctx, CONNECT, TcpStream::connect(addr)).await?;
        ConnectionCore::establish(
            stream,
            Role::Initiator,
            self.capability.clone(),
            server_name,
            self.options.clone(),
        )
    }

    fn resolve_server_name(&self, addr: &str) -> Result<Option<ServerName<'static>>> {
        let Some(capability) = self.capability.as_deref() else {
            return Ok(None);
        };
        if capability.role() != Role::Initiator {
            return Err(StarttlsError::configuration(
                "connect requires an initiator upgrade capability",
            ));
        }
        if let Some(name) = capability.server_name() {
            return Ok(Some(name.clone()));
        }
        let host = host_of(addr);
        ServerName::try_from(host.to_owned())
            .map(Some)
            .map_err(|err| {
                StarttlsError::configuration(format!(
                    "cannot derive a server name from {addr:?}: {err}"
                ))
            })
    }
}

/// 以默认流参数建立连接；`capability` 为 `None` 时连接不可升级。
pub async fn connect(
    ctx: &CallContext,
    addr: &str,
    capability: Option<UpgradeCapability>,
) -> Result<(Reader, Writer)> {
    let connector = match capability {
        Some(capability) => Connector::new().with_upgrade(capability),
        None => Connector::new(),
    };
    connector.connect(ctx, addr).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_capability() -> UpgradeCapability {
        crate::util::ensure_crypto_provider();
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        UpgradeCapability::initiator(Arc::new(config))
    }

    #[test]
    fn server_name_is_derived_from_address() {
        let connector = Connector::new().with_upgrade(client_capability());
        let name = connector
            .resolve_server_name("localhost:2525")
            .expect("derived name")
            .expect("capability present");
        assert_eq!(name.to_str(), "localhost");
    }

    #[test]
    fn explicit_hint_wins_over_address() {
        let capability = client_capability()
            .with_server_name("mail.example.com")
            .expect("valid name");
        let connector = Connector::new().with_upgrade(capability);
        let name = connector
            .resolve_server_name("127.0.0.1:25")
            .expect("resolved")
            .expect("capability present");
        assert_eq!(name.to_str(), "mail.example.com");
    }

    #[test]
    fn plain_connector_has_no_server_name() {
        assert!(
            Connector::new()
                .resolve_server_name("localhost:1")
                .expect("plain")
                .is_none()
        );
    }
}
