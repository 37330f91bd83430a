use std::{path::Path, sync::Arc};

use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, pem::PemObject};

use crate::{
    config::TlsSettings,
    error::{Result, StarttlsError},
    state::Role,
    util::ensure_crypto_provider,
};

/// 握手所需的信任配置，按角色区分。
#[derive(Clone, Debug)]
pub enum TrustConfig {
    /// 发起方：根证书与客户端策略。
    Initiator(Arc<ClientConfig>),
    /// 受理方：证书链、私钥与服务端策略。
    Acceptor(Arc<ServerConfig>),
}

impl TrustConfig {
    pub fn role(&self) -> Role {
        match self {
            TrustConfig::Initiator(_) => Role::Initiator,
            TrustConfig::Acceptor(_) => Role::Acceptor,
        }
    }
}

/// 升级能力：连接创建时一次性提供、此后不可变的“信任配置 + 角色 + 对端身份提示”。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 只有携带升级能力的连接才允许调用 [`Writer::upgrade`](crate::Writer::upgrade)；
///   能力缺失时连接是普通明文流，这让“是否可升级”成为工厂层面的显式选择；
/// - 内部以 `Arc` 持有 rustls 配置，所有连接只读共享同一份信任材料。
///
/// ## 契约（What）
/// - `role()` 由信任配置推导：`ClientConfig` 对应发起方，`ServerConfig` 对应受理方；
/// - `from_settings` 在任何网络 I/O 之前完成 PEM 加载与校验，失败返回
///   [`StarttlsError::Configuration`]；
/// - `server_name` 仅对发起方有意义，缺省时由连接地址推导。
///
/// ## 风险与权衡（Trade-offs）
/// - 能力是不可变快照；证书轮换通过 [`Listener::replace_capability`](crate::Listener::replace_capability)
///   作用于之后的新连接，已建立的连接继续使用旧快照。
#[derive(Clone, Debug)]
pub struct UpgradeCapability {
    trust: TrustConfig,
    server_name: Option<ServerName<'static>>,
}

impl UpgradeCapability {
    /// 以客户端配置构造发起方能力。
    pub fn initiator(config: Arc<ClientConfig>) -> Self {
        Self {
            trust: TrustConfig::Initiator(config),
            server_name: None,
        }
    }

    /// 以服务端配置构造受理方能力。
    pub fn acceptor(config: Arc<ServerConfig>) -> Self {
        Self {
            trust: TrustConfig::Acceptor(config),
            server_name: None,
        }
    }

    /// 指定握手时校验的服务器名（SNI 与证书名称校验）。
    pub fn with_server_name(mut self, name: &str) -> Result<Self> {
        if self.role() != Role::Initiator {
            return Err(StarttlsError::configuration(
                "server name hint only applies to the initiating side",
            ));
        }
        let parsed = ServerName::try_from(name.to_owned()).map_err(|err| {
            StarttlsError::configuration(format!("invalid server name {name:?}: {err}"))
        })?;
        self.server_name = Some(parsed);
        Ok(self)
    }

    pub fn role(&self) -> Role {
        self.trust.role()
    }

    pub fn trust(&self) -> &TrustConfig {
        &self.trust
    }

    pub fn server_name(&self) -> Option<&ServerName<'static>> {
        self.server_name.as_ref()
    }

    /// 根据文件配置构造指定角色的升级能力。
    ///
    /// - 受理方：`certificate_chain` 与 `private_key` 必填，证书链不得为空；
    /// - 发起方：`ca_certificates` 必填，至少包含一张可用根证书；
    /// - `alpn_protocols` 同时作用于两种角色。
    pub fn from_settings(role: Role, settings: &TlsSettings) -> Result<Self> {
        ensure_crypto_provider();
        let alpn: Vec<Vec<u8>> = settings
            .alpn_protocols
            .iter()
            .map(|protocol| protocol.as_bytes().to_vec())
            .collect();

        match role {
            Role::Acceptor => {
                let chain_path = settings.certificate_chain.as_deref().ok_or_else(|| {
                    StarttlsError::configuration("acceptor requires tls.certificate_chain")
                })?;
                let key_path = settings.private_key.as_deref().ok_or_else(|| {
                    StarttlsError::configuration("acceptor requires tls.private_key")
                })?;
                let chain = load_certificates(chain_path)?;
                let key = PrivateKeyDer::from_pem_file(key_path).map_err(|err| {
                    StarttlsError::configuration(format!(
                        "failed to load private key {}: {err}",
                        key_path.display()
                    ))
                })?;
                let mut config = ServerConfig::builder()
                    .with_no_client_auth()
                    .with_single_cert(chain, key)
                    .map_err(|err| {
                        StarttlsError::configuration(format!(
                            "certificate chain and private key do not form a usable identity: {err}"
                        ))
                    })?;
                config.alpn_protocols = alpn;
                Ok(Self::acceptor(Arc::new(config)))
            }
            Role::Initiator => {
                let ca_path = settings.ca_certificates.as_deref().ok_or_else(|| {
                    StarttlsError::configuration("initiator requires tls.ca_certificates")
                })?;
                let mut roots = RootCertStore::empty();
                for certificate in load_certificates(ca_path)? {
                    roots.add(certificate).map_err(|err| {
                        StarttlsError::configuration(format!(
                            "rejected trust anchor in {}: {err}",
                            ca_path.display()
                        ))
                    })?;
                }
                let mut config = ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth();
                config.alpn_protocols = alpn;
                let capability = Self::initiator(Arc::new(config));
                match settings.server_name.as_deref() {
                    Some(name) => capability.with_server_name(name),
                    None => Ok(capability),
                }
            }
        }
    }
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certificates = CertificateDer::pem_file_iter(path)
        .and_then(|iter| iter.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|err| {
            StarttlsError::configuration(format!(
                "failed to load certificates from {}: {err}",
                path.display()
            ))
        })?;
    if certificates.is_empty() {
        return Err(StarttlsError::configuration(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certificates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        file.write_all(contents.as_bytes()).expect("write temp file");
        file
    }

    #[test]
    fn acceptor_without_certificate_is_rejected() {
        let settings = TlsSettings::default();
        let err = UpgradeCapability::from_settings(Role::Acceptor, &settings).unwrap_err();
        assert!(err.to_string().contains("certificate_chain"));
    }

    #[test]
    fn initiator_without_roots_is_rejected() {
        let err =
            UpgradeCapability::from_settings(Role::Initiator, &TlsSettings::default()).unwrap_err();
        assert!(matches!(err, StarttlsError::Configuration { .. }));
    }

    #[test]
    fn empty_pem_file_is_rejected() {
        let empty = write_temp("");
        let settings = TlsSettings {
            ca_certificates: Some(empty.path().to_path_buf()),
            ..TlsSettings::default()
        };
        let err = UpgradeCapability::from_settings(Role::Initiator, &settings).unwrap_err();
        assert!(err.to_string().contains("no certificates"));
    }

    #[test]
    fn generated_identity_loads_for_both_roles() {
        let key_pair = rcgen::KeyPair::generate().expect("generate key");
        let params =
            rcgen::CertificateParams::new(vec!["localhost".to_string()]).expect("cert params");
        let certificate = params.self_signed(&key_pair).expect("self sign");
        let cert_file = write_temp(&certificate.pem());
        let key_file = write_temp(&key_pair.serialize_pem());

        let settings = TlsSettings {
            certificate_chain: Some(cert_file.path().to_path_buf()),
            private_key: Some(key_file.path().to_path_buf()),
            ca_certificates: Some(cert_file.path().to_path_buf()),
            server_name: Some("localhost".to_string()),
            alpn_protocols: vec!["starttls-demo".to_string()],
        };

        let acceptor = UpgradeCapability::from_settings(Role::Acceptor, &settings)
            .expect("acceptor capability");
        assert_eq!(acceptor.role(), Role::Acceptor);
        let initiator = UpgradeCapability::from_settings(Role::Initiator, &settings)
            .expect("initiator capability");
        assert_eq!(initiator.role(), Role::Initiator);
        assert!(initiator.server_name().is_some());
        match initiator.trust() {
            TrustConfig::Initiator(config) => {
                assert_eq!(config.alpn_protocols, vec![b"starttls-demo".to_vec()]);
            }
            TrustConfig::Acceptor(_) => panic!("initiator capability must carry a client config"),
        }
    }

    #[test]
    fn server_name_hint_is_rejected_for_acceptor() {
        crate::util::ensure_crypto_provider();
        let key_pair = rcgen::KeyPair::generate().expect("generate key");
        let params =
            rcgen::CertificateParams::new(vec!["localhost".to_string()]).expect("cert params");
        let certificate = params.self_signed(&key_pair).expect("self sign");
        let key = PrivateKeyDer::try_from(key_pair.serialize_der()).expect("key der");
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![certificate.der().clone()], key)
            .expect("server config");
        let err = UpgradeCapability::acceptor(Arc::new(config))
            .with_server_name("localhost")
            .unwrap_err();
        assert!(matches!(err, StarttlsError::Configuration { .. }));
    }
}
