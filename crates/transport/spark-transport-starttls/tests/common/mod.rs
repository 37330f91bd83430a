//! 集成测试共享的证书与能力构造工具。
//!
//! - 每个测试独立生成自签名 PKI，避免测试之间共享可变状态；
//! - 发起方能力显式携带 `localhost` 服务器名，连接地址统一使用 `127.0.0.1`。

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use rcgen::{CertificateParams, KeyPair};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use spark_transport_starttls::{CallContext, UpgradeCapability, install_crypto_provider};

pub const SERVER_NAME: &str = "localhost";

/// 一套自签名身份：证书同时充当受理方证书与发起方信任根。
pub struct TestPki {
    pub certificate: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

impl TestPki {
    pub fn generate() -> Result<Self> {
        install_crypto_provider();
        let key_pair = KeyPair::generate().context("生成密钥对失败")?;
        let params = CertificateParams::new(vec![SERVER_NAME.to_string()])
            .context("构造证书参数失败")?;
        let certificate = params.self_signed(&key_pair).context("自签名证书失败")?;
        let key = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|err| anyhow!("私钥格式不受支持: {err}"))?;
        Ok(Self {
            certificate: certificate.der().clone(),
            key,
        })
    }

    pub fn acceptor(&self) -> Result<UpgradeCapability> {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![self.certificate.clone()], self.key.clone_key())
            .context("构造服务端 TLS 配置失败")?;
        Ok(UpgradeCapability::acceptor(Arc::new(config)))
    }

    pub fn initiator(&self) -> Result<UpgradeCapability> {
        let mut roots = RootCertStore::empty();
        roots
            .add(self.certificate.clone())
            .context("将自签名证书加入 RootCertStore 失败")?;
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        UpgradeCapability::initiator(Arc::new(config))
            .with_server_name(SERVER_NAME)
            .context("设置服务器名失败")
    }
}

/// 带兜底超时的上下文，防止测试在协议错误时无限挂起。
pub fn bounded_context() -> CallContext {
    CallContext::builder()
        .with_timeout(Duration::from_secs(10))
        .build()
}
