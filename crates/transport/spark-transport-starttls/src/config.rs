use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use socket2::SockRef;
use tokio::net::TcpStream;

use crate::error::{CONFIGURE, Result, StarttlsError};

/// 单行读取默认上限，与常见行协议的 64 KiB 约定一致。
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;
/// 每次从套接字读取的默认块大小。
pub const DEFAULT_READ_CHUNK_SIZE: usize = 8 * 1024;

/// STARTTLS 连接的完整配置，通常由 TOML 文件加载。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将“流行为”（行长上限、握手超时、套接字选项）与“信任材料”（证书、私钥、根证书）
///   分离：前者可在所有连接间共享，后者在启动时一次性加载为不可变的升级能力；
/// - 采用 `deny_unknown_fields`，拼写错误的键在启动阶段即报错，而非静默忽略。
///
/// ## 契约（What）
/// - `stream` 与 `tls` 两个表均可省略，省略时使用默认值；
/// - 解析失败统一返回 [`StarttlsError::Configuration`]。
///
/// ```toml
/// [stream]
/// max_line_length = 4096
/// handshake_timeout_ms = 5000
///
/// [tls]
/// certificate_chain = "server.crt"
/// private_key = "server.key"
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StartTlsConfig {
    pub stream: StreamOptions,
    pub tls: TlsSettings,
}

impl StartTlsConfig {
    /// 从 TOML 文本解析配置。
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source)
            .map_err(|err| StarttlsError::configuration(format!("malformed config: {err}")))
    }

    /// 读取并解析 TOML 配置文件。
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|err| {
            StarttlsError::configuration(format!(
                "failed to read config file {}: {err}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&source)
    }
}

/// 流层行为参数，在同一 Listener/Connector 创建的所有连接之间共享。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StreamOptions {
    /// `read_line`/`read_until` 允许的最大单行长度（不含分隔符）。
    pub max_line_length: usize,
    pub read_chunk_size: usize,
    /// 握手超时；与调用上下文的截止时间取较早者。
    pub handshake_timeout_ms: Option<u64>,
    pub nodelay: bool,
    /// `SO_LINGER`；`None` 沿用内核默认。
    pub linger_ms: Option<u64>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            handshake_timeout_ms: None,
            nodelay: false,
            linger_ms: None,
        }
    }
}

impl StreamOptions {
    pub fn with_max_line_length(mut self, limit: usize) -> Self {
        self.max_line_length = limit;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = Some(timeout.as_millis().try_into().unwrap_or(u64::MAX));
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger_ms = linger.map(|value| value.as_millis().try_into().unwrap_or(u64::MAX));
        self
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger_ms.map(Duration::from_millis)
    }

    /// 校验取值范围；零长度的行上限或读块无法推进读取。
    pub fn validate(&self) -> Result<()> {
        if self.max_line_length == 0 {
            return Err(StarttlsError::configuration(
                "stream.max_line_length must be greater than zero",
            ));
        }
        if self.read_chunk_size == 0 {
            return Err(StarttlsError::configuration(
                "stream.read_chunk_size must be greater than zero",
            ));
        }
        Ok(())
    }

    /// 将套接字选项写入刚建立的连接。
    pub(crate) fn apply(&self, stream: &TcpStream) -> Result<()> {
        let sock = SockRef::from(stream);
        sock.set_linger(self.linger())
            .and_then(|()| sock.set_tcp_nodelay(self.nodelay))
            .map_err(|err| StarttlsError::io(CONFIGURE, err))
    }
}

/// 信任材料的文件路径与握手参数。
///
/// 受理方需要 `certificate_chain` + `private_key`；发起方需要 `ca_certificates`。
/// 两者可以同时出现，以便同一份配置文件驱动演示程序的两端。
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TlsSettings {
    pub certificate_chain: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub ca_certificates: Option<PathBuf>,
    /// 发起方校验证书时使用的服务器名；缺省时由连接地址推导。
    pub server_name: Option<String>,
    pub alpn_protocols: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = StartTlsConfig::from_toml_str("").expect("empty config parses");
        assert_eq!(config, StartTlsConfig::default());
        assert_eq!(config.stream.max_line_length, DEFAULT_MAX_LINE_LENGTH);
    }

    #[test]
    fn sections_are_parsed() {
        let config = StartTlsConfig::from_toml_str(
            r#"
            [stream]
            max_line_length = 1024
            handshake_timeout_ms = 2500
            nodelay = true

            [tls]
            certificate_chain = "certs/server.crt"
            private_key = "certs/server.key"
            alpn_protocols = ["smtp"]
            "#,
        )
        .expect("config parses");
        assert_eq!(config.stream.max_line_length, 1024);
        assert_eq!(
            config.stream.handshake_timeout(),
            Some(Duration::from_millis(2500))
        );
        assert!(config.stream.nodelay);
        assert_eq!(
            config.tls.certificate_chain.as_deref(),
            Some(Path::new("certs/server.crt"))
        );
        assert_eq!(config.tls.alpn_protocols, vec!["smtp".to_string()]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = StartTlsConfig::from_toml_str("[stream]\nmax_line = 10\n").unwrap_err();
        assert!(matches!(err, StarttlsError::Configuration { .. }));
    }

    #[test]
    fn zero_line_limit_is_invalid() {
        let options = StreamOptions::default().with_max_line_length(0);
        assert!(options.validate().is_err());
        assert!(StreamOptions::default().validate().is_ok());
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let err = StartTlsConfig::load("/definitely/not/here.toml").unwrap_err();
        assert_eq!(err.code(), "spark.transport.starttls.invalid_configuration");
    }
}
