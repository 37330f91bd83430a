use std::{borrow::Cow, fmt, io};

use bytes::Bytes;
use rustls::{AlertDescription, Error as RustlsError};
use thiserror::Error;

use crate::state::{Generation, RouteState, UpgradeState};

/// STARTTLS 传输错误模块。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将“配置缺失”“句柄过期”“握手失败”“对端提前关闭”等情形收敛为一个带稳定错误码的枚举，
///   调用方可以据此决定重连、告警或直接报告编程错误；
/// - 握手失败沿用 TLS 传输层的分类约定：先尝试从 `io::Error` 中取出 `rustls::Error`，
///   再根据错误或 Alert 推导 [`HandshakeFailureClass`]。
///
/// ## 逻辑（How）
/// - `OperationKind` 描述一类操作的错误码与默认文案，`Io`/`Cancelled`/`TimedOut` 携带它；
/// - [`StarttlsError::code`] 与 [`StarttlsError::category`] 给出稳定错误码与粗粒度分类；
/// - `classify_handshake_error` 负责握手错误的细分。
///
/// ## 契约（What）
/// - 本模块不做任何重试；所有错误原样交给调用方；
/// - 错误码前缀固定为 `spark.transport.starttls.`。
///
/// ## 风险与权衡（Trade-offs）
/// - `rustls::Error` 为 `non_exhaustive`，未列出的变体统一视作 `Internal`，后续可集中扩展。
///
///   描述一次底层操作的错误码及默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message)
    }
}

pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.transport.starttls.connect_failed",
    message: "tcp connect",
};
pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.transport.starttls.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.transport.starttls.accept_failed",
    message: "tcp accept",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.transport.starttls.read_failed",
    message: "stream read",
};
pub(crate) const FLUSH: OperationKind = OperationKind {
    code: "spark.transport.starttls.flush_failed",
    message: "stream flush",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.transport.starttls.shutdown_failed",
    message: "stream shutdown",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.transport.starttls.configure_failed",
    message: "socket configure",
};

/// 错误的粗粒度分类，供上层做自动化决策。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 信任材料或参数不合法，构造阶段即被发现，不应重试。
    Configuration,
    /// API 误用（过期句柄、重复升级、缺少升级能力等），属于编程错误。
    Usage,
    /// 握手被安全策略拒绝（证书、完整性、版本不兼容等）。
    Security,
    /// 底层网络故障或对端关闭。
    Transport,
    Cancelled,
    Timeout,
}

/// 握手失败的细分原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeFailureClass {
    /// 证书缺失、不受信任、过期或名称不匹配。
    Authentication,
    /// 报文畸形、解密失败或对端行为异常。
    Integrity,
    /// 双方找不到共同的协议版本、套件或 ALPN。
    Incompatible,
    /// 握手过程中连接被重置或提前关闭。
    Transport,
    /// 本地密码学实现或运行环境异常。
    Internal,
}

impl fmt::Display for HandshakeFailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HandshakeFailureClass::Authentication => "authentication",
            HandshakeFailureClass::Integrity => "integrity",
            HandshakeFailureClass::Incompatible => "incompatible",
            HandshakeFailureClass::Transport => "transport",
            HandshakeFailureClass::Internal => "internal",
        };
        f.write_str(label)
    }
}

/// 握手阶段的底层失败原因，作为 [`StarttlsError::UpgradeFailed`] 的 `source`。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandshakeError {
    #[error("tls handshake rejected ({class}): {source}")]
    Protocol {
        class: HandshakeFailureClass,
        #[source]
        source: io::Error,
    },
    #[error("flushing buffered plaintext before the handshake failed: {source}")]
    Preflight {
        #[source]
        source: io::Error,
    },
    #[error("tls handshake cancelled")]
    Cancelled,
    #[error("tls handshake timed out")]
    TimedOut,
}

impl HandshakeError {
    /// 从握手返回的 `io::Error` 构造错误并完成分类。
    pub(crate) fn from_io(source: io::Error) -> Self {
        let class = classify_handshake_error(&source);
        HandshakeError::Protocol { class, source }
    }

    /// 握手失败的细分原因；取消与超时返回 `None`。
    pub fn class(&self) -> Option<HandshakeFailureClass> {
        match self {
            HandshakeError::Protocol { class, .. } => Some(*class),
            HandshakeError::Preflight { .. } => Some(HandshakeFailureClass::Transport),
            HandshakeError::Cancelled | HandshakeError::TimedOut => None,
        }
    }
}

/// 触发过期检查的句柄类型，用于错误上下文。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
    Reader,
    Writer,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Reader => f.write_str("reader"),
            HandleKind::Writer => f.write_str("writer"),
        }
    }
}

/// STARTTLS 连接上所有操作的统一错误类型。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StarttlsError {
    /// 信任材料缺失或不合法；在任何网络 I/O 之前返回。
    #[error("invalid starttls configuration: {reason}")]
    Configuration { reason: Cow<'static, str> },

    /// 连接创建时未提供升级能力。
    #[error("connection was created without an upgrade capability")]
    UpgradeNotSupported,

    /// 连接已处于升级中或已升级。
    #[error("connection cannot be upgraded again: state is {state}")]
    AlreadyUpgraded { state: UpgradeState },

    /// 在已被取代的代际句柄上执行 I/O。
    #[error("stale {handle} handle issued for {issued}; connection route is {current}")]
    StaleHandle {
        handle: HandleKind,
        issued: Generation,
        current: RouteState,
    },

    /// 握手失败，连接已被关闭。
    #[error("tls upgrade failed: {source}")]
    UpgradeFailed {
        #[source]
        source: HandshakeError,
    },

    /// 对端在凑够期望字节前关闭了连接；`partial` 为已缓冲的残余数据。
    #[error("connection closed by peer with {} bytes left unconsumed", .partial.len())]
    ConnectionClosed { partial: Bytes },

    /// 连接已被本地关闭或因升级失败而终止。
    #[error("connection is closed")]
    Closed,

    /// 单行数据超过 `max_line_length`，越界数据已被丢弃。
    #[error("line exceeds the configured limit of {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("{op} failed: {source}")]
    Io {
        op: OperationKind,
        #[source]
        source: io::Error,
    },

    #[error("{op} cancelled")]
    Cancelled { op: OperationKind },

    #[error("{op} timed out")]
    TimedOut { op: OperationKind },
}

impl StarttlsError {
    pub(crate) fn configuration(reason: impl Into<Cow<'static, str>>) -> Self {
        StarttlsError::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn io(op: OperationKind, source: io::Error) -> Self {
        StarttlsError::Io { op, source }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            StarttlsError::Configuration { .. } => "spark.transport.starttls.invalid_configuration",
            StarttlsError::UpgradeNotSupported => "spark.transport.starttls.upgrade_not_supported",
            StarttlsError::AlreadyUpgraded { .. } => "spark.transport.starttls.already_upgraded",
            StarttlsError::StaleHandle { .. } => "spark.transport.starttls.stale_handle",
            StarttlsError::UpgradeFailed { .. } => "spark.transport.starttls.upgrade_failed",
            StarttlsError::ConnectionClosed { .. } => "spark.transport.starttls.connection_closed",
            StarttlsError::Closed => "spark.transport.starttls.closed",
            StarttlsError::LineTooLong { .. } => "spark.transport.starttls.line_too_long",
            StarttlsError::Io { op, .. } => op.code,
            StarttlsError::Cancelled { .. } => "spark.transport.starttls.cancelled",
            StarttlsError::TimedOut { .. } => "spark.transport.starttls.timeout",
        }
    }

    /// 粗粒度分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            StarttlsError::Configuration { .. } => ErrorCategory::Configuration,
            StarttlsError::UpgradeNotSupported
            | StarttlsError::AlreadyUpgraded { .. }
            | StarttlsError::StaleHandle { .. }
            | StarttlsError::Closed => ErrorCategory::Usage,
            StarttlsError::UpgradeFailed { source } => match source {
                HandshakeError::Cancelled => ErrorCategory::Cancelled,
                HandshakeError::TimedOut => ErrorCategory::Timeout,
                HandshakeError::Preflight { .. }
                | HandshakeError::Protocol {
                    class: HandshakeFailureClass::Transport,
                    ..
                } => ErrorCategory::Transport,
                HandshakeError::Protocol { .. } => ErrorCategory::Security,
            },
            StarttlsError::ConnectionClosed { .. }
            | StarttlsError::LineTooLong { .. }
            | StarttlsError::Io { .. } => ErrorCategory::Transport,
            StarttlsError::Cancelled { .. } => ErrorCategory::Cancelled,
            StarttlsError::TimedOut { .. } => ErrorCategory::Timeout,
        }
    }

    /// 是否为过期句柄错误，便于调用方在日志中区分编程错误。
    pub fn is_stale_handle(&self) -> bool {
        matches!(self, StarttlsError::StaleHandle { .. })
    }
}

pub type Result<T, E = StarttlsError> = std::result::Result<T, E>;

fn classify_handshake_error(error: &io::Error) -> HandshakeFailureClass {
    if let Some(source) = error.get_ref()
        && let Some(rustls_error) = source.downcast_ref::<RustlsError>()
    {
        return classify_rustls_error(rustls_error);
    }
    HandshakeFailureClass::Transport
}

fn classify_rustls_error(error: &RustlsError) -> HandshakeFailureClass {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidEncryptedClientHello(_)
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord => HandshakeFailureClass::Integrity,
        NoCertificatesPresented
        | InvalidCertificate(_)
        | InvalidCertRevocationList(_)
        | UnsupportedNameType => HandshakeFailureClass::Authentication,
        PeerIncompatible(_) | NoApplicationProtocol => HandshakeFailureClass::Incompatible,
        AlertReceived(alert) => classify_alert(alert),
        HandshakeNotComplete => HandshakeFailureClass::Transport,
        _ => HandshakeFailureClass::Internal,
    }
}

fn classify_alert(alert: &AlertDescription) -> HandshakeFailureClass {
    use AlertDescription::*;
    match alert {
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | NoCertificate
        | CertificateUnobtainable
        | CertificateRequired
        | AccessDenied => HandshakeFailureClass::Authentication,
        ProtocolVersion
        | InsufficientSecurity
        | HandshakeFailure
        | NoApplicationProtocol
        | UnsupportedExtension
        | MissingExtension => HandshakeFailureClass::Incompatible,
        CloseNotify | UserCanceled => HandshakeFailureClass::Transport,
        InternalError => HandshakeFailureClass::Internal,
        _ => HandshakeFailureClass::Integrity,
    }
}
