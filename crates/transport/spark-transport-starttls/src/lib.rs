#![doc = r#"
# spark-transport-starttls

## 设计动机（Why）
- **原地升级**：许多行协议（SMTP、IMAP、XMPP 等）先以明文交换协商指令，再在同一条 TCP 连接上切换到
  TLS；本 crate 把这次切换实现为连接上的一次显式状态迁移，而不是重新建连；
- **可检测的误用**：升级会替换底层传输绑定，旧的读写句柄不再有效。这里以显式代际标签取代
  “在别名对象内部原地替换传输”的做法，旧代句柄上的任何 I/O 都以 `StaleHandle` 快速失败；
- **能力门控**：只有在连接工厂处显式提供升级能力的连接才允许升级，其余连接是普通明文流。

## 核心契约（What）
- [`Connector`] / [`connect`]：发起方工厂；[`Listener`]：受理方工厂（`accept` / `incoming` / `serve`）；
- [`Reader`]：`read_line` / `read_until` / `read_exact` / `read` / `read_to_end`；
- [`Writer`]：`write`（不挂起）/ `flush` / `send` / `upgrade` / `close`；
- [`UpgradeCapability`]：角色 + 信任配置 + 可选服务器名，连接创建后不可变；
- 所有挂起操作接受 [`CallContext`]，尊重取消与截止时间；
- 错误统一为 [`StarttlsError`]，携带稳定错误码（`spark.transport.starttls.*`）与 [`ErrorCategory`]。

## 实现策略（How）
- 明文与 TLS 绑定统一为内部的 `Transport` 枚举，按代拆分为读写半部；
- 入站路由以 `tokio::sync::watch` 广播当前代，挂起在旧代上的读操作会被立即唤醒；
- 握手使用 `rustls` + `tokio-rustls`；升级时入站缓冲中的残余字节作为握手首批输入重放；
- `run_with_context` 以轮询方式观察取消位，与 spark 传输层其余 crate 保持一致。

## 风险与考量（Trade-offs）
- 残余字节归握手所有：应用必须在调用 `upgrade` 前读完所有已知完整的明文数据，
  并在写入协商指令后显式 `flush`；
- 握手失败后连接直接关闭，不提供回退到明文的路径；是否重连由调用方决定；
- 不支持 TLS 重协商、降级或在一条连接上多路复用多个逻辑流。
"#]

mod binding;
mod capability;
mod config;
mod connection;
mod connector;
mod context;
mod error;
mod listener;
mod reader;
mod router;
mod state;
mod upgrade;
mod util;
mod writer;

pub use binding::TlsSessionInfo;
pub use capability::{TrustConfig, UpgradeCapability};
pub use config::{
    DEFAULT_MAX_LINE_LENGTH, DEFAULT_READ_CHUNK_SIZE, StartTlsConfig, StreamOptions, TlsSettings,
};
pub use connection::ConnectionInfo;
pub use connector::{Connector, connect};
pub use context::{CallContext, CallContextBuilder, Cancellation, Deadline};
pub use error::{
    ErrorCategory, HandleKind, HandshakeError, HandshakeFailureClass, OperationKind, Result,
    StarttlsError,
};
pub use listener::{Accepted, Listener};
pub use reader::Reader;
pub use state::{ConnectionId, Generation, Role, RouteState, UpgradeState};
pub use writer::Writer;

/// 进程级安装 rustls 默认密码学 provider（AWS-LC）。
///
/// [`UpgradeCapability::from_settings`] 会自动调用；直接以 `rustls` 配置构造能力的调用方
/// 应在构建 `ClientConfig`/`ServerConfig` 之前调用一次。重复调用无副作用。
pub fn install_crypto_provider() {
    util::ensure_crypto_provider();
}
