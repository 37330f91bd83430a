use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// 连接在 STARTTLS 协商中扮演的角色。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 握手引擎只关心“谁发起 ClientHello”：发起方（`Initiator`）走 `TlsConnector`，
///   受理方（`Acceptor`）走 `TlsAcceptor`；
/// - 角色在连接创建时由工厂确定，整个生命周期内不可更改。
///
/// ## 契约（What）
/// - `server_side()` 与原始握手接口的 `server_side` 标志一一对应：仅 `Acceptor` 为 `true`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// 主动建连的一方（客户端）。
    Initiator,
    /// 受理入站连接的一方（服务端）。
    Acceptor,
}

impl Role {
    /// 握手时是否以服务端身份运行。
    pub const fn server_side(self) -> bool {
        matches!(self, Role::Acceptor)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Acceptor => f.write_str("acceptor"),
        }
    }
}

/// 连接的升级阶段。
///
/// 状态只会单向推进 `Plain → Upgrading → Upgraded`，最多推进两次，永不回退。
/// 连接关闭是独立的生命周期标记，不属于本枚举。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpgradeState {
    /// 明文阶段，允许发起一次升级。
    Plain,
    /// 升级进行中：旧代句柄已失效，新代句柄尚未就绪。
    Upgrading,
    /// 升级完成，当前代为 TLS 绑定。
    Upgraded,
}

impl UpgradeState {
    /// 进入 `Upgrading`。仅 `Plain` 可以推进，其余状态原样返回供调用方构造错误。
    pub(crate) fn begin(self) -> Result<UpgradeState, UpgradeState> {
        match self {
            UpgradeState::Plain => Ok(UpgradeState::Upgrading),
            other => Err(other),
        }
    }
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeState::Plain => f.write_str("plain"),
            UpgradeState::Upgrading => f.write_str("upgrading"),
            UpgradeState::Upgraded => f.write_str("upgraded"),
        }
    }
}

/// 传输绑定的代际标签。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 旧实现通过“在流对象内部原地替换 transport 字段”完成升级，别名句柄会在不知情的情况下
///   指向新流；这里改为显式代际：每个 `Reader`/`Writer` 记录签发时的代，每次 I/O 与连接当前代比对，
///   不一致即以 `StaleHandle` 快速失败。
///
/// ## 契约（What）
/// - 初始代为 `0`，每次成功升级 `+1`；
/// - 代值只增不减，可安全用于日志与错误上下文。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    /// 连接建立时的明文代。
    pub const INITIAL: Generation = Generation(0);

    /// 返回下一代标签。
    pub const fn next(self) -> Generation {
        Generation(self.0 + 1)
    }

    /// 原始数值，便于打点。
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

/// 进程内唯一的连接编号，仅用于日志关联。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// 入站路由当前指向的目标。
///
/// `Reader` 通过订阅该值判断自己是否仍是“当前代”：
/// - `Attached(g)`：字节投递给第 `g` 代的读句柄；
/// - `Detached { from }`：升级协调器已从第 `from` 代摘下读半部，握手进行中；
/// - `Closed`：连接已关闭（正常关闭或升级失败）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteState {
    Attached(Generation),
    Detached { from: Generation },
    Closed,
}

impl fmt::Display for RouteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteState::Attached(generation) => write!(f, "attached to {generation}"),
            RouteState::Detached { from } => write!(f, "detached from {from} (upgrade in flight)"),
            RouteState::Closed => f.write_str("closed"),
        }
    }
}
