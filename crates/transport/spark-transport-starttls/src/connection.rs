use std::{net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use rustls_pki_types::ServerName;
use tokio::{
    io::WriteHalf,
    net::TcpStream,
    sync::Mutex as AsyncMutex,
};

use crate::{
    binding::{TlsSessionInfo, Transport},
    capability::UpgradeCapability,
    config::StreamOptions,
    error::{CONNECT, HandleKind, Result, StarttlsError},
    reader::Reader,
    router::InboundRouter,
    state::{ConnectionId, Generation, Role, UpgradeState},
    writer::Writer,
};

pub(crate) type OutboundHalf = WriteHalf<Transport<TcpStream>>;

/// 出站槽位：当前代的写半部。
#[derive(Debug)]
pub(crate) struct OutboundSlot {
    pub(crate) generation: Generation,
    pub(crate) half: Option<OutboundHalf>,
}

#[derive(Debug)]
struct ConnectionStatus {
    upgrade: UpgradeState,
    generation: Generation,
    closed: bool,
}

/// 单条连接的共享内核，由同一连接各代的 `Reader`/`Writer` 通过 `Arc` 共同持有。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 连接在概念上是（传输绑定、入站路由、当前读写句柄、角色、升级状态）的组合；
///   把这些状态集中到一个内核里，句柄本身只剩“内核引用 + 签发代”，
///   不同代的句柄即便同时存活也不会互相踩踏；
/// - 升级状态与当前代放在同一把同步锁下，保证“检查前置条件 → 进入 Upgrading”是原子的，
///   同一连接至多只有一次握手在途。
///
/// ## 契约（What）
/// - 角色、地址、升级能力与流参数在创建后不可变；
/// - `UpgradeState` 只会单向推进；`closed` 一经置位不再复原；
/// - 最后一个句柄被释放时，读写半部随内核一起释放，底层套接字随之关闭。
#[derive(Debug)]
pub(crate) struct ConnectionCore {
    pub(crate) id: ConnectionId,
    pub(crate) role: Role,
    pub(crate) local_addr: SocketAddr,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) capability: Option<Arc<UpgradeCapability>>,
    pub(crate) server_name: Option<ServerName<'static>>,
    pub(crate) options: StreamOptions,
    status: Mutex<ConnectionStatus>,
    pub(crate) router: InboundRouter,
    pub(crate) outbound: AsyncMutex<OutboundSlot>,
}

impl ConnectionCore {
    /// 以明文状态包装一条刚建立的 TCP 连接，返回第 0 代读写句柄。
    pub(crate) fn establish(
        stream: TcpStream,
        role: Role,
        capability: Option<Arc<UpgradeCapability>>,
        server_name: Option<ServerName<'static>>,
        options: StreamOptions,
    ) -> Result<(Reader, Writer)> {
        options.apply(&stream)?;
        let local_addr = stream
            .local_addr()
            .map_err(|err| StarttlsError::io(CONNECT, err))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|err| StarttlsError::io(CONNECT, err))?;
        let (read_half, write_half) = tokio::io::split(Transport::Plain(stream));

        let core = Arc::new(ConnectionCore {
            id: ConnectionId::next(),
            role,
            local_addr,
            peer_addr,
            capability,
            server_name,
            options,
            status: Mutex::new(ConnectionStatus {
                upgrade: UpgradeState::Plain,
                generation: Generation::INITIAL,
                closed: false,
            }),
            router: InboundRouter::new(read_half),
            outbound: AsyncMutex::new(OutboundSlot {
                generation: Generation::INITIAL,
                half: Some(write_half),
            }),
        });

        tracing::debug!(
            connection = %core.id,
            role = %role,
            peer = %peer_addr,
            upgradeable = core.capability.is_some(),
            "connection established in plaintext"
        );

        let reader = Reader::new(Arc::clone(&core), Generation::INITIAL, None);
        let writer = Writer::new(core, Generation::INITIAL, None);
        Ok((reader, writer))
    }

    pub(crate) fn upgrade_state(&self) -> UpgradeState {
        self.status.lock().upgrade
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.status.lock().closed
    }

    /// 校验 `issued` 代的句柄是否仍可执行 I/O。
    ///
    /// 升级在途时当前代也视为过期：旧代句柄在握手开始的瞬间即失效。
    pub(crate) fn ensure_current(&self, handle: HandleKind, issued: Generation) -> Result<()> {
        let status = self.status.lock();
        if status.closed {
            return Err(StarttlsError::Closed);
        }
        if status.generation != issued || status.upgrade == UpgradeState::Upgrading {
            return Err(StarttlsError::StaleHandle {
                handle,
                issued,
                current: self.router.current(),
            });
        }
        Ok(())
    }

    /// 原子地检查升级前置条件并进入 `Upgrading`。
    pub(crate) fn begin_upgrade(&self, issued: Generation) -> Result<()> {
        let mut status = self.status.lock();
        if status.closed {
            return Err(StarttlsError::Closed);
        }
        let next = status
            .upgrade
            .begin()
            .map_err(|state| StarttlsError::AlreadyUpgraded { state })?;
        if status.generation != issued {
            return Err(StarttlsError::StaleHandle {
                handle: HandleKind::Writer,
                issued,
                current: self.router.current(),
            });
        }
        status.upgrade = next;
        Ok(())
    }

    pub(crate) fn complete_upgrade(&self, generation: Generation) {
        let mut status = self.status.lock();
        status.upgrade = UpgradeState::Upgraded;
        status.generation = generation;
    }

    /// 标记连接关闭并释放尚可获取的读写半部；重复调用无副作用。
    pub(crate) fn close(&self) -> bool {
        {
            let mut status = self.status.lock();
            if status.closed {
                return false;
            }
            status.closed = true;
        }
        self.router.close();
        if let Ok(mut slot) = self.outbound.try_lock() {
            slot.half = None;
        }
        tracing::debug!(connection = %self.id, role = %self.role, "connection closed");
        true
    }
}

/// 只读的连接元数据视图，由 `Reader`/`Writer` 共享实现。
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub role: Role,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub upgradeable: bool,
    pub upgrade_state: UpgradeState,
    pub generation: Generation,
    pub tls: Option<Arc<TlsSessionInfo>>,
}

impl ConnectionCore {
    pub(crate) fn info(&self, tls: Option<Arc<TlsSessionInfo>>) -> ConnectionInfo {
        let (upgrade_state, generation) = {
            let status = self.status.lock();
            (status.upgrade, status.generation)
        };
        ConnectionInfo {
            id: self.id,
            role: self.role,
            local_addr: self.local_addr,
            peer_addr: self.peer_addr,
            upgradeable: self.capability.is_some(),
            upgrade_state,
            generation,
            tls,
        }
    }
}
