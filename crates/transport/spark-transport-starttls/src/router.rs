use bytes::{Bytes, BytesMut};
use tokio::{
    io::ReadHalf,
    net::TcpStream,
    sync::{Mutex as AsyncMutex, MutexGuard, watch},
};

use crate::{
    binding::Transport,
    state::{Generation, RouteState},
};

pub(crate) type InboundHalf = ReadHalf<Transport<TcpStream>>;

/// 入站槽位：当前代的读半部及其未被消费的字节。
#[derive(Debug)]
pub(crate) struct InboundSlot {
    pub(crate) generation: Generation,
    pub(crate) half: Option<InboundHalf>,
    pub(crate) pending: BytesMut,
    pub(crate) eof: bool,
}

/// 入站路由：决定“到达传输层的字节由哪一代 `Reader` 消费”。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 路由从不持有 `Reader` 本身，只记录“当前代”标签（`RouteState`）与该代的读半部；
///   `Reader` 通过订阅 `watch` 通道得知自己是否仍被路由指向；
/// - 升级时先广播 `Detached`，正在挂起的读操作立即醒来并以 `StaleHandle` 失败，
///   随后协调器才能安全地取走读半部。
///
/// ## 逻辑（How）
/// 1. `detach`：广播 `Detached { from }` → 获取槽位锁 → 取出读半部与残余字节；
/// 2. `attach`：把新一代读半部写入槽位，此时路由仍处于 `Detached`，旧代读者无法触达新字节；
/// 3. `notify_upgraded`：广播 `Attached(new)`，新代 `Reader` 开始可用；
/// 4. `close`：广播 `Closed` 并尽力释放读半部。
///
/// ## 契约（What）
/// - 旧代残余字节不会转交给新代 `Reader`：它们在 `detach` 时被冻结，交由握手引擎作为前置输入；
/// - `RouteState` 一旦为 `Closed` 就不再改变。
///
/// ## 风险与权衡（Trade-offs）
/// - `close` 使用 `try_lock`，若槽位正被读操作占用，则由该读操作在观察到 `Closed` 后自行释放读半部。
#[derive(Debug)]
pub(crate) struct InboundRouter {
    route: watch::Sender<RouteState>,
    slot: AsyncMutex<InboundSlot>,
}

impl InboundRouter {
    pub(crate) fn new(half: InboundHalf) -> Self {
        let (route, _) = watch::channel(RouteState::Attached(Generation::INITIAL));
        Self {
            route,
            slot: AsyncMutex::new(InboundSlot {
                generation: Generation::INITIAL,
                half: Some(half),
                pending: BytesMut::new(),
                eof: false,
            }),
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<RouteState> {
        self.route.subscribe()
    }

    pub(crate) fn current(&self) -> RouteState {
        *self.route.borrow()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, InboundSlot> {
        self.slot.lock().await
    }

    /// 让 `from` 代失效并取出其读半部与残余字节。
    ///
    /// 槽位已被关闭或已不属于 `from` 代时返回 `None`。
    pub(crate) async fn detach(&self, from: Generation) -> Option<(InboundHalf, Bytes)> {
        let moved = self.route.send_if_modified(|route| match route {
            RouteState::Attached(current) if *current == from => {
                *route = RouteState::Detached { from };
                true
            }
            _ => false,
        });
        if !moved {
            return None;
        }

        let mut slot = self.slot.lock().await;
        if slot.generation != from {
            return None;
        }
        let half = slot.half.take()?;
        let residual = slot.pending.split().freeze();
        slot.eof = false;
        Some((half, residual))
    }

    /// 把新一代读半部装入槽位；调用方随后需调用 [`Self::notify_upgraded`]。
    pub(crate) async fn attach(&self, generation: Generation, half: InboundHalf) {
        let mut slot = self.slot.lock().await;
        slot.generation = generation;
        slot.half = Some(half);
        slot.pending.clear();
        slot.eof = false;
    }

    /// 广播新的当前代，唤醒仍挂起在旧代上的读者。
    pub(crate) fn notify_upgraded(&self, generation: Generation) {
        self.route.send_if_modified(|route| {
            if matches!(route, RouteState::Closed) {
                return false;
            }
            *route = RouteState::Attached(generation);
            true
        });
    }

    pub(crate) fn close(&self) {
        self.route.send_replace(RouteState::Closed);
        if let Ok(mut slot) = self.slot.try_lock() {
            slot.half = None;
            slot.pending.clear();
        }
    }
}
