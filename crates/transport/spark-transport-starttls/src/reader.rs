use std::sync::Arc;

use bytes::{Buf, Bytes};
use tokio::{io::AsyncReadExt, sync::watch};

use crate::{
    binding::TlsSessionInfo,
    connection::{ConnectionCore, ConnectionInfo},
    context::CallContext,
    error::{HandleKind, READ, Result, StarttlsError},
    router::InboundSlot,
    state::{Generation, RouteState},
    util::guard_with_context,
};

/// 顺序、有序的入站字节消费者；仅在签发它的那一代内有效。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 读取接口与连接处于明文还是 TLS 无关，应用代码在升级前后使用完全相同的调用；
/// - 每个 `Reader` 记录签发代，并订阅入站路由：一旦路由离开该代，
///   无论是新发起的读还是正在挂起的读，都以 [`StarttlsError::StaleHandle`] 结束，绝不悄悄阻塞。
///
/// ## 逻辑（How）
/// - 未消费字节保存在连接内核的入站槽位中，而非句柄内部，使“哪些字节属于哪一代”由路由统一裁决；
/// - 补充数据时以 `biased` 的 `select!` 同时等待“路由变更”与“套接字可读”，前者优先。
///
/// ## 契约（What）
/// - 同一代内字节严格按线上顺序交付，不重排、不重复；
/// - 对端关闭而期望字节尚未凑齐时返回 [`StarttlsError::ConnectionClosed`]，携带残余字节；
/// - 所有读操作都接受 [`CallContext`]，取消或超时时返回对应错误，已缓冲字节不会丢失。
///
/// ## 风险与权衡（Trade-offs）
/// - 槽位由异步互斥锁保护，允许跨任务持有多个 `Reader` 克隆并不被支持，也没有必要：
///   一条连接在设计上由单一逻辑任务驱动。
#[derive(Debug)]
pub struct Reader {
    core: Arc<ConnectionCore>,
    generation: Generation,
    route: watch::Receiver<RouteState>,
    session: Option<Arc<TlsSessionInfo>>,
}

impl Reader {
    pub(crate) fn new(
        core: Arc<ConnectionCore>,
        generation: Generation,
        session: Option<Arc<TlsSessionInfo>>,
    ) -> Self {
        let route = core.router.subscribe();
        Self {
            core,
            generation,
            route,
            session,
        }
    }

    /// 读取一行，返回值包含结尾的 `\n`。
    pub async fn read_line(&mut self, ctx: &CallContext) -> Result<Bytes> {
        self.read_until(ctx, b'\n').await
    }

    /// 读取直到遇到 `delimiter`（含）。
    ///
    /// 分隔符之前的内容超过 `max_line_length` 字节时返回 [`StarttlsError::LineTooLong`]
    /// （分隔符本身不计入上限），越界数据连同分隔符被丢弃，后续读取从下一段数据继续。
    pub async fn read_until(&mut self, ctx: &CallContext, delimiter: u8) -> Result<Bytes> {
        let limit = self.core.options.max_line_length;
        let core = Arc::clone(&self.core);
        let mut slot = self.acquire(ctx, &core).await?;
        let mut scanned = 0;
        loop {
            if let Some(offset) = slot.pending[scanned..]
                .iter()
                .position(|byte| *byte == delimiter)
            {
                let position = scanned + offset;
                if position > limit {
                    slot.pending.advance(position + 1);
                    return Err(StarttlsError::LineTooLong { limit });
                }
                return Ok(slot.pending.split_to(position + 1).freeze());
            }
            scanned = slot.pending.len();
            if scanned > limit {
                slot.pending.clear();
                return Err(StarttlsError::LineTooLong { limit });
            }
            if slot.eof {
                return Err(StarttlsError::ConnectionClosed {
                    partial: slot.pending.split().freeze(),
                });
            }
            self.fill(ctx, &mut slot).await?;
        }
    }

    /// 精确读取 `len` 个字节。
    pub async fn read_exact(&mut self, ctx: &CallContext, len: usize) -> Result<Bytes> {
        let core = Arc::clone(&self.core);
        let mut slot = self.acquire(ctx, &core).await?;
        while slot.pending.len() < len {
            if slot.eof {
                return Err(StarttlsError::ConnectionClosed {
                    partial: slot.pending.split().freeze(),
                });
            }
            self.fill(ctx, &mut slot).await?;
        }
        Ok(slot.pending.split_to(len).freeze())
    }

    /// 读取至多 `max` 个字节；对端已关闭且无缓冲数据时返回空 `Bytes`。
    pub async fn read(&mut self, ctx: &CallContext, max: usize) -> Result<Bytes> {
        let core = Arc::clone(&self.core);
        let mut slot = self.acquire(ctx, &core).await?;
        while slot.pending.is_empty() && !slot.eof && max > 0 {
            self.fill(ctx, &mut slot).await?;
        }
        let len = max.min(slot.pending.len());
        Ok(slot.pending.split_to(len).freeze())
    }

    /// 读取直到对端关闭写方向，返回全部剩余字节。
    pub async fn read_to_end(&mut self, ctx: &CallContext) -> Result<Bytes> {
        let core = Arc::clone(&self.core);
        let mut slot = self.acquire(ctx, &core).await?;
        while !slot.eof {
            self.fill(ctx, &mut slot).await?;
        }
        Ok(slot.pending.split().freeze())
    }

    /// 签发该句柄时的代。
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// 路由是否已离开本代；不消耗变更通知。
    pub fn is_stale(&self) -> bool {
        !matches!(*self.route.borrow(), RouteState::Attached(current) if current == self.generation)
    }

    /// 本代 TLS 会话参数；明文代为 `None`。
    pub fn tls_session(&self) -> Option<&TlsSessionInfo> {
        self.session.as_deref()
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.core.info(self.session.clone())
    }

    async fn acquire<'a>(
        &mut self,
        ctx: &CallContext,
        core: &'a ConnectionCore,
    ) -> Result<tokio::sync::MutexGuard<'a, InboundSlot>> {
        self.check_route()?;
        let mut slot = guard_with_context(ctx, core.router.lock())
            .await
            .map_err(|interrupted| interrupted.into_error(READ))?;
        if let Err(err) = self.check_route() {
            if matches!(err, StarttlsError::Closed) {
                slot.half = None;
            }
            return Err(err);
        }
        Ok(slot)
    }

    fn check_route(&mut self) -> Result<()> {
        match *self.route.borrow_and_update() {
            RouteState::Attached(current) if current == self.generation => Ok(()),
            RouteState::Closed => Err(StarttlsError::Closed),
            current => Err(StarttlsError::StaleHandle {
                handle: HandleKind::Reader,
                issued: self.generation,
                current,
            }),
        }
    }

    /// 从读半部补充一批数据到槽位；路由变更时立即返回相应错误。
    async fn fill(&mut self, ctx: &CallContext, slot: &mut InboundSlot) -> Result<()> {
        let chunk = self.core.options.read_chunk_size;
        let outcome = {
            let InboundSlot { half, pending, .. } = &mut *slot;
            let Some(half) = half.as_mut() else {
                return Err(StarttlsError::Closed);
            };
            pending.reserve(chunk);
            let route = &mut self.route;
            guard_with_context(ctx, async {
                tokio::select! {
                    biased;
                    _ = route.changed() => None,
                    result = half.read_buf(pending) => Some(result),
                }
            })
            .await
        };

        match outcome {
            Err(interrupted) => Err(interrupted.into_error(READ)),
            Ok(None) => {
                if let Err(err) = self.check_route() {
                    if matches!(err, StarttlsError::Closed) {
                        slot.half = None;
                    }
                    return Err(err);
                }
                Ok(())
            }
            Ok(Some(Ok(0))) => {
                slot.eof = true;
                Ok(())
            }
            Ok(Some(Ok(_))) => Ok(()),
            Ok(Some(Err(err))) => Err(StarttlsError::io(READ, err)),
        }
    }
}
