use std::{
    cmp, fmt, io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use rustls::{CipherSuite, CommonState, ProtocolVersion};
use rustls_pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::TlsStream;

/// 连接当前代的传输绑定：明文套接字或其上的 TLS 会话。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 读写半部只依赖 `AsyncRead + AsyncWrite`，不关心底层是明文还是密文；
///   以枚举统一两种绑定，升级前后的 `Reader`/`Writer` 代码路径完全一致；
/// - TLS 变体包裹 [`Rewind`]：升级时已读入明文缓冲但尚未被应用消费的字节，
///   作为握手引擎的首批输入重放，绝不丢弃。
///
/// ## 契约（What）
/// - 每个连接同一时刻只有一个“活”的绑定；升级完成后旧的 `Plain` 绑定已被 TLS 变体吞并，
///   无法再被任何句柄触达；
/// - `Tls` 变体装箱以保持枚举体积稳定。
pub(crate) enum Transport<IO> {
    Plain(IO),
    Tls(Box<TlsStream<Rewind<IO>>>),
}

impl<IO> Transport<IO> {
    pub(crate) fn new_tls(stream: TlsStream<Rewind<IO>>) -> Self {
        Transport::Tls(Box::new(stream))
    }
}

impl<IO> fmt::Debug for Transport<IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Plain(_) => f.write_str("Transport::Plain"),
            Transport::Tls(_) => f.write_str("Transport::Tls"),
        }
    }
}

impl<IO> AsyncRead for Transport<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(io) => Pin::new(io).poll_read(cx, buf),
            Transport::Tls(io) => Pin::new(io).poll_read(cx, buf),
        }
    }
}

impl<IO> AsyncWrite for Transport<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(io) => Pin::new(io).poll_write(cx, buf),
            Transport::Tls(io) => Pin::new(io).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(io) => Pin::new(io).poll_flush(cx),
            Transport::Tls(io) => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(io) => Pin::new(io).poll_shutdown(cx),
            Transport::Tls(io) => Pin::new(io).poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(io) => Pin::new(io).poll_write_vectored(cx, bufs),
            Transport::Tls(io) => Pin::new(io).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Transport::Plain(io) => io.is_write_vectored(),
            Transport::Tls(io) => io.is_write_vectored(),
        }
    }
}

/// 在底层 IO 之前先重放一段已缓冲的字节。
///
/// 升级时入站路由里可能残留尚未被应用读取的明文字节（典型情况是对端的 ClientHello
/// 紧跟在协商指令之后到达）。这些字节属于握手，必须原样交给 TLS 引擎。
#[derive(Debug)]
pub(crate) struct Rewind<IO> {
    prefix: Option<Bytes>,
    inner: IO,
}

impl<IO> Rewind<IO> {
    pub(crate) fn new(inner: IO, prefix: Bytes) -> Self {
        let prefix = (!prefix.is_empty()).then_some(prefix);
        Self { prefix, inner }
    }

    /// 尚未重放的字节数。
    pub(crate) fn pending(&self) -> usize {
        self.prefix.as_ref().map_or(0, Bytes::len)
    }
}

impl<IO> AsyncRead for Rewind<IO>
where
    IO: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take()
            && !prefix.is_empty()
        {
            let copy_len = cmp::min(prefix.len(), buf.remaining());
            buf.put_slice(&prefix[..copy_len]);
            prefix.advance(copy_len);
            if !prefix.is_empty() {
                self.prefix = Some(prefix);
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<IO> AsyncWrite for Rewind<IO>
where
    IO: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// 一次成功握手协商出的会话参数，随升级后的句柄暴露给应用。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsSessionInfo {
    pub protocol_version: Option<ProtocolVersion>,
    pub cipher_suite: Option<CipherSuite>,
    pub alpn_protocol: Option<Vec<u8>>,
    /// 发起方为握手时使用的服务器名；受理方为对端通过 SNI 提供的名称。
    pub server_name: Option<String>,
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

impl TlsSessionInfo {
    pub(crate) fn from_state(state: &CommonState, server_name: Option<String>) -> Self {
        Self {
            protocol_version: state.protocol_version(),
            cipher_suite: state.negotiated_cipher_suite().map(|suite| suite.suite()),
            alpn_protocol: state.alpn_protocol().map(<[u8]>::to_vec),
            server_name,
            peer_certificates: state
                .peer_certificates()
                .map(|chain| chain.iter().map(|cert| cert.clone().into_owned()).collect())
                .unwrap_or_default(),
        }
    }
}
