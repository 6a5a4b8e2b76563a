use crate::sniff::SniffStream;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// The connection a mux hands back: either a completed TLS session or the
/// plaintext sniffing wrapper with its buffered prefix intact.
pub enum MuxedStream<IO> {
    Tls(tokio_rustls::server::TlsStream<SniffStream<IO>>),
    Plain(SniffStream<IO>),
}

impl<IO: AsyncRead + AsyncWrite + Unpin> AsyncRead for MuxedStream<IO> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MuxedStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            MuxedStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MuxedStream<IO> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MuxedStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            MuxedStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MuxedStream::Tls(s) => Pin::new(s).poll_flush(cx),
            MuxedStream::Plain(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MuxedStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
            MuxedStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl<IO> MuxedStream<IO> {
    pub fn is_tls(&self) -> bool {
        matches!(self, MuxedStream::Tls(_))
    }
}
