use corral2_error::{Error, Kind};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// A record header is classified as a TLS ClientHello iff its first three
/// bytes look like `{content-type=handshake, major=3, minor>=1}`.
pub fn looks_like_tls_clienthello(prefix: &[u8]) -> bool {
    prefix.len() >= 3 && prefix[0] == 22 && prefix[1] == 3 && prefix[2] >= 1
}

/// Wraps a connection, buffering whatever it reads off the front so those
/// bytes can be classified and then replayed to whoever reads the stream
/// next -- TLS handshake or plaintext consumer, whichever wins.
pub struct SniffStream<IO> {
    inner: IO,
    prefix: Vec<u8>,
    prefix_pos: usize,
}

impl<IO: AsyncRead + Unpin> SniffStream<IO> {
    /// Reads up to 5 bytes (or until EOF) within `deadline`, returning the
    /// wrapped stream plus the bytes sniffed.
    pub async fn sniff(mut inner: IO, deadline: Duration) -> Result<(Self, Vec<u8>), Error> {
        let mut buf = [0u8; 5];
        let read = async {
            let mut filled = 0;
            while filled < buf.len() {
                let n = inner.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            Ok::<usize, io::Error>(filled)
        };

        let filled = tokio::time::timeout(deadline, read)
            .await
            .map_err(|_| Error::deadline_exceeded("tls sniff deadline exceeded"))?
            .map_err(|e| Error::with_cause(Kind::Unavailable, "failed reading tls sniff prefix", e))?;

        let prefix = buf[..filled].to_vec();
        Ok((
            Self {
                inner,
                prefix,
                prefix_pos: 0,
            },
            buf[..filled].to_vec(),
        ))
    }

    /// Wraps `inner` with an empty sniffed prefix -- used when a mux is
    /// configured `disabled` and no classification should happen at all.
    pub fn passthrough(inner: IO) -> Self {
        Self {
            inner,
            prefix: Vec::new(),
            prefix_pos: 0,
        }
    }
}

impl<IO: AsyncRead + Unpin> AsyncRead for SniffStream<IO> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.prefix_pos < self.prefix.len() {
            let remaining = &self.prefix[self.prefix_pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.prefix_pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for SniffStream<IO> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_clienthello_prefix() {
        assert!(looks_like_tls_clienthello(&[22, 3, 1, 0, 0]));
        assert!(looks_like_tls_clienthello(&[22, 3, 3, 0, 0]));
        assert!(!looks_like_tls_clienthello(&[22, 3, 0, 0, 0]));
        assert!(!looks_like_tls_clienthello(b"GET /"));
    }

    #[tokio::test]
    async fn sniffed_bytes_are_replayed_before_remaining_reads() {
        let data = b"GET / HTTP/1.1\r\n".to_vec();
        let (mut stream, prefix) = SniffStream::sniff(&data[..], Duration::from_secs(1)).await.unwrap();
        assert_eq!(prefix, b"GET /");

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, data);
    }

    #[tokio::test]
    async fn sniff_times_out_on_a_stalled_connection() {
        use tokio::io::duplex;
        let (a, _b) = duplex(16);
        let err = SniffStream::sniff(a, Duration::from_millis(5)).await.unwrap_err();
        assert_eq!(err.kind(), Kind::DeadlineExceeded);
    }
}
