use bytes::Bytes;
use corral2_error::Error;
use std::io;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A readable byte stream that may be consumed at most once.
///
/// Transports construct a `Body` either from a fully-buffered `Bytes`
/// (queue transport, small unary payloads) or from an `AsyncRead` (large
/// streaming payloads read incrementally off the wire). Either way,
/// `read_to_end` may only be called once; a second call is a programming
/// error surfaced as a classified `FailedPrecondition`.
pub struct Body {
    inner: Option<Inner>,
}

enum Inner {
    Buffered(Bytes),
    Reader(Pin<Box<dyn AsyncRead + Send>>),
}

impl Body {
    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        Self {
            inner: Some(Inner::Buffered(bytes)),
        }
    }

    pub fn from_reader<R: AsyncRead + Send + 'static>(reader: R) -> Self {
        Self {
            inner: Some(Inner::Reader(Box::pin(reader))),
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.inner.is_none()
    }

    /// Reads the entire body. Errors with `FailedPrecondition` if the body
    /// was already consumed -- a body is read at most once.
    pub async fn read_to_end(&mut self) -> Result<Bytes, Error> {
        match self.inner.take() {
            None => Err(Error::failed_precondition("request body already consumed")),
            Some(Inner::Buffered(bytes)) => Ok(bytes),
            Some(Inner::Reader(mut reader)) => {
                let mut buf = Vec::new();
                reader
                    .read_to_end(&mut buf)
                    .await
                    .map_err(|e: io::Error| Error::with_cause(
                        corral2_error::Kind::Internal,
                        "failed reading request body",
                        e,
                    ))?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            None => write!(f, "Body(consumed)"),
            Some(Inner::Buffered(b)) => write!(f, "Body(buffered, {} bytes)", b.len()),
            Some(Inner::Reader(_)) => write!(f, "Body(reader)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_buffered_body_once() {
        let mut body = Body::from_bytes(Bytes::from_static(b"hello"));
        let read = body.read_to_end().await.unwrap();
        assert_eq!(&read[..], b"hello");
        assert!(body.is_consumed());

        let err = body.read_to_end().await.unwrap_err();
        assert_eq!(err.kind(), corral2_error::Kind::FailedPrecondition);
    }

    #[tokio::test]
    async fn reads_reader_body() {
        let mut body = Body::from_reader(&b"from a reader"[..]);
        let read = body.read_to_end().await.unwrap();
        assert_eq!(&read[..], b"from a reader");
    }
}
