use bytes::Bytes;
use corral2_ctx::Ctx;
use corral2_error::Error;
use tokio::sync::mpsc;

/// One end of a bidirectional, ctx-bounded byte channel. [`channel_pair`]
/// produces both ends of one duplex pipe: the dispatcher hands one end to
/// the handler and returns the other to the transport.
pub struct StreamChannel {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
    ctx: Ctx,
}

impl StreamChannel {
    /// Sends one message. Fails with the ctx's classified done-error if the
    /// deadline passes (or the ctx is cancelled) before the peer accepts
    /// it, and `Unavailable` if the peer has already closed its end.
    pub async fn send(&self, chunk: Bytes) -> Result<(), Error> {
        tokio::select! {
            result = self.tx.send(chunk) => result.map_err(|_| Error::unavailable("stream peer closed")),
            _ = self.ctx.done() => Err(done_error(&self.ctx)),
        }
    }

    /// Receives the next message, or `None` once the peer closes its end.
    /// Also resolves to `None` if the ctx is done first -- callers that
    /// need to distinguish "closed" from "deadline exceeded" should check
    /// `ctx.is_done()` themselves.
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            msg = self.rx.recv() => msg,
            _ = self.ctx.done() => None,
        }
    }

    pub fn ctx(&self) -> &Ctx {
        &self.ctx
    }
}

fn done_error(ctx: &Ctx) -> Error {
    if ctx.is_cancelled() {
        Error::cancelled("stream ctx cancelled")
    } else {
        Error::deadline_exceeded("stream ctx deadline exceeded")
    }
}

/// Builds both ends of one duplex, `buffer`-deep byte pipe bounded by
/// `ctx`.
pub fn channel_pair(ctx: Ctx, buffer: usize) -> (StreamChannel, StreamChannel) {
    let (tx_a, rx_b) = mpsc::channel(buffer);
    let (tx_b, rx_a) = mpsc::channel(buffer);
    (
        StreamChannel {
            tx: tx_a,
            rx: rx_a,
            ctx: ctx.clone(),
        },
        StreamChannel { tx: tx_b, rx: rx_b, ctx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn messages_flow_both_directions() {
        let (mut a, mut b) = channel_pair(Ctx::background(), 4);
        a.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(b.recv().await, Some(Bytes::from_static(b"ping")));

        b.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(a.recv().await, Some(Bytes::from_static(b"pong")));
    }

    #[tokio::test]
    async fn recv_returns_none_once_peer_drops() {
        let (a, mut b) = channel_pair(Ctx::background(), 4);
        drop(a);
        assert_eq!(b.recv().await, None);
    }

    #[tokio::test]
    async fn send_fails_past_deadline() {
        let ctx = Ctx::background().with_timeout(Duration::from_millis(5));
        let (a, _b) = channel_pair(ctx, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = a.send(Bytes::from_static(b"late")).await.unwrap_err();
        assert_eq!(err.kind(), corral2_error::Kind::DeadlineExceeded);
    }
}
