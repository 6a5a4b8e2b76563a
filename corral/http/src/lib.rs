#![deny(rust_2018_idioms)]

//! The inbound server lifecycle wrapper.
//!
//! This crate owns *when* a listener is bound, serving, and torn down; it
//! does not speak any particular wire format over the accepted connections
//! (that's the concern of whatever [`ConnHandler`] is plugged in -- the TLS
//! muxer, the router's dispatch, or a test double). Concrete transport wire
//! formats are out of scope here by design.

use async_trait::async_trait;
use corral2_ctx::Ctx;
use corral2_error::Error;
use corral2_lifecycle::Lifecycle;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handles one accepted connection. Handlers are expected to do their own
/// per-connection error handling; a handler returning simply means the
/// connection is done.
#[async_trait]
pub trait ConnHandler: Send + Sync {
    async fn handle(&self, conn: TcpStream, peer_addr: SocketAddr);
}

struct Running {
    local_addr: SocketAddr,
    accept_loop: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Binds a listener, runs an accept loop in the background, and tears both
/// down on `shutdown` via `listen_and_serve`/`listener`/`shutdown`.
pub struct Inbound<H> {
    handler: Arc<H>,
    lifecycle: Lifecycle,
    running: Mutex<Option<Running>>,
    error_tx: mpsc::UnboundedSender<Error>,
    error_rx: Mutex<Option<mpsc::UnboundedReceiver<Error>>>,
}

impl<H: ConnHandler + 'static> Inbound<H> {
    pub fn new(handler: Arc<H>) -> Self {
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        Self {
            handler,
            lifecycle: Lifecycle::new(),
            running: Mutex::new(None),
            error_tx,
            error_rx: Mutex::new(Some(error_rx)),
        }
    }

    /// Binds `addr` and starts accepting in the background. Idempotent:
    /// a second call observes the first call's outcome rather than binding
    /// twice -- it errors if already listening or stopped.
    pub async fn listen_and_serve(&self, addr: SocketAddr) -> Result<(), Error> {
        let handler = self.handler.clone();
        let error_tx = self.error_tx.clone();
        let running_slot = &self.running;

        self.lifecycle
            .start(|| async move {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| Error::with_cause(corral2_error::Kind::Unavailable, "failed to bind listener", e))?;
                let local_addr = listener
                    .local_addr()
                    .map_err(|e| Error::with_cause(corral2_error::Kind::Internal, "bound listener has no local address", e))?;

                let cancel = CancellationToken::new();
                let loop_cancel = cancel.clone();
                let accept_loop = tokio::spawn(accept_loop(listener, handler, loop_cancel, error_tx));

                *running_slot.lock().await = Some(Running {
                    local_addr,
                    accept_loop,
                    cancel,
                });
                Ok(())
            })
            .await
            .map_err(|e| e.clone_shallow())?;
        Ok(())
    }

    /// The bound local address, or `None` until `listen_and_serve` succeeds.
    pub async fn listener(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Takes the error-reporting channel. Only the first caller gets it;
    /// later callers see `None`.
    pub async fn take_error_receiver(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.error_rx.lock().await.take()
    }

    /// Cancels the accept loop and waits for it to finish, up to `ctx`'s
    /// deadline. Idempotent and exactly-once, like `listen_and_serve`.
    pub async fn shutdown(&self, ctx: &Ctx) -> Result<(), Error> {
        let running_slot = &self.running;
        self.lifecycle
            .stop(|| async move {
                let running = running_slot.lock().await.take();
                let Some(running) = running else {
                    return Ok(());
                };
                running.cancel.cancel();
                ctx.select(async {
                    let _ = running.accept_loop.await;
                })
                .await
            })
            .await
            .map_err(|e| e.clone_shallow())?;
        Ok(())
    }
}

async fn accept_loop<H: ConnHandler + 'static>(
    listener: TcpListener,
    handler: Arc<H>,
    cancel: CancellationToken,
    error_tx: mpsc::UnboundedSender<Error>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("inbound accept loop cancelled");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((conn, peer_addr)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move { handler.handle(conn, peer_addr).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        let _ = error_tx.send(Error::with_cause(
                            corral2_error::Kind::Unavailable,
                            "accept failed",
                            e,
                        ));
                    }
                }
            }
        }
    }
}

/// `Arc<Error>` doesn't implement `Clone` of the inner value cheaply across
/// the `Result<(), Arc<Error>>` that [`Lifecycle`] returns and the
/// `Result<(), Error>` this crate's public API promises; this flattens one
/// into the other by re-describing it rather than holding onto the shared
/// `Arc`.
trait ClonedError {
    fn clone_shallow(&self) -> Error;
}

impl ClonedError for Error {
    fn clone_shallow(&self) -> Error {
        Error::new(self.kind(), self.message().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl ConnHandler for CountingHandler {
        async fn handle(&self, _conn: TcpStream, _peer_addr: SocketAddr) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn listener_is_none_until_bound() {
        let inbound = Inbound::new(Arc::new(CountingHandler(Arc::new(AtomicUsize::new(0)))));
        assert_eq!(inbound.listener().await, None);
    }

    #[tokio::test]
    async fn listen_and_serve_is_idempotent() {
        let inbound = Inbound::new(Arc::new(CountingHandler(Arc::new(AtomicUsize::new(0)))));
        inbound.listen_and_serve("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let first = inbound.listener().await.unwrap();

        inbound.listen_and_serve("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_eq!(inbound.listener().await.unwrap(), first);
    }

    #[tokio::test]
    async fn accepts_connections_and_dispatches_to_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inbound = Inbound::new(Arc::new(CountingHandler(calls.clone())));
        inbound.listen_and_serve("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = inbound.listener().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hi").await.unwrap();
        drop(client);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_the_accept_loop() {
        let inbound = Inbound::new(Arc::new(CountingHandler(Arc::new(AtomicUsize::new(0)))));
        inbound.listen_and_serve("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let ctx = Ctx::background().with_timeout(Duration::from_secs(1));
        inbound.shutdown(&ctx).await.unwrap();

        // idempotent: a second shutdown observes the same outcome.
        inbound.shutdown(&ctx).await.unwrap();
    }
}
