use crate::observer::{Direction, NoopObserver, Observer, TlsEvent, TlsMode, TlsOutcome};
use crate::sniff::{looks_like_tls_clienthello, SniffStream};
use crate::stream::MuxedStream;
use corral2_error::{Error, Kind};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// The wrapping listener: classifies each accepted connection as TLS or
/// plaintext and dispatches accordingly, honoring `mode`'s
/// enforced/permissive/disabled policy.
pub struct TlsMux {
    mode: TlsMode,
    acceptor: Option<tokio_rustls::TlsAcceptor>,
    observer: Arc<dyn Observer>,
    service: String,
    transport: String,
    sniff_deadline: Duration,
    handshake_timeout: Duration,
}

impl TlsMux {
    pub const DEFAULT_SNIFF_DEADLINE: Duration = Duration::from_secs(15);
    pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

    /// `config` is the caller's already-built server config (PKI sourcing
    /// is out of scope here); it may be omitted only in `Disabled` mode.
    pub fn new(
        mode: TlsMode,
        config: Option<Arc<rustls::ServerConfig>>,
        service: impl Into<String>,
        transport: impl Into<String>,
    ) -> Self {
        Self {
            mode,
            acceptor: config.map(tokio_rustls::TlsAcceptor::from),
            observer: Arc::new(NoopObserver),
            service: service.into(),
            transport: transport.into(),
            sniff_deadline: Self::DEFAULT_SNIFF_DEADLINE,
            handshake_timeout: Self::DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_sniff_deadline(mut self, deadline: Duration) -> Self {
        self.sniff_deadline = deadline;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sniffs, classifies, and (if TLS) hands off to a handshake -- all
    /// within `self.handshake_timeout` of the accept, per connection. The
    /// caller is expected to run this per accepted connection on its own
    /// task, so a slow handshake doesn't block acceptance of the next
    /// connection.
    pub async fn accept<IO>(&self, conn: IO, dest: impl Into<String>) -> Result<MuxedStream<IO>, Error>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let dest = dest.into();

        if self.mode == TlsMode::Disabled {
            return Ok(MuxedStream::Plain(SniffStream::passthrough(conn)));
        }

        let (sniffed, prefix) = SniffStream::sniff(conn, self.sniff_deadline).await?;

        if looks_like_tls_clienthello(&prefix) {
            self.handshake(sniffed, dest).await
        } else if self.mode == TlsMode::Enforced {
            self.observer
                .observe(self.event(dest, None, TlsOutcome::PlaintextRejected))
                .await;
            Err(Error::failed_precondition(
                "plaintext connection rejected by enforced tls mode",
            ))
        } else {
            self.observer.observe(self.event(dest, None, TlsOutcome::Plaintext)).await;
            Ok(MuxedStream::Plain(sniffed))
        }
    }

    async fn handshake<IO>(&self, sniffed: SniffStream<IO>, dest: String) -> Result<MuxedStream<IO>, Error>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let acceptor = self
            .acceptor
            .clone()
            .ok_or_else(|| Error::failed_precondition("tls mode requires a server config"))?;

        match tokio::time::timeout(self.handshake_timeout, acceptor.accept(sniffed)).await {
            Ok(Ok(stream)) => {
                let version = stream.get_ref().1.protocol_version().map(|v| format!("{:?}", v));
                self.observer
                    .observe(self.event(dest, version, TlsOutcome::HandshakeSucceeded))
                    .await;
                Ok(MuxedStream::Tls(stream))
            }
            Ok(Err(e)) => {
                self.observer
                    .observe(self.event(dest, None, TlsOutcome::HandshakeFailed))
                    .await;
                Err(Error::with_cause(Kind::Unavailable, "tls handshake failed", e))
            }
            Err(_) => {
                self.observer
                    .observe(self.event(dest, None, TlsOutcome::HandshakeFailed))
                    .await;
                Err(Error::deadline_exceeded("tls handshake timed out"))
            }
        }
    }

    fn event(&self, dest: String, version: Option<String>, outcome: TlsOutcome) -> TlsEvent {
        TlsEvent {
            service: self.service.clone(),
            transport: self.transport.clone(),
            direction: Direction::Inbound,
            mode: self.mode,
            dest,
            version,
            outcome,
        }
    }
}
