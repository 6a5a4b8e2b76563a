use async_trait::async_trait;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TlsMode {
    Enforced,
    Permissive,
    Disabled,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TlsOutcome {
    HandshakeSucceeded,
    HandshakeFailed,
    Plaintext,
    PlaintextRejected,
}

/// One `(service, transport, direction, mode, dest, version?)` observation:
/// handshake failures and successes are each counted in an observer with
/// this tag set.
#[derive(Clone, Debug)]
pub struct TlsEvent {
    pub service: String,
    pub transport: String,
    pub direction: Direction,
    pub mode: TlsMode,
    pub dest: String,
    pub version: Option<String>,
    pub outcome: TlsOutcome,
}

#[async_trait]
pub trait Observer: Send + Sync {
    async fn observe(&self, event: TlsEvent);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

#[async_trait]
impl Observer for NoopObserver {
    async fn observe(&self, _event: TlsEvent) {}
}
