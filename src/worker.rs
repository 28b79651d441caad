//! Connection worker
//!
//! One task per admitted connection: handshake, receive loop, teardown.
//! Cancellation is cooperative; the token is raced against every read and
//! a cancelled worker unwinds through the same teardown as a disconnect.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::message::RelayMessage;
use crate::relay::BroadcastRelay;
use crate::slot::Outbound;
use crate::table::SlotTable;
use crate::types::{incomplete_utf8_tail, until_nul, Identifier, SlotLease};

/// State shared by every worker
pub struct WorkerContext {
    pub config: RelayConfig,
    pub table: Arc<SlotTable>,
    pub relay: Arc<BroadcastRelay>,
    /// Every spawned worker, including ones that already released their slot
    pub tracker: TaskTracker,
}

impl WorkerContext {
    pub fn new(config: RelayConfig) -> Self {
        let table = Arc::new(SlotTable::new(config.capacity));
        let relay = Arc::new(BroadcastRelay::new(Arc::clone(&table)));
        Self {
            config,
            table,
            relay,
            tracker: TaskTracker::new(),
        }
    }
}

/// Why a worker left its receive loop
#[derive(Debug)]
pub enum ExitReason {
    /// Zero-length read
    PeerClosed,
    /// Shutdown requested
    Cancelled,
    /// Read failed; fatal to this worker only
    Transport(io::Error),
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::PeerClosed => write!(f, "peer closed"),
            ExitReason::Cancelled => write!(f, "cancelled"),
            ExitReason::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

enum Received {
    Data(usize),
    Exit(ExitReason),
}

/// Reserve a slot for a new connection and start its worker
///
/// On a full table the stream is dropped here, closing it, and no task
/// is spawned.
pub fn admit<S>(stream: S, peer: &str, ctx: &Arc<WorkerContext>) -> Result<SlotLease, RelayError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let outbound = Outbound::new(writer);
    let cancel = CancellationToken::new();

    let lease = match ctx.table.reserve(outbound.clone(), cancel.clone()) {
        Ok(lease) => lease,
        Err(e) => {
            warn!("Rejecting connection from {}: {}", peer, e);
            return Err(e.into());
        }
    };
    info!("Client {} connected from {}", lease.index, peer);

    let worker = Worker {
        lease,
        reader,
        outbound,
        cancel,
        buf: vec![0u8; ctx.config.max_identifier_len.max(ctx.config.max_message_len)],
        ctx: Arc::clone(ctx),
    };
    let join = ctx.tracker.spawn(worker.run());

    if ctx.table.attach_worker(&lease, join).is_err() {
        // Still covered by the tracker until it exits.
        debug!("Worker for slot {} released its slot before it was attached", lease);
    }
    Ok(lease)
}

struct Worker<S> {
    lease: SlotLease,
    reader: ReadHalf<S>,
    outbound: Outbound,
    cancel: CancellationToken,
    buf: Vec<u8>,
    ctx: Arc<WorkerContext>,
}

impl<S> Worker<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn run(mut self) {
        let reason = self.serve().await;
        match &reason {
            ExitReason::Transport(_) => warn!("Client {} {}", self.lease.index, reason),
            _ => debug!("Client {} {}", self.lease.index, reason),
        }
        self.teardown().await;
    }

    async fn serve(&mut self) -> ExitReason {
        let limit = self.ctx.config.max_identifier_len;
        let identifier = match self.receive(limit).await {
            Received::Data(n) => Identifier::from_bytes(&self.buf[..n], limit),
            Received::Exit(ExitReason::PeerClosed) => {
                // Permissive: a client that closes before naming itself is logged in as "".
                self.log_in(Identifier::default());
                return ExitReason::PeerClosed;
            }
            Received::Exit(reason) => return reason,
        };
        self.log_in(identifier);

        let limit = self.ctx.config.max_message_len;
        let mut pending: Vec<u8> = Vec::new();
        loop {
            match self.receive(limit).await {
                Received::Data(n) => {
                    let read = &self.buf[..n];
                    let fragment = until_nul(read);
                    let terminated = fragment.len() < read.len();
                    pending.extend_from_slice(fragment);

                    // A character cut by the read size waits for its remaining bytes.
                    let held = if terminated { 0 } else { incomplete_utf8_tail(&pending) };
                    if held > 0 && held == pending.len() {
                        continue;
                    }
                    let tail = pending.split_off(pending.len() - held);
                    let body = std::mem::replace(&mut pending, tail);
                    self.ctx.relay.broadcast(&self.lease, body).await;
                }
                Received::Exit(reason) => {
                    if !pending.is_empty() && !matches!(reason, ExitReason::Cancelled) {
                        self.ctx.relay.broadcast(&self.lease, pending).await;
                    }
                    return reason;
                }
            }
        }
    }

    /// One read of at most `limit` bytes, or the cancellation signal
    async fn receive(&mut self, limit: usize) -> Received {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Received::Exit(ExitReason::Cancelled),
            result = self.reader.read(&mut self.buf[..limit]) => match result {
                Ok(0) => Received::Exit(ExitReason::PeerClosed),
                Ok(n) => Received::Data(n),
                Err(e) => Received::Exit(ExitReason::Transport(e)),
            },
        }
    }

    fn log_in(&self, identifier: Identifier) {
        info!("Client {} log-in (ID: {}).....", self.lease.index, identifier);
        if let Err(e) = self.ctx.table.set_identifier(&self.lease, identifier) {
            warn!("Client {}: {}", self.lease.index, e);
        }
    }

    /// Build the notice, close, release, then announce
    async fn teardown(self) {
        let identifier = self.ctx.table.identifier(&self.lease).unwrap_or_default();
        let notice = RelayMessage::logout(identifier.clone());

        if let Err(e) = self.outbound.close().await {
            debug!("Closing client {}: {}", self.lease.index, e);
        }
        self.ctx.table.release(&self.lease);
        info!("Client {} log-out (ID: {}).....", self.lease.index, identifier);

        self.ctx.relay.deliver(&self.lease, &notice).await;
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio::io::{AsyncWriteExt, DuplexStream, ReadBuf};

    use super::*;
    use crate::error::TableError;

    const WAIT: Duration = Duration::from_secs(2);

    fn context(capacity: usize) -> Arc<WorkerContext> {
        Arc::new(WorkerContext::new(RelayConfig::with_capacity(capacity)))
    }

    fn connect(ctx: &Arc<WorkerContext>) -> Result<(SlotLease, DuplexStream), RelayError> {
        let (server, client) = tokio::io::duplex(1024);
        admit(server, "test", ctx).map(|lease| (lease, client))
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn login(ctx: &Arc<WorkerContext>, client: &mut DuplexStream, lease: SlotLease, name: &str) {
        client.write_all(name.as_bytes()).await.unwrap();
        let table = Arc::clone(&ctx.table);
        wait_until(move || table.identifier(&lease).is_some()).await;
    }

    async fn read_frame(stream: &mut DuplexStream) -> String {
        tokio::time::timeout(WAIT, async {
            let mut frame = Vec::new();
            loop {
                let byte = stream.read_u8().await.unwrap();
                if byte == 0 {
                    return String::from_utf8(frame).unwrap();
                }
                frame.push(byte);
            }
        })
        .await
        .expect("no frame received")
    }

    #[tokio::test]
    async fn test_message_relayed_and_logout_announced() {
        let ctx = context(2);
        let (alice_lease, mut alice) = connect(&ctx).unwrap();
        let (bob_lease, mut bob) = connect(&ctx).unwrap();
        login(&ctx, &mut alice, alice_lease, "alice").await;
        login(&ctx, &mut bob, bob_lease, "bob").await;

        alice.write_all(b"hello").await.unwrap();
        assert_eq!(read_frame(&mut bob).await, "alice> hello");

        drop(bob);
        assert_eq!(read_frame(&mut alice).await, "bob> log-out.....\n");

        let table = Arc::clone(&ctx.table);
        wait_until(move || table.active_count() == 1).await;
    }

    #[tokio::test]
    async fn test_full_table_rejects_without_spawning() {
        let ctx = context(1);
        let (_lease, _alice) = connect(&ctx).unwrap();

        let rejected = connect(&ctx);
        assert!(matches!(
            rejected,
            Err(RelayError::Table(TableError::Full { capacity: 1 }))
        ));
        assert_eq!(ctx.table.active_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_stream_is_closed() {
        let ctx = context(1);
        let (_lease, _alice) = connect(&ctx).unwrap();

        let (server, mut client) = tokio::io::duplex(64);
        assert!(admit(server, "late", &ctx).is_err());

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_blocked_read() {
        let ctx = context(1);
        let (lease, mut client) = connect(&ctx).unwrap();
        login(&ctx, &mut client, lease, "idle").await;

        let entries = ctx.table.drain_workers();
        assert_eq!(entries.len(), 1);
        let entry = entries.into_iter().next().unwrap();

        entry.cancel.cancel();
        tokio::time::timeout(WAIT, entry.join.unwrap())
            .await
            .expect("worker did not stop")
            .unwrap();

        assert_eq!(ctx.table.active_count(), 0);
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_identifier_on_early_close() {
        let ctx = context(2);
        let (alice_lease, mut alice) = connect(&ctx).unwrap();
        login(&ctx, &mut alice, alice_lease, "alice").await;

        let (_lease, silent) = connect(&ctx).unwrap();
        drop(silent);

        assert_eq!(read_frame(&mut alice).await, "> log-out.....\n");
    }

    /// Stream whose reads always fail
    struct Broken;

    impl AsyncRead for Broken {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        }
    }

    impl AsyncWrite for Broken {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_transport_error_only_ends_its_worker() {
        let ctx = context(2);
        let (alice_lease, mut alice) = connect(&ctx).unwrap();
        login(&ctx, &mut alice, alice_lease, "alice").await;

        admit(Broken, "broken", &ctx).unwrap();
        assert_eq!(read_frame(&mut alice).await, "> log-out.....\n");

        let table = Arc::clone(&ctx.table);
        wait_until(move || table.active_count() == 1).await;
        assert!(table_has(&ctx, "alice"));
    }

    #[tokio::test]
    async fn test_nul_ends_fragment() {
        let ctx = context(2);
        let (alice_lease, mut alice) = connect(&ctx).unwrap();
        let (bob_lease, mut bob) = connect(&ctx).unwrap();
        login(&ctx, &mut alice, alice_lease, "alice").await;
        login(&ctx, &mut bob, bob_lease, "bob").await;

        alice.write_all(b"hi\0mallory> fake").await.unwrap();
        assert_eq!(read_frame(&mut bob).await, "alice> hi");

        // No second frame carrying another sender's name
        let mut buf = [0u8; 1];
        let extra = tokio::time::timeout(Duration::from_millis(100), bob.read(&mut buf)).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_character_split_by_read_size_is_kept_whole() {
        let ctx = context(2);
        let (alice_lease, mut alice) = connect(&ctx).unwrap();
        let (bob_lease, mut bob) = connect(&ctx).unwrap();
        login(&ctx, &mut alice, alice_lease, "alice").await;
        login(&ctx, &mut bob, bob_lease, "bob").await;

        // 257 bytes: the default 256-byte read ends between the two bytes of "é"
        let sent = format!("{}é", "a".repeat(255));
        alice.write_all(sent.as_bytes()).await.unwrap();

        let mut received = String::new();
        while received.len() < sent.len() {
            // read_frame rejects frames that are not valid UTF-8
            let frame = read_frame(&mut bob).await;
            received.push_str(frame.strip_prefix("alice> ").unwrap());
        }
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_identifier_fixed_after_handshake() {
        let ctx = context(2);
        let (alice_lease, mut alice) = connect(&ctx).unwrap();
        let (carol_lease, mut carol) = connect(&ctx).unwrap();
        login(&ctx, &mut alice, alice_lease, "alice").await;
        login(&ctx, &mut carol, carol_lease, "carol").await;

        // A later fragment that looks like a name is just chat
        alice.write_all(b"bob").await.unwrap();
        assert_eq!(read_frame(&mut carol).await, "alice> bob");
        assert_eq!(ctx.table.identifier(&alice_lease).unwrap().as_str(), "alice");

        alice.write_all(b"again").await.unwrap();
        assert_eq!(read_frame(&mut carol).await, "alice> again");
    }

    fn table_has(ctx: &WorkerContext, name: &str) -> bool {
        ctx.table
            .snapshot()
            .iter()
            .any(|s| s.identifier.as_ref().map(|i| i.as_str()) == Some(name))
    }
}
