//! Client slot definition
//!
//! Represents one entry of the client table together with the write side
//! of its connection and the handle of the worker serving it.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::DeliveryError;
use crate::types::{Identifier, SlotIndex, SlotLease};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct OutboundInner {
    writer: BoxedWriter,
    shut_down: bool,
}

/// Write side of a client connection
///
/// Cloned into broadcast snapshots; the async mutex serializes frames so
/// two fan-outs never interleave bytes on one socket. The `closed` token
/// sits outside the mutex so a close can interrupt a write that is stuck
/// on a peer that stopped reading.
#[derive(Clone)]
pub struct Outbound {
    inner: Arc<Mutex<OutboundInner>>,
    closed: CancellationToken,
}

impl Outbound {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(OutboundInner {
                writer: Box::new(writer),
                shut_down: false,
            })),
            closed: CancellationToken::new(),
        }
    }

    /// Write one whole frame and flush it
    ///
    /// Fails with `NotConnected` if the handle is closed before or while
    /// the frame is being written.
    pub async fn send(&self, frame: &[u8]) -> Result<(), DeliveryError> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                Err(io::Error::from(io::ErrorKind::NotConnected).into())
            }
            result = self.write_frame(frame) => result,
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), DeliveryError> {
        let mut inner = self.inner.lock().await;
        inner.writer.write_all(frame).await?;
        inner.writer.flush().await?;
        Ok(())
    }

    /// Refuse further writes and abandon any write in flight
    ///
    /// Does not wait for the lock, so it never blocks behind a stalled peer.
    pub fn abort(&self) {
        self.closed.cancel();
    }

    /// Abort, then shut down the write side
    ///
    /// Idempotent: only the first call touches the transport.
    pub async fn close(&self) -> io::Result<()> {
        self.abort();
        let mut inner = self.inner.lock().await;
        if inner.shut_down {
            return Ok(());
        }
        inner.shut_down = true;
        inner.writer.shutdown().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound").finish_non_exhaustive()
    }
}

/// Handle on the task serving a slot
///
/// Used only by the shutdown coordinator: cancel, then join.
#[derive(Debug)]
pub struct WorkerHandle {
    pub cancel: CancellationToken,
    pub join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel, join: None }
    }
}

/// One entry in the client table
#[derive(Debug)]
pub struct ClientSlot {
    /// Fixed position in the table
    pub index: SlotIndex,
    /// Reservation counter, bumped on every reserve
    pub generation: u64,
    /// True from reservation until release
    pub active: bool,
    /// Handshake identifier (None before handshake)
    pub identifier: Option<Identifier>,
    /// Connection write side, owned while active
    pub outbound: Option<Outbound>,
    /// Worker serving this reservation
    pub worker: Option<WorkerHandle>,
}

impl ClientSlot {
    /// Create an inactive slot at the given position
    pub fn new(index: SlotIndex) -> Self {
        Self {
            index,
            generation: 0,
            active: false,
            identifier: None,
            outbound: None,
            worker: None,
        }
    }

    /// Whether `lease` refers to the current reservation of this slot
    pub fn is_held_by(&self, lease: &SlotLease) -> bool {
        self.active && self.index == lease.index && self.generation == lease.generation
    }

    pub fn lease(&self) -> SlotLease {
        SlotLease::new(self.index, self.generation)
    }

    /// Claim the slot for a new connection
    pub fn occupy(&mut self, outbound: Outbound, cancel: CancellationToken) -> SlotLease {
        self.generation += 1;
        self.active = true;
        self.identifier = None;
        self.outbound = Some(outbound);
        self.worker = Some(WorkerHandle::new(cancel));
        self.lease()
    }

    /// Return the slot to the free pool, dropping the table's handles
    pub fn vacate(&mut self) {
        self.active = false;
        self.identifier = None;
        self.outbound = None;
        self.worker = None;
    }

    /// Display name, or "" before the handshake
    pub fn display_name(&self) -> &str {
        self.identifier.as_ref().map(Identifier::as_str).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_creation() {
        let slot = ClientSlot::new(SlotIndex(2));
        assert!(!slot.active);
        assert!(slot.identifier.is_none());
        assert_eq!(slot.display_name(), "");
    }

    #[test]
    fn test_occupy_bumps_generation() {
        let mut slot = ClientSlot::new(SlotIndex(0));
        let first = slot.occupy(Outbound::new(tokio::io::sink()), CancellationToken::new());
        slot.vacate();
        let second = slot.occupy(Outbound::new(tokio::io::sink()), CancellationToken::new());

        assert_ne!(first, second);
        assert!(!slot.is_held_by(&first));
        assert!(slot.is_held_by(&second));
    }

    #[tokio::test]
    async fn test_outbound_close_is_idempotent() {
        let (client, _server) = tokio::io::duplex(64);
        let outbound = Outbound::new(client);

        assert!(outbound.close().await.is_ok());
        assert!(outbound.close().await.is_ok());
        assert!(outbound.is_closed());
        assert!(outbound.send(b"late\0").await.is_err());
    }

    #[tokio::test]
    async fn test_abort_interrupts_stalled_send() {
        // Peer never reads and the frame is larger than the pipe
        let (client, _server) = tokio::io::duplex(8);
        let outbound = Outbound::new(client);

        let stalled = {
            let outbound = outbound.clone();
            tokio::spawn(async move { outbound.send(&[b'x'; 64]).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!stalled.is_finished());

        outbound.abort();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), stalled)
            .await
            .expect("send still blocked after abort")
            .unwrap();
        assert!(result.is_err());

        // The lock was released, so close completes
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), outbound.close())
            .await
            .expect("close blocked");
    }

    #[tokio::test]
    async fn test_outbound_send_writes_frame() {
        use tokio::io::AsyncReadExt;

        let (client, mut server) = tokio::io::duplex(64);
        let outbound = Outbound::new(client);
        outbound.send(b"a> b\0").await.unwrap();

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"a> b\0");
    }
}
