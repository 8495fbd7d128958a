//! Log multiplexing.
//!
//! Every formatted log record in the process goes through one installable
//! [`LogSink`]. The [`SinkRegistry`] owns that slot and is handed to
//! `tracing-subscriber`'s fmt layer as its writer:
//!
//! ```text
//! tracing::info!() ──► fmt layer ──► SinkRegistry ──► current sink
//!                                                      │
//!                          StderrSink ◄────────────────┤ (always)
//!                          connection queue ◄──────────┘ (console mode)
//! ```
//!
//! Installing a sink hands back the one it replaced, so a session can put
//! things back exactly as it found them. Console mode goes through
//! [`SinkRegistry::claim_console`], which only one session at a time can
//! hold.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing_subscriber::fmt::MakeWriter;

use crate::error::TelconError;

/// Default bound on a single record forwarded to the connection.
pub const DEFAULT_LOG_BUFFER_SIZE: usize = 1024;

/// Default number of chunks queued for a connection before new ones are
/// dropped.
pub const DEFAULT_OUTBOUND_QUEUE_LEN: usize = 256;

/// Shared handle to a sink.
pub type SharedSink = Arc<dyn LogSink>;

// ── Outbound ─────────────────────────────────────────────────────

/// Bounded, ordered queue of bytes bound for one connection.
///
/// Pushing never waits: when a slow peer lets the queue fill up, the chunk
/// is dropped and counted. Clones share the queue and the counter.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Bytes>,
    dropped: Arc<AtomicU64>,
}

impl Outbound {
    /// A queue holding up to `capacity` chunks (at least one), and the
    /// receiving end for the connection writer.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let outbound = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (outbound, rx)
    }

    /// Queue `chunk`. A full queue drops it; a closed one is an error.
    pub fn push(&self, chunk: Bytes) -> Result<(), TelconError> {
        match self.tx.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(TelconError::ChannelClosed),
        }
    }

    /// Chunks dropped so far because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Destination for one formatted log record.
pub trait LogSink: Send + Sync {
    fn write_record(&self, record: &[u8]) -> Result<(), TelconError>;
}

// ── StderrSink ───────────────────────────────────────────────────

/// The local output device.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write_record(&self, record: &[u8]) -> Result<(), TelconError> {
        std::io::stderr().lock().write_all(record)?;
        Ok(())
    }
}

// ── MemorySink ───────────────────────────────────────────────────

/// Collects records in memory, for hosts that want to inspect their own
/// log output.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Vec<u8>> {
        self.records.lock().clone()
    }

    /// All records concatenated and decoded lossily.
    pub fn contents(&self) -> String {
        let records = self.records.lock();
        records
            .iter()
            .map(|r| String::from_utf8_lossy(r))
            .collect::<Vec<_>>()
            .concat()
    }
}

impl LogSink for MemorySink {
    fn write_record(&self, record: &[u8]) -> Result<(), TelconError> {
        self.records.lock().push(record.to_vec());
        Ok(())
    }
}

// ── ConnectionSink ───────────────────────────────────────────────

/// Console-mode sink: local output first, then a copy onto the connection.
///
/// The copy is cut to `max_record_len` bytes and followed by a single CR so
/// that a Telnet client returns the cursor to column 0.
pub struct ConnectionSink {
    local: SharedSink,
    outbound: Outbound,
    max_record_len: usize,
}

impl ConnectionSink {
    pub fn new(local: SharedSink, outbound: Outbound, max_record_len: usize) -> Self {
        Self {
            local,
            outbound,
            max_record_len,
        }
    }
}

impl LogSink for ConnectionSink {
    fn write_record(&self, record: &[u8]) -> Result<(), TelconError> {
        let local = self.local.write_record(record);

        let len = record.len().min(self.max_record_len);
        let mut frame = BytesMut::with_capacity(len + 1);
        frame.extend_from_slice(&record[..len]);
        frame.extend_from_slice(b"\r");
        self.outbound.push(frame.freeze())?;

        local
    }
}

// ── SinkRegistry ─────────────────────────────────────────────────

/// Proof of console ownership, handed back to
/// [`SinkRegistry::release_console`].
pub struct ConsoleClaim {
    prior: SharedSink,
    installed: SharedSink,
}

impl ConsoleClaim {
    /// The sink that was current when the claim was made.
    pub fn prior(&self) -> &SharedSink {
        &self.prior
    }

    /// The sink the claim installed.
    pub fn installed(&self) -> &SharedSink {
        &self.installed
    }
}

struct Slot {
    current: SharedSink,
    console_claimed: bool,
}

/// The process-wide sink slot.
///
/// Cloning shares the slot. The lock is only held to swap or clone the
/// current `Arc`, never while a record is being written.
#[derive(Clone)]
pub struct SinkRegistry {
    slot: Arc<RwLock<Slot>>,
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::new(Arc::new(StderrSink))
    }
}

impl SinkRegistry {
    pub fn new(initial: SharedSink) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Slot {
                current: initial,
                console_claimed: false,
            })),
        }
    }

    /// The sink records currently go to.
    pub fn current(&self) -> SharedSink {
        self.slot.read().current.clone()
    }

    /// Install `sink` and return the one it replaced.
    pub fn install(&self, sink: SharedSink) -> SharedSink {
        std::mem::replace(&mut self.slot.write().current, sink)
    }

    /// Build a sink from the one currently installed and swap it in, as a
    /// single step under the lock. Returns the replaced sink.
    pub fn install_with<F>(&self, make: F) -> SharedSink
    where
        F: FnOnce(&SharedSink) -> SharedSink,
    {
        let mut slot = self.slot.write();
        let next = make(&slot.current);
        std::mem::replace(&mut slot.current, next)
    }

    /// Like [`install_with`](Self::install_with), for console mode. Returns
    /// `None` without touching the slot while another claim is held.
    pub fn claim_console<F>(&self, make: F) -> Option<ConsoleClaim>
    where
        F: FnOnce(&SharedSink) -> SharedSink,
    {
        let mut slot = self.slot.write();
        if slot.console_claimed {
            return None;
        }
        let installed = make(&slot.current);
        let prior = std::mem::replace(&mut slot.current, Arc::clone(&installed));
        slot.console_claimed = true;
        Some(ConsoleClaim { prior, installed })
    }

    /// End a console claim. The prior sink goes back only if the slot still
    /// holds the sink the claim installed; returns whether it did.
    pub fn release_console(&self, claim: ConsoleClaim) -> bool {
        let mut slot = self.slot.write();
        slot.console_claimed = false;
        if Arc::ptr_eq(&slot.current, &claim.installed) {
            slot.current = claim.prior;
            true
        } else {
            false
        }
    }

    /// Whether a session currently holds the console.
    pub fn console_claimed(&self) -> bool {
        self.slot.read().console_claimed
    }

    /// Put a previously returned sink back. The sink being removed is
    /// returned so the caller decides when it is dropped.
    pub fn restore(&self, prior: SharedSink) -> SharedSink {
        self.install(prior)
    }

    /// Write one record through the current sink.
    pub fn emit(&self, record: &[u8]) -> Result<(), TelconError> {
        self.current().write_record(record)
    }
}

impl std::fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkRegistry").finish_non_exhaustive()
    }
}

/// Per-record writer handed out to the fmt layer.
pub struct SinkWriter {
    sink: SharedSink,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.sink.write_record(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SinkRegistry {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            sink: self.current(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
