//! Per-connection command loop.
//!
//! ```text
//!  socket ──read_buf──► ConsoleCodec ──ConsoleFrame──► Session::dispatch
//!    ▲                                                   │
//!    │                                                   ├─ quit_telnet
//!    │                                                   ├─ start_console / quit_console
//!    │                                                   └─ CommandHandler
//!    │
//!  writer task ◄── outbound queue ◄── prompts + ConnectionSink records
//! ```
//!
//! Everything bound for the peer goes through one bounded queue drained by
//! a writer task. Log records from any thread and prompts from the loop
//! therefore arrive in the order they were produced, and a thread that logs
//! never waits on the network. When a slow peer lets the queue fill up,
//! new chunks are dropped and counted in [`SessionStats::dropped`].

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Decoder;
use tracing::{debug, error, info, warn};

use crate::codec::{ConsoleCodec, ConsoleFrame, DEFAULT_MAX_LINE_LEN};
use crate::error::TelconError;
use crate::sink::{
    ConnectionSink, ConsoleClaim, DEFAULT_LOG_BUFFER_SIZE, DEFAULT_OUTBOUND_QUEUE_LEN, Outbound,
    SharedSink, SinkRegistry,
};

/// Ends the session and closes the connection.
pub const QUIT_TELNET: &str = "quit_telnet";
/// Starts mirroring the process log onto the connection.
pub const START_CONSOLE: &str = "start_console";
/// Stops mirroring the process log.
pub const QUIT_CONSOLE: &str = "quit_console";

/// Prompt written after each command while the console is running.
pub const DEFAULT_PROMPT: &str = "con>";

const READ_CHUNK: usize = 512;

/// Sent instead of starting the console when another connection holds it.
const CONSOLE_BUSY: &[u8] = b"console is in use by another connection\r\n";

// ── CommandHandler ───────────────────────────────────────────────

/// Application hook for every line that is not a built-in.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, command: &str);
}

impl<F> CommandHandler for F
where
    F: Fn(&str) + Send + Sync,
{
    fn handle(&self, command: &str) {
        self(command)
    }
}

pub type SharedHandler = Arc<dyn CommandHandler>;

// ── Configuration ────────────────────────────────────────────────

/// What to do when reading from the connection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadErrorPolicy {
    /// End the session.
    #[default]
    Fatal,

    /// Sleep and read again.
    Retry {
        backoff: Duration,
        /// Retries after consecutive failures before giving up (0 = no
        /// limit). With 2, the third failure in a row ends the session.
        max_retries: u32,
    },
}

/// Session tuning, shared by every connection an acceptor serves.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Longest command line accepted, in bytes.
    pub max_line_len: usize,
    /// Bytes written after each processed command in console mode.
    pub prompt: Bytes,
    /// Longest log record copied onto the connection.
    pub log_buffer_size: usize,
    /// Chunks queued for the connection before new ones are dropped.
    pub outbound_queue_len: usize,
    pub read_errors: ReadErrorPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_line_len: DEFAULT_MAX_LINE_LEN,
            prompt: Bytes::from_static(DEFAULT_PROMPT.as_bytes()),
            log_buffer_size: DEFAULT_LOG_BUFFER_SIZE,
            outbound_queue_len: DEFAULT_OUTBOUND_QUEUE_LEN,
            read_errors: ReadErrorPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), TelconError> {
        if self.max_line_len == 0 {
            return Err(TelconError::InvalidConfig("max_line_len must be > 0".into()));
        }
        if self.log_buffer_size == 0 {
            return Err(TelconError::InvalidConfig("log_buffer_size must be > 0".into()));
        }
        if self.outbound_queue_len == 0 {
            return Err(TelconError::InvalidConfig("outbound_queue_len must be > 0".into()));
        }
        if self.prompt.is_empty() {
            return Err(TelconError::InvalidConfig("prompt must not be empty".into()));
        }
        Ok(())
    }
}

// ── ConsoleMode ──────────────────────────────────────────────────

/// Whether the process log is mirrored onto this connection.
///
/// The registry claim, and with it the sink to put back, travels with the
/// `Active` state, so there is no way to be in console mode without
/// something to restore, nor to restore without having been in console mode.
#[derive(Default)]
pub enum ConsoleMode {
    #[default]
    Inactive,
    Active {
        claim: ConsoleClaim,
    },
}

impl ConsoleMode {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }
}

impl std::fmt::Debug for ConsoleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inactive => write!(f, "Inactive"),
            Self::Active { .. } => write!(f, "Active"),
        }
    }
}

// ── Outcome ──────────────────────────────────────────────────────

/// Result of dispatching one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Quit,
}

/// Why a session loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer sent `quit_telnet`.
    Quit,
    /// The peer closed the connection.
    PeerClosed,
    /// Reading failed and the read-error policy gave up.
    ReadError(std::io::ErrorKind),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Completed lines, including empty ones and built-ins.
    pub lines: u64,
    /// Lines forwarded to the command handler.
    pub commands: u64,
    /// Lines dropped for exceeding the length limit.
    pub overflows: u64,
    /// Read errors seen.
    pub read_errors: u64,
    /// Chunks dropped because the outbound queue was full.
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub stats: SessionStats,
}

// ── Session ──────────────────────────────────────────────────────

/// Command interpreter for one connection.
///
/// Dropping a session in console mode restores the sink it replaced.
pub struct Session {
    config: SessionConfig,
    sinks: SinkRegistry,
    handler: SharedHandler,
    outbound: Outbound,
    mode: ConsoleMode,
    stats: SessionStats,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        sinks: SinkRegistry,
        handler: SharedHandler,
        outbound: Outbound,
    ) -> Self {
        Self {
            config,
            sinks,
            handler,
            outbound,
            mode: ConsoleMode::Inactive,
            stats: SessionStats::default(),
        }
    }

    pub fn mode(&self) -> &ConsoleMode {
        &self.mode
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            dropped: self.outbound.dropped(),
            ..self.stats
        }
    }

    /// Act on one decoded frame.
    pub fn handle_frame(&mut self, frame: ConsoleFrame) -> Dispatch {
        match frame {
            ConsoleFrame::Line(line) => self.dispatch(&line),
            ConsoleFrame::Overflow { discarded } => {
                self.stats.overflows += 1;
                error!(
                    "command is too long to execute, only {} characters allowed ({discarded} dropped)",
                    self.config.max_line_len
                );
                Dispatch::Continue
            }
        }
    }

    /// Act on one completed command line.
    pub fn dispatch(&mut self, line: &str) -> Dispatch {
        self.stats.lines += 1;

        match line {
            "" => {}
            QUIT_TELNET => {
                info!("quitting telnet...");
                self.leave_console();
                return Dispatch::Quit;
            }
            START_CONSOLE => self.start_console(),
            QUIT_CONSOLE => self.quit_console(),
            command => {
                self.stats.commands += 1;
                self.handler.handle(command);
            }
        }

        if self.mode.is_active() {
            self.send_prompt();
        }
        Dispatch::Continue
    }

    /// Restore the log sink if the console is still running.
    pub fn finish(&mut self) -> SessionStats {
        self.leave_console();
        self.stats()
    }

    fn start_console(&mut self) {
        if self.mode.is_active() {
            warn!("console is already running");
            return;
        }

        let outbound = self.outbound.clone();
        let max_record_len = self.config.log_buffer_size;
        let Some(claim) = self.sinks.claim_console(|local| -> SharedSink {
            Arc::new(ConnectionSink::new(Arc::clone(local), outbound, max_record_len))
        }) else {
            warn!("console is already running on another connection");
            if let Err(e) = self.outbound.push(Bytes::from_static(CONSOLE_BUSY)) {
                warn!("unable to send busy notice: {e}");
            }
            return;
        };

        self.mode = ConsoleMode::Active { claim };
        info!("starting the console on telnet client...");
        info!("now you can see all the logs of the server here. You can also enter registered commands.");
    }

    fn quit_console(&mut self) {
        if !self.mode.is_active() {
            warn!("console can not be turned off when it is not running");
            return;
        }

        info!("quitting the console on telnet client...");
        self.leave_console();
    }

    /// Release the console claim taken by `start_console`, if any.
    fn leave_console(&mut self) {
        if let ConsoleMode::Active { claim } = std::mem::take(&mut self.mode) {
            if !self.sinks.release_console(claim) {
                warn!("log sink was replaced while the console ran; leaving it in place");
            }
        }
    }

    fn send_prompt(&self) {
        if self.outbound.push(self.config.prompt.clone()).is_err() {
            warn!("unable to send prompt: connection writer has stopped");
        }
    }

    /// Read and dispatch until the peer quits, closes, or reading fails
    /// for good.
    async fn read_loop<R>(
        &mut self,
        reader: &mut R,
        codec: &mut ConsoleCodec,
    ) -> Result<SessionEnd, TelconError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let mut failures: u32 = 0;

        loop {
            buf.reserve(READ_CHUNK);
            match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    warn!("connection closed");
                    return Ok(SessionEnd::PeerClosed);
                }
                Ok(n) => {
                    failures = 0;
                    debug!("received {n} bytes");
                    while let Some(frame) = codec.decode(&mut buf)? {
                        if self.handle_frame(frame) == Dispatch::Quit {
                            return Ok(SessionEnd::Quit);
                        }
                    }
                }
                Err(e) => {
                    self.stats.read_errors += 1;
                    error!("error occurred during receiving: {e}");
                    match self.config.read_errors {
                        ReadErrorPolicy::Fatal => return Ok(SessionEnd::ReadError(e.kind())),
                        ReadErrorPolicy::Retry {
                            backoff,
                            max_retries,
                        } => {
                            failures += 1;
                            if max_retries != 0 && failures > max_retries {
                                error!("giving up after {failures} consecutive read errors");
                                return Ok(SessionEnd::ReadError(e.kind()));
                            }
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.leave_console();
    }
}

// ── Console ──────────────────────────────────────────────────────

/// Everything a connection needs to run a session: tuning, the sink slot
/// and the application command handler. Cheap to clone.
#[derive(Clone)]
pub struct Console {
    config: SessionConfig,
    sinks: SinkRegistry,
    handler: SharedHandler,
}

impl Console {
    pub fn new(config: SessionConfig, sinks: SinkRegistry, handler: SharedHandler) -> Self {
        Self {
            config,
            sinks,
            handler,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn sinks(&self) -> &SinkRegistry {
        &self.sinks
    }

    /// A session bound to `outbound`, for callers that run their own I/O.
    pub fn session(&self, outbound: Outbound) -> Session {
        Session::new(
            self.config.clone(),
            self.sinks.clone(),
            Arc::clone(&self.handler),
            outbound,
        )
    }

    /// Run a full session over `stream`, then flush and shut down its
    /// write side.
    pub async fn serve<S>(&self, stream: S) -> Result<SessionReport, TelconError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let (tx, rx) = Outbound::channel(self.config.outbound_queue_len);
        let (stop_tx, stop_rx) = oneshot::channel();
        let writer_task = tokio::spawn(drain_outbound(writer, rx, stop_rx));

        let mut session = self.session(tx);
        let mut codec = ConsoleCodec::new(self.config.max_line_len);
        let end = session.read_loop(&mut reader, &mut codec).await;
        let stats = session.finish();
        drop(session);

        let _ = stop_tx.send(());
        match writer_task.await {
            Ok(mut writer) => {
                if let Err(e) = writer.shutdown().await {
                    debug!("shutdown after session: {e}");
                }
            }
            Err(e) => error!("connection writer task failed: {e}"),
        }

        let end = end?;
        info!(
            "session ended ({end:?}): {} lines, {} commands, {} overflows, {} dropped",
            stats.lines, stats.commands, stats.overflows, stats.dropped
        );
        Ok(SessionReport { end, stats })
    }
}

/// Writer task: copy queued chunks to the connection until told to stop,
/// then flush what is already queued.
async fn drain_outbound<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Bytes>,
    mut stop: oneshot::Receiver<()>,
) -> W
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    if let Err(e) = writer.write_all(&chunk).await {
                        warn!("error occurred during sending: {e}");
                        return writer;
                    }
                }
                None => break,
            },
            _ = &mut stop => {
                while let Ok(chunk) = rx.try_recv() {
                    if writer.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    if let Err(e) = writer.flush().await {
        debug!("flush failed: {e}");
    }
    writer
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use parking_lot::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl CommandHandler for Recorder {
        fn handle(&self, command: &str) {
            self.seen.lock().push(command.to_string());
        }
    }

    struct Harness {
        session: Session,
        rx: mpsc::Receiver<Bytes>,
        original: SharedSink,
        sinks: SinkRegistry,
        recorder: Arc<Recorder>,
    }

    impl Harness {
        fn new() -> Self {
            let original: SharedSink = Arc::new(MemorySink::new());
            Self::on(SinkRegistry::new(Arc::clone(&original)), original)
        }

        /// A second session sharing `sinks`, whose starting sink is `original`.
        fn on(sinks: SinkRegistry, original: SharedSink) -> Self {
            let recorder = Arc::new(Recorder {
                seen: Mutex::new(Vec::new()),
            });
            let (tx, rx) = Outbound::channel(64);
            let session = Session::new(
                SessionConfig::default(),
                sinks.clone(),
                recorder.clone(),
                tx,
            );
            Self {
                session,
                rx,
                original,
                sinks,
                recorder,
            }
        }

        fn sent(&mut self) -> Vec<Bytes> {
            let mut out = Vec::new();
            while let Ok(chunk) = self.rx.try_recv() {
                out.push(chunk);
            }
            out
        }

        fn sink_is_original(&self) -> bool {
            Arc::ptr_eq(&self.sinks.current(), &self.original)
        }
    }

    fn prompt() -> Bytes {
        Bytes::from_static(DEFAULT_PROMPT.as_bytes())
    }

    #[test]
    fn empty_line_is_noop() {
        let mut h = Harness::new();
        assert_eq!(h.session.dispatch(""), Dispatch::Continue);
        assert!(h.recorder.seen.lock().is_empty());
        assert!(h.sent().is_empty());
        assert_eq!(h.session.stats().lines, 1);
    }

    #[test]
    fn commands_go_to_handler_unmodified() {
        let mut h = Harness::new();
        h.session.dispatch("print_mac");
        h.session.dispatch("set wpm  25 ");
        h.session.dispatch("QUIT_TELNET");
        assert_eq!(
            *h.recorder.seen.lock(),
            vec!["print_mac", "set wpm  25 ", "QUIT_TELNET"]
        );
        assert_eq!(h.session.stats().commands, 3);
    }

    #[test]
    fn no_prompt_before_console_starts() {
        let mut h = Harness::new();
        h.session.dispatch("print_mac");
        h.session.dispatch("");
        assert!(h.sent().is_empty());
    }

    #[test]
    fn prompt_after_every_line_in_console_mode() {
        let mut h = Harness::new();
        h.session.dispatch(START_CONSOLE);
        h.sent();

        for line in ["", "print_mac", START_CONSOLE, "x"] {
            h.session.dispatch(line);
            let prompts = h.sent().into_iter().filter(|c| *c == prompt()).count();
            assert_eq!(prompts, 1, "after {line:?}");
        }
    }

    #[test]
    fn start_console_twice_installs_once() {
        let mut h = Harness::new();
        h.session.dispatch(START_CONSOLE);
        let installed = h.sinks.current();
        assert!(h.session.mode().is_active());

        h.session.dispatch(START_CONSOLE);
        assert!(Arc::ptr_eq(&h.sinks.current(), &installed));

        // One quit is enough to get back to the original sink.
        h.session.dispatch(QUIT_CONSOLE);
        assert!(h.sink_is_original());
    }

    #[test]
    fn start_then_quit_restores_prior_sink() {
        let mut h = Harness::new();
        h.session.dispatch(START_CONSOLE);
        assert!(!h.sink_is_original());
        h.session.dispatch(QUIT_CONSOLE);
        assert!(h.sink_is_original());
        assert!(!h.session.mode().is_active());
    }

    #[test]
    fn quit_console_when_inactive_keeps_sink() {
        let mut h = Harness::new();
        h.session.dispatch(QUIT_CONSOLE);
        assert!(h.sink_is_original());
        assert!(h.sent().is_empty());
    }

    #[test]
    fn quit_console_prompt_is_not_sent() {
        let mut h = Harness::new();
        h.session.dispatch(START_CONSOLE);
        h.sent();
        h.session.dispatch(QUIT_CONSOLE);
        assert!(h.sent().is_empty());
    }

    #[test]
    fn quit_telnet_restores_and_sends_no_prompt() {
        let mut h = Harness::new();
        h.session.dispatch(START_CONSOLE);
        h.sent();
        assert_eq!(h.session.dispatch(QUIT_TELNET), Dispatch::Quit);
        assert!(h.sink_is_original());
        assert!(h.sent().is_empty());
    }

    #[test]
    fn finish_without_console_leaves_sink_alone() {
        let mut h = Harness::new();
        let replacement: SharedSink = Arc::new(MemorySink::new());
        h.sinks.install(Arc::clone(&replacement));
        h.session.finish();
        assert!(Arc::ptr_eq(&h.sinks.current(), &replacement));
    }

    #[test]
    fn drop_in_console_mode_restores() {
        let mut h = Harness::new();
        h.session.dispatch(START_CONSOLE);
        let Harness {
            session,
            original,
            sinks,
            ..
        } = h;
        drop(session);
        assert!(Arc::ptr_eq(&sinks.current(), &original));
    }

    #[test]
    fn second_console_on_shared_registry_is_refused() {
        let mut a = Harness::new();
        let mut b = Harness::on(a.sinks.clone(), Arc::clone(&a.original));

        a.session.dispatch(START_CONSOLE);
        a.sent();
        b.session.dispatch(START_CONSOLE);
        assert!(a.session.mode().is_active());
        assert!(!b.session.mode().is_active());
        // A busy notice and no prompt.
        assert_eq!(b.sent(), vec![Bytes::from_static(CONSOLE_BUSY)]);

        a.session.dispatch(QUIT_TELNET);
        b.session.dispatch(QUIT_TELNET);
        assert!(a.sink_is_original());
        a.sinks.emit(b"after both\n").unwrap();
    }

    #[test]
    fn console_free_again_after_owner_quits() {
        let mut a = Harness::new();
        let mut b = Harness::on(a.sinks.clone(), Arc::clone(&a.original));

        a.session.dispatch(START_CONSOLE);
        a.session.dispatch(QUIT_CONSOLE);
        b.session.dispatch(START_CONSOLE);
        assert!(b.session.mode().is_active());

        // Closing A's queue does not affect B's sink.
        drop(a);
        b.sinks.emit(b"to b\n").unwrap();
        assert!(b.sent().contains(&Bytes::from_static(b"to b\n\r")));

        b.session.dispatch(QUIT_TELNET);
        assert!(b.sink_is_original());
    }

    #[test]
    fn sink_replaced_during_console_is_left_alone() {
        let mut h = Harness::new();
        h.session.dispatch(START_CONSOLE);
        let replacement: SharedSink = Arc::new(MemorySink::new());
        h.sinks.install(Arc::clone(&replacement));

        h.session.dispatch(QUIT_CONSOLE);
        assert!(Arc::ptr_eq(&h.sinks.current(), &replacement));
        assert!(!h.sinks.console_claimed());
    }

    #[test]
    fn dropped_chunks_show_in_stats() {
        let original: SharedSink = Arc::new(MemorySink::new());
        let sinks = SinkRegistry::new(original);
        let (tx, _rx) = Outbound::channel(1);
        let mut session = Session::new(
            SessionConfig::default(),
            sinks.clone(),
            Arc::new(|_: &str| {}),
            tx,
        );
        session.dispatch(START_CONSOLE);
        for _ in 0..3 {
            sinks.emit(b"noise\n").unwrap();
        }
        // The prompt took the only slot; nobody is draining the queue.
        assert_eq!(session.stats().dropped, 3);
        assert_eq!(session.finish().dropped, 3);
    }

    #[test]
    fn console_mode_mirrors_records() {
        let mut h = Harness::new();
        h.session.dispatch(START_CONSOLE);
        h.sent();

        h.sinks.emit(b"I app: hello\n").unwrap();
        assert_eq!(h.sent(), vec![Bytes::from_static(b"I app: hello\n\r")]);

        h.session.dispatch(QUIT_CONSOLE);
        h.sinks.emit(b"I app: quiet\n").unwrap();
        assert!(h.sent().is_empty());
    }

    #[test]
    fn overflow_is_counted_without_prompt() {
        let mut h = Harness::new();
        h.session.dispatch(START_CONSOLE);
        h.sent();
        let d = h.session.handle_frame(ConsoleFrame::Overflow { discarded: 129 });
        assert_eq!(d, Dispatch::Continue);
        assert_eq!(h.session.stats().overflows, 1);
        assert!(h.sent().is_empty());
    }

    #[test]
    fn closure_handler() {
        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        let handler: SharedHandler = Arc::new(move |_: &str| *counter.lock() += 1);
        let (tx, _rx) = Outbound::channel(8);
        let mut session = Session::new(
            SessionConfig::default(),
            SinkRegistry::new(Arc::new(MemorySink::new())),
            handler,
            tx,
        );
        session.dispatch("a");
        session.dispatch("b");
        assert_eq!(*hits.lock(), 2);
    }

    #[test]
    fn config_validation() {
        assert!(SessionConfig::default().validate().is_ok());

        let cfg = SessionConfig {
            max_line_len: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = SessionConfig {
            prompt: Bytes::new(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = SessionConfig {
            outbound_queue_len: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
