//! Producer node - replays step files into accepted TCP peers.
//!
//! The producer binds once, accepts exactly one peer per configured generator
//! (peers get generators in accept order), and keeps those connections for
//! the whole run. Each step replays `directory/<step>` to every peer in
//! parallel, one non-empty line per framed message.
//!
//! # Threads
//!
//! ```text
//! node thread (supervisor) ── batchStart ─ internalStart ─ internalEnd ─ batchEnd
//! peer thread 0 (SubProducer)            └ replay file ┘
//! peer thread 1 (SubProducer)            └ replay file ┘
//! ```
//!
//! The internal barriers have one party per peer plus the supervisor.

use super::{NodeContext, StepContext};
use crate::codec::{FrameBuffer, MessageGenerator, DEFAULT_FRAME_LIMIT};
use crate::error::{CodecError, PipelineError, PipelineResult};
use crate::sync::{BreakOnPanic, LayerBarriers};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Producer settings.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// `host:port` to listen on
    pub address: String,
    /// Directory holding the step files
    pub directory: PathBuf,
    /// Let generators pace messages at their embedded timestamps
    pub send_at_timestamps: bool,
    /// Delay before and after each peer's replay
    pub settle: Duration,
    /// Sleep between accept attempts while waiting for peers
    pub accept_poll: Duration,
    /// Socket write timeout; a stalled peer fails instead of hanging the step
    pub write_timeout: Duration,
    pub frame_limit: usize,
}

impl ProducerConfig {
    pub fn new(address: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
            directory: directory.into(),
            send_at_timestamps: false,
            settle: Duration::ZERO,
            accept_poll: Duration::from_millis(20),
            write_timeout: Duration::from_secs(30),
            frame_limit: DEFAULT_FRAME_LIMIT,
        }
    }

    pub fn with_send_at_timestamps(mut self, enabled: bool) -> Self {
        self.send_at_timestamps = enabled;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

/// Counters for one replayed file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub sent: usize,
    pub skipped: usize,
    pub bytes: usize,
}

/// Replay `reader` line by line through `generator` into `sink`.
///
/// Blank lines are skipped. A line that overflows the frame buffer is logged
/// and skipped; read and write errors abort the replay.
pub fn replay_lines<R, W>(
    reader: R,
    generator: &mut dyn MessageGenerator,
    sink: &mut W,
    buffer: &mut FrameBuffer,
    send_at_timestamps: bool,
    running: &AtomicBool,
) -> PipelineResult<ReplayStats>
where
    R: BufRead,
    W: Write + ?Sized,
{
    let mut stats = ReplayStats::default();

    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        if !running.load(Ordering::SeqCst) {
            tracing::debug!("Replay interrupted after {} messages", stats.sent);
            break;
        }

        buffer.clear();
        match generator.write(&line, buffer, send_at_timestamps) {
            Ok(()) => {
                sink.write_all(buffer.as_slice())?;
                stats.sent += 1;
                stats.bytes += buffer.len();
            }
            Err(e @ CodecError::Overflow { .. }) | Err(e @ CodecError::Malformed(_)) => {
                tracing::warn!("Skipping line: {}", e);
                stats.skipped += 1;
            }
            Err(CodecError::Io(e)) => return Err(e.into()),
        }
    }

    buffer.clear();
    if generator.write_end_marker(buffer)? {
        sink.write_all(buffer.as_slice())?;
        stats.bytes += buffer.len();
    }
    buffer.clear();
    sink.flush()?;

    Ok(stats)
}

/// Poll `accept` until `count` peers are in, sleeping `poll` after every
/// attempt that yields none. Fails once `running` is cleared.
fn accept_until<T, A>(
    count: usize,
    running: &AtomicBool,
    poll: Duration,
    mut accept: A,
) -> PipelineResult<Vec<(T, SocketAddr)>>
where
    A: FnMut() -> io::Result<(T, SocketAddr)>,
{
    let mut accepted = Vec::with_capacity(count);
    while accepted.len() < count {
        if !running.load(Ordering::SeqCst) {
            return Err(PipelineError::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                "run stopped while accepting peers",
            )));
        }
        match accept() {
            Ok(peer) => accepted.push(peer),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(poll),
            Err(e) => {
                tracing::error!("Accept failed: {}", e);
                thread::sleep(poll);
            }
        }
    }
    Ok(accepted)
}

enum PeerSignal {
    Replay(PathBuf),
    Close,
}

struct PeerOutcome {
    peer: usize,
    result: PipelineResult<ReplayStats>,
}

/// Per-peer worker: one connection, one generator.
struct SubProducer {
    index: usize,
    stream: TcpStream,
    generator: Box<dyn MessageGenerator>,
    buffer: FrameBuffer,
    send_at_timestamps: bool,
}

impl SubProducer {
    fn replay(&mut self, path: &Path, running: &AtomicBool) -> PipelineResult<ReplayStats> {
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => PipelineError::MissingInput {
                path: path.to_path_buf(),
            },
            _ => PipelineError::Io(e),
        })?;
        tracing::trace!("Peer {} replaying {:?}", self.index, path);
        replay_lines(
            BufReader::new(file),
            self.generator.as_mut(),
            &mut self.stream,
            &mut self.buffer,
            self.send_at_timestamps,
            running,
        )
    }

    fn run(
        mut self,
        signals: Receiver<PeerSignal>,
        internal: LayerBarriers,
        outcomes: Sender<PeerOutcome>,
        settle: Duration,
        running: Arc<AtomicBool>,
    ) {
        let _guard = BreakOnPanic::new(internal.clone());
        self.generator.watch_running(running.clone());

        for signal in signals.iter() {
            let path = match signal {
                PeerSignal::Replay(path) => path,
                PeerSignal::Close => break,
            };

            if !settle.is_zero() {
                thread::sleep(settle);
            }
            if internal.start.wait().is_err() {
                break;
            }

            let result = self.replay(&path, &running);
            if !settle.is_zero() {
                thread::sleep(settle);
            }
            // Sent before internalEnd so the supervisor sees it after the barrier
            let _ = outcomes.send(PeerOutcome {
                peer: self.index,
                result,
            });

            if internal.end.wait().is_err() {
                break;
            }
            self.generator.reset_sequence_number();
        }

        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            tracing::trace!("Peer {} close: {}", self.index, e);
        }
        tracing::debug!("Peer {} closed", self.index);
    }
}

struct PeerHandle {
    signals: Sender<PeerSignal>,
    thread: JoinHandle<()>,
}

/// Network source node.
pub struct ProducerNode {
    name: String,
    config: ProducerConfig,
    generators: Vec<Box<dyn MessageGenerator>>,
    clients: usize,
    listener: Option<TcpListener>,
    peers: Vec<PeerHandle>,
    internal: LayerBarriers,
    outcomes_tx: Sender<PeerOutcome>,
    outcomes_rx: Receiver<PeerOutcome>,
}

impl ProducerNode {
    /// One peer is accepted per generator; at least one generator is required.
    pub fn new(
        name: impl Into<String>,
        config: ProducerConfig,
        generators: Vec<Box<dyn MessageGenerator>>,
    ) -> PipelineResult<Self> {
        let name = name.into();
        if generators.is_empty() {
            return Err(PipelineError::Config(format!(
                "Producer '{}' needs at least one generator",
                name
            )));
        }
        let clients = generators.len();
        let (outcomes_tx, outcomes_rx) = unbounded();
        Ok(Self {
            internal: LayerBarriers::for_layer(&format!("{name}.internal"), clients),
            name,
            config,
            generators,
            clients,
            listener: None,
            peers: Vec::new(),
            outcomes_tx,
            outcomes_rx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clients(&self) -> usize {
        self.clients
    }

    /// Bind the listening socket now instead of on the node thread.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// binding port 0.
    pub fn bind_now(&mut self) -> PipelineResult<SocketAddr> {
        if self.listener.is_none() {
            let listener =
                TcpListener::bind(&self.config.address).map_err(|source| PipelineError::Bind {
                    address: self.config.address.clone(),
                    source,
                })?;
            self.listener = Some(listener);
        }
        self.local_addr()
    }

    pub fn local_addr(&self) -> PipelineResult<SocketAddr> {
        match &self.listener {
            Some(listener) => Ok(listener.local_addr()?),
            None => Err(PipelineError::Config(format!(
                "Producer '{}' is not bound",
                self.name
            ))),
        }
    }

    pub fn on_start(&mut self, ctx: &NodeContext) -> PipelineResult<()> {
        let addr = self.bind_now()?;
        tracing::info!("{} connections available on {}", self.clients, addr);

        let streams = self.accept_peers(ctx)?;
        let generators = std::mem::take(&mut self.generators);

        for (index, (stream, generator)) in streams.into_iter().zip(generators).enumerate() {
            let (signals, signals_rx) = unbounded();
            let peer = SubProducer {
                index,
                stream,
                generator,
                buffer: FrameBuffer::new(self.config.frame_limit),
                send_at_timestamps: self.config.send_at_timestamps,
            };
            let internal = self.internal.clone();
            let outcomes = self.outcomes_tx.clone();
            let settle = self.config.settle;
            let running = ctx.running.clone();

            let thread = thread::Builder::new()
                .name(format!("{}_{}", self.name, index))
                .spawn(move || peer.run(signals_rx, internal, outcomes, settle, running))?;
            self.peers.push(PeerHandle { signals, thread });
        }

        // Listener is no longer needed once all peers are in
        self.listener = None;
        Ok(())
    }

    fn accept_peers(&self, ctx: &NodeContext) -> PipelineResult<Vec<TcpStream>> {
        let listener = self.listener.as_ref().ok_or_else(|| {
            PipelineError::Config(format!("Producer '{}' is not bound", self.name))
        })?;
        listener.set_nonblocking(true)?;

        let accepted = accept_until(self.clients, ctx.running, self.config.accept_poll, || {
            listener.accept()
        })?;

        let mut streams = Vec::with_capacity(accepted.len());
        for (index, (stream, remote)) in accepted.into_iter().enumerate() {
            stream.set_nonblocking(false)?;
            stream.set_nodelay(true)?;
            stream.set_write_timeout(Some(self.config.write_timeout))?;
            tracing::info!("Peer {} connected from {}", index, remote);
            streams.push(stream);
        }
        Ok(streams)
    }

    pub fn on_step(&mut self, ctx: &StepContext) -> PipelineResult<()> {
        let path = self.config.directory.join(ctx.step.name());
        tracing::debug!("Replaying {:?} to {} peers", path, self.peers.len());

        for peer in &self.peers {
            peer.signals
                .send(PeerSignal::Replay(path.clone()))
                .map_err(|_| PipelineError::NodeGone(format!("{} peer", self.name)))?;
        }
        self.internal.start.wait()?;
        self.internal.end.wait()?;

        let mut missing = None;
        for outcome in self.outcomes_rx.try_iter() {
            match outcome.result {
                Ok(stats) => tracing::debug!(
                    "Peer {} sent {} messages ({} skipped, {} bytes)",
                    outcome.peer,
                    stats.sent,
                    stats.skipped,
                    stats.bytes
                ),
                Err(e @ PipelineError::MissingInput { .. }) => missing = Some(e),
                Err(e) => tracing::error!("Peer {} aborted step: {}", outcome.peer, e),
            }
        }
        match missing {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn after_step(&mut self, _ctx: &StepContext) {}

    pub fn on_finish(&mut self, _ctx: &NodeContext) -> PipelineResult<()> {
        // Releases peers stuck at an internal barrier after an abort
        self.internal.break_all();
        for peer in &self.peers {
            let _ = peer.signals.send(PeerSignal::Close);
        }
        for peer in self.peers.drain(..) {
            if peer.thread.join().is_err() {
                tracing::error!("Peer thread of '{}' panicked", self.name);
            }
        }
        Ok(())
    }
}
