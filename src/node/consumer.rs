//! Consumer node - captures a target's responses into per-step files.
//!
//! The consumer connects out to its target once (with bounded backoff) and
//! keeps the connections for the whole run. During each step every connection
//! is read on its own scoped thread and decoded into its output file:
//!
//! - one connection: `directory/<step>`
//! - K connections: `directory/<step>.<i>`
//!
//! A step's read ends on the codec end marker, when the peer closes, or once
//! the layer signalled step end and the socket stayed quiet for one poll
//! interval. Bytes received after an end marker are kept for the next step.

use super::{NodeContext, StepContext};
use crate::codec::Decoder;
use crate::error::{PipelineError, PipelineResult};
use crate::step::Step;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Upper bound for the doubling connect backoff.
pub const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8192;

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// `host:port` of the target
    pub address: String,
    /// Output directory for step files
    pub directory: PathBuf,
    pub connect_attempts: u32,
    /// First retry delay, doubled per attempt up to [`MAX_CONNECT_BACKOFF`]
    pub connect_backoff: Duration,
    /// Socket read timeout; also the quiet period that ends a step
    pub poll_interval: Duration,
}

impl ConsumerConfig {
    pub fn new(address: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
            directory: directory.into(),
            connect_attempts: 10,
            connect_backoff: Duration::from_millis(100),
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_connect(mut self, attempts: u32, backoff: Duration) -> Self {
        self.connect_attempts = attempts;
        self.connect_backoff = backoff;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Connect to `address`, retrying with doubling backoff.
///
/// Gives up early once `running` is cleared.
pub fn connect_with_backoff(
    address: &str,
    attempts: u32,
    backoff: Duration,
    running: &AtomicBool,
) -> PipelineResult<TcpStream> {
    let attempts = attempts.max(1);
    let mut delay = backoff;
    let mut last_error = None;

    for attempt in 1..=attempts {
        match TcpStream::connect(address) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!("Connect to {} failed ({}/{}): {}", address, attempt, attempts, e);
                last_error = Some(e);
            }
        }
        if attempt == attempts || !running.load(Ordering::SeqCst) {
            break;
        }
        thread::sleep(delay);
        delay = (delay * 2).min(MAX_CONNECT_BACKOFF);
    }

    Err(PipelineError::Connect {
        address: address.to_string(),
        attempts,
        source: last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Interrupted, "run stopped")),
    })
}

/// Output file for connection `index` of `connections`.
pub fn output_path(directory: &Path, step: &Step, index: usize, connections: usize) -> PathBuf {
    if connections <= 1 {
        directory.join(step.name())
    } else {
        directory.join(format!("{}.{}", step.name(), index))
    }
}

/// How a step's read ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    Marker,
    PeerClosed,
    Quiet,
    Stopped,
}

struct Connection {
    index: usize,
    stream: Option<TcpStream>,
    decoder: Box<dyn Decoder>,
    pending: Vec<u8>,
}

impl Connection {
    fn new(index: usize, decoder: Box<dyn Decoder>) -> Self {
        Self {
            index,
            stream: None,
            decoder,
            pending: Vec::new(),
        }
    }

    /// Decode one step into `path`. The file is created even when the
    /// connection is already gone.
    fn read_step(
        &mut self,
        path: &Path,
        step_end: &AtomicBool,
        running: &AtomicBool,
    ) -> PipelineResult<ReadEnd> {
        let mut out = BufWriter::new(File::create(path)?);
        self.decoder.reset();
        let end = self.decode_into(&mut out, step_end, running);
        out.flush()?;
        end
    }

    fn decode_into(
        &mut self,
        out: &mut dyn Write,
        step_end: &AtomicBool,
        running: &AtomicBool,
    ) -> PipelineResult<ReadEnd> {
        // Leftover from the previous step, after its end marker
        if !self.pending.is_empty() && !self.decoder.read(&mut self.pending, out)? {
            return Ok(ReadEnd::Marker);
        }

        let Some(stream) = self.stream.as_mut() else {
            return Ok(ReadEnd::PeerClosed);
        };

        let mut chunk = [0u8; READ_CHUNK];
        let mut end_seen = false;

        loop {
            if !running.load(Ordering::SeqCst) {
                return Ok(ReadEnd::Stopped);
            }
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    if !self.decoder.read(&mut self.pending, out)? {
                        return Ok(ReadEnd::Marker);
                    }
                }
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    if end_seen {
                        return Ok(ReadEnd::Quiet);
                    }
                    end_seen = step_end.load(Ordering::SeqCst);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!("Connection {} lost: {}", self.index, e);
                    break;
                }
            }
        }

        self.stream = None;
        Ok(ReadEnd::PeerClosed)
    }
}

/// Network sink node.
pub struct ConsumerNode {
    name: String,
    config: ConsumerConfig,
    connections: Vec<Connection>,
}

impl ConsumerNode {
    /// One connection is opened per decoder; at least one is required.
    pub fn new(
        name: impl Into<String>,
        config: ConsumerConfig,
        decoders: Vec<Box<dyn Decoder>>,
    ) -> PipelineResult<Self> {
        let name = name.into();
        if decoders.is_empty() {
            return Err(PipelineError::Config(format!(
                "Consumer '{}' needs at least one decoder",
                name
            )));
        }
        Ok(Self {
            name,
            config,
            connections: decoders
                .into_iter()
                .enumerate()
                .map(|(index, decoder)| Connection::new(index, decoder))
                .collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connections(&self) -> usize {
        self.connections.len()
    }

    pub fn on_start(&mut self, ctx: &NodeContext) -> PipelineResult<()> {
        for conn in &mut self.connections {
            let stream = connect_with_backoff(
                &self.config.address,
                self.config.connect_attempts,
                self.config.connect_backoff,
                ctx.running,
            )?;
            stream.set_read_timeout(Some(self.config.poll_interval))?;
            tracing::info!("Connection {} established to {}", conn.index, self.config.address);
            conn.stream = Some(stream);
        }
        Ok(())
    }

    pub fn on_step(&mut self, ctx: &StepContext) -> PipelineResult<()> {
        let directory = &self.config.directory;
        let total = self.connections.len();
        let step_end = ctx.step_end;
        let running: &AtomicBool = ctx.running;

        let results: Vec<PipelineResult<ReadEnd>> = thread::scope(|s| {
            let handles: Vec<_> = self
                .connections
                .iter_mut()
                .map(|conn| {
                    let path = output_path(directory, ctx.step, conn.index, total);
                    s.spawn(move || conn.read_step(&path, step_end, running))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(PipelineError::NodePanicked(format!("{} reader", ctx.node)))
                    })
                })
                .collect()
        });

        let mut first_error = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(end) => tracing::debug!("Connection {} read ended: {:?}", index, end),
                Err(e) => {
                    tracing::error!("Connection {} failed: {}", index, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn on_finish(&mut self, _ctx: &NodeContext) -> PipelineResult<()> {
        for conn in &mut self.connections {
            if let Some(stream) = conn.stream.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        Ok(())
    }
}
