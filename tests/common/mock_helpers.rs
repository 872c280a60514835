//! Test doubles: plugin nodes, an observable generator and an echo relay

use msgpipe_rs::codec::{
    CodecError, EchoScript, FrameBuffer, MessageGenerator, Script, SequencedLineGenerator,
};
use msgpipe_rs::node::{AnyNode, NodeContext, NodePlugin, StepContext};
use msgpipe_rs::{FinishHandle, PipelineResult};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub type EventLog = Arc<Mutex<Vec<String>>>;

/// Records every lifecycle hook as a string event
pub struct RecordingNode {
    name: String,
    events: EventLog,
    finish_during: Option<(String, FinishHandle)>,
}

impl RecordingNode {
    pub fn new(name: &str) -> (Self, EventLog) {
        let events = EventLog::default();
        let node = Self {
            name: name.to_string(),
            events: events.clone(),
            finish_during: None,
        };
        (node, events)
    }

    /// Request an early finish while executing `step`
    pub fn finish_during(mut self, step: &str, handle: FinishHandle) -> Self {
        self.finish_during = Some((step.to_string(), handle));
        self
    }

    pub fn boxed(self) -> AnyNode {
        let node: Box<dyn NodePlugin> = Box::new(self);
        node.into()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl NodePlugin for RecordingNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_start(&mut self, _ctx: &NodeContext) -> PipelineResult<()> {
        self.push("start".to_string());
        Ok(())
    }

    fn on_step(&mut self, ctx: &StepContext) -> PipelineResult<()> {
        self.push(format!("step:{}", ctx.step));
        if let Some((step, handle)) = &self.finish_during {
            if step == ctx.step.name() {
                handle.request();
            }
        }
        Ok(())
    }

    fn after_step(&mut self, ctx: &StepContext) {
        self.push(format!("after:{}", ctx.step));
    }

    fn on_finish(&mut self, _ctx: &NodeContext) -> PipelineResult<()> {
        self.push("finish".to_string());
        Ok(())
    }
}

/// Panics inside the given step
pub struct PanicOnStep {
    name: String,
    step: String,
}

impl PanicOnStep {
    pub fn new(name: &str, step: &str) -> AnyNode {
        let node: Box<dyn NodePlugin> = Box::new(Self {
            name: name.to_string(),
            step: step.to_string(),
        });
        node.into()
    }
}

impl NodePlugin for PanicOnStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_step(&mut self, ctx: &StepContext) -> PipelineResult<()> {
        if ctx.step.name() == self.step {
            panic!("node '{}' killed in step {}", self.name, ctx.step);
        }
        Ok(())
    }
}

/// Sequenced line generator that publishes its next sequence number
pub struct ProbeGenerator {
    inner: SequencedLineGenerator,
    next: Arc<AtomicU64>,
}

impl ProbeGenerator {
    pub fn new() -> (Self, Arc<AtomicU64>) {
        let inner = SequencedLineGenerator::new();
        let next = Arc::new(AtomicU64::new(inner.next_sequence()));
        (
            Self {
                inner,
                next: next.clone(),
            },
            next,
        )
    }
}

impl MessageGenerator for ProbeGenerator {
    fn write(
        &mut self,
        line: &str,
        out: &mut FrameBuffer,
        send_at_timestamps: bool,
    ) -> Result<(), CodecError> {
        self.inner.write(line, out, send_at_timestamps)?;
        self.next.store(self.inner.next_sequence(), Ordering::SeqCst);
        Ok(())
    }

    fn reset_sequence_number(&mut self) {
        self.inner.reset_sequence_number();
        self.next.store(self.inner.next_sequence(), Ordering::SeqCst);
    }
}

/// In-process stand-in for a service under test: reads everything a producer
/// sends and answers each chunk through [`EchoScript`] to one downstream
/// client.
pub struct EchoRelay {
    pub address: SocketAddr,
    handle: JoinHandle<usize>,
}

impl EchoRelay {
    pub fn spawn(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind relay");
        let address = listener.local_addr().expect("relay address");

        let handle = thread::spawn(move || {
            let mut source = connect_retry(upstream);
            let (mut sink, _) = listener.accept().expect("accept downstream");
            let mut script = EchoScript;
            let mut chunk = [0u8; 4096];
            let mut response = FrameBuffer::new(chunk.len());
            let mut relayed = 0;

            loop {
                let n = match source.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                response.clear();
                script
                    .respond(&chunk[..n], &mut response)
                    .expect("echo fits");
                if sink.write_all(response.as_slice()).is_err() {
                    break;
                }
                relayed += n;
            }
            relayed
        });

        Self { address, handle }
    }

    /// Bytes relayed once the upstream closed
    pub fn join(self) -> usize {
        self.handle.join().expect("relay thread")
    }
}

fn connect_retry(address: SocketAddr) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(address) {
            return stream;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("relay could not reach {}", address);
}
