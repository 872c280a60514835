//! Codec collaborator contracts.
//!
//! The pipeline never looks inside messages. Producers hand each replayed line
//! to a [`MessageGenerator`], consumers hand received bytes to a [`Decoder`],
//! and simulated servers answer through a [`Script`]. Concrete codecs are
//! supplied by the embedding application through a [`CodecRegistry`]; a few
//! line-oriented built-ins live in [`line`].
//!
//! # Framing
//!
//! Generators write into a bounded [`FrameBuffer`]. A message that does not
//! fit is a recoverable [`CodecError::Overflow`]: the producer logs it and
//! skips that line only.

pub mod line;
pub mod pacing;
pub mod registry;

pub use line::{
    EchoScript, EncoderGenerator, LineDecoder, LineEncoder, LineGenerator,
    SequencedLineGenerator, END_OF_STEP_MARKER,
};
pub use pacing::TimestampPacer;
pub use registry::{CodecRegistry, DecoderFactory, GeneratorFactory, ScriptFactory};

pub use crate::error::CodecError;

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Default frame buffer limit, in bytes.
pub const DEFAULT_FRAME_LIMIT: usize = 4048;

/// Reusable byte buffer with a hard size limit.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    bytes: Vec<u8>,
    limit: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_LIMIT)
    }
}

impl FrameBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(limit),
            limit,
        }
    }

    /// Append bytes, failing without modification if they do not fit.
    pub fn put(&mut self, data: &[u8]) -> Result<(), CodecError> {
        if data.len() > self.remaining() {
            return Err(CodecError::Overflow {
                needed: data.len(),
                remaining: self.remaining(),
            });
        }
        self.bytes.extend_from_slice(data);
        Ok(())
    }

    pub fn put_u8(&mut self, byte: u8) -> Result<(), CodecError> {
        self.put(&[byte])
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.bytes.len())
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

/// Frames one message.
pub trait Encoder: Send {
    /// Append the framed bytes for `message` to `out`.
    fn write(&mut self, message: &str, out: &mut FrameBuffer) -> Result<(), CodecError>;
}

/// Turns one replayed line into framed bytes, with per-step sequence state.
#[cfg_attr(test, mockall::automock)]
pub trait MessageGenerator: Send {
    /// Frame `line` into `out`. With `send_at_timestamps` the generator may
    /// block to release the message at its embedded timestamp.
    fn write(
        &mut self,
        line: &str,
        out: &mut FrameBuffer,
        send_at_timestamps: bool,
    ) -> Result<(), CodecError>;

    /// Restart the sequence counter; called after every step.
    fn reset_sequence_number(&mut self);

    /// Give up timestamp pacing once `running` is cleared.
    fn watch_running(&mut self, _running: Arc<AtomicBool>) {}

    /// Frame a codec-level end-of-step marker. Returns `false` when the codec
    /// has none.
    fn write_end_marker(&mut self, _out: &mut FrameBuffer) -> Result<bool, CodecError> {
        Ok(false)
    }
}

/// Decodes received bytes into textual records.
pub trait Decoder: Send {
    /// Consume complete frames from the front of `input`, writing their text
    /// to `output`. Partial frames stay in `input`.
    ///
    /// Returns `false` once an end-of-step marker has been consumed.
    fn read(&mut self, input: &mut Vec<u8>, output: &mut dyn Write) -> Result<bool, CodecError>;

    /// Forget per-step state.
    fn reset(&mut self) {}
}

/// Response generator for simulated servers.
pub trait Script: Send {
    fn respond(&mut self, request: &[u8], response: &mut FrameBuffer) -> Result<(), CodecError>;
}
