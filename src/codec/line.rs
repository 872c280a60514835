//! Built-in line-oriented codecs.
//!
//! All of them frame one message per `\n`-terminated line:
//!
//! - [`LineGenerator`] / [`LineDecoder`] - text as-is, optionally followed by an
//!   end-of-step marker line after each replayed file
//! - [`SequencedLineGenerator`] - `"<seq>|<line>"`, sequence restarting at 1
//!   every step
//! - [`EncoderGenerator`] - adapts any [`Encoder`] into a generator
//! - [`EchoScript`] - answers every request with the request itself

use super::pacing::TimestampPacer;
use super::{CodecError, Decoder, Encoder, FrameBuffer, MessageGenerator, Script};
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// End-of-step marker line (EOT).
pub const END_OF_STEP_MARKER: &[u8] = b"\x04";

/// Frames a message as its UTF-8 bytes plus `\n`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineEncoder;

impl Encoder for LineEncoder {
    fn write(&mut self, message: &str, out: &mut FrameBuffer) -> Result<(), CodecError> {
        let needed = message.len() + 1;
        if needed > out.remaining() {
            return Err(CodecError::Overflow {
                needed,
                remaining: out.remaining(),
            });
        }
        out.put(message.as_bytes())?;
        out.put_u8(b'\n')
    }
}

/// Adapts a stateless [`Encoder`] into a [`MessageGenerator`].
#[derive(Debug, Default)]
pub struct EncoderGenerator<E> {
    encoder: E,
    pacer: TimestampPacer,
}

impl<E: Encoder> EncoderGenerator<E> {
    pub fn new(encoder: E) -> Self {
        Self {
            encoder,
            pacer: TimestampPacer::new(),
        }
    }
}

impl<E: Encoder> MessageGenerator for EncoderGenerator<E> {
    fn write(
        &mut self,
        line: &str,
        out: &mut FrameBuffer,
        send_at_timestamps: bool,
    ) -> Result<(), CodecError> {
        if send_at_timestamps {
            self.pacer.pace(line);
        }
        self.encoder.write(line, out)
    }

    fn reset_sequence_number(&mut self) {
        self.pacer.reset();
    }

    fn watch_running(&mut self, running: Arc<AtomicBool>) {
        self.pacer.watch(running);
    }
}

/// Plain line generator with an optional end-of-step marker.
#[derive(Debug, Default)]
pub struct LineGenerator {
    inner: EncoderGenerator<LineEncoder>,
    end_marker: Option<Vec<u8>>,
}

impl LineGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `marker` as its own line after every replayed file.
    pub fn with_end_marker(mut self, marker: impl Into<Vec<u8>>) -> Self {
        self.end_marker = Some(marker.into());
        self
    }
}

impl MessageGenerator for LineGenerator {
    fn write(
        &mut self,
        line: &str,
        out: &mut FrameBuffer,
        send_at_timestamps: bool,
    ) -> Result<(), CodecError> {
        self.inner.write(line, out, send_at_timestamps)
    }

    fn reset_sequence_number(&mut self) {
        self.inner.reset_sequence_number();
    }

    fn watch_running(&mut self, running: Arc<AtomicBool>) {
        self.inner.watch_running(running);
    }

    fn write_end_marker(&mut self, out: &mut FrameBuffer) -> Result<bool, CodecError> {
        let Some(marker) = &self.end_marker else {
            return Ok(false);
        };
        out.put(marker)?;
        out.put_u8(b'\n')?;
        Ok(true)
    }
}

/// Prefixes every line with a per-step sequence number.
#[derive(Debug)]
pub struct SequencedLineGenerator {
    next: u64,
    pacer: TimestampPacer,
}

impl Default for SequencedLineGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SequencedLineGenerator {
    pub const INITIAL_SEQUENCE: u64 = 1;

    pub fn new() -> Self {
        Self {
            next: Self::INITIAL_SEQUENCE,
            pacer: TimestampPacer::new(),
        }
    }

    /// Sequence number the next message will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next
    }
}

impl MessageGenerator for SequencedLineGenerator {
    fn write(
        &mut self,
        line: &str,
        out: &mut FrameBuffer,
        send_at_timestamps: bool,
    ) -> Result<(), CodecError> {
        if send_at_timestamps {
            self.pacer.pace(line);
        }
        let framed = format!("{}|{}\n", self.next, line);
        out.put(framed.as_bytes())?;
        self.next += 1;
        Ok(())
    }

    fn reset_sequence_number(&mut self) {
        self.next = Self::INITIAL_SEQUENCE;
        self.pacer.reset();
    }

    fn watch_running(&mut self, running: Arc<AtomicBool>) {
        self.pacer.watch(running);
    }
}

/// Splits received bytes on `\n` and writes each line to the output.
#[derive(Debug, Default)]
pub struct LineDecoder {
    end_marker: Option<Vec<u8>>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop reading the step when a line equal to `marker` arrives.
    pub fn with_end_marker(mut self, marker: impl Into<Vec<u8>>) -> Self {
        self.end_marker = Some(marker.into());
        self
    }
}

impl Decoder for LineDecoder {
    fn read(&mut self, input: &mut Vec<u8>, output: &mut dyn Write) -> Result<bool, CodecError> {
        let mut consumed = 0;
        let mut more = true;

        while let Some(pos) = input[consumed..].iter().position(|&b| b == b'\n') {
            let mut line = &input[consumed..consumed + pos];
            consumed += pos + 1;
            if let [head @ .., b'\r'] = line {
                line = head;
            }

            if self.end_marker.as_deref() == Some(line) {
                more = false;
                break;
            }
            output.write_all(line)?;
            output.write_all(b"\n")?;
        }

        input.drain(..consumed);
        Ok(more)
    }
}

/// Responds with the request bytes unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoScript;

impl Script for EchoScript {
    fn respond(&mut self, request: &[u8], response: &mut FrameBuffer) -> Result<(), CodecError> {
        response.put(request)
    }
}
