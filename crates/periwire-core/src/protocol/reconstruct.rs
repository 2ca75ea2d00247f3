//! Inbound frame reconstruction
//!
//! Bytes are pulled from a [`Transport`] one template element at a time. An
//! element is only consumed once all of its bytes are waiting, so a frame
//! delivered in arbitrary chunks is parsed exactly as if it arrived whole,
//! and nothing already consumed is ever re-read.
//!
//! State flow:
//!
//! ```text
//! Idle -> Assembling(element 0..n) -> Complete  -> Idle
//!                                  \-> Resyncing -> Idle (transport flushed)
//! ```
//!
//! Each message in flight is an owned [`ReconstructionState`]; the pure
//! [`advance`] step consumes it and returns the next [`Phase`].

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::checksum::ChecksumEngine;
use super::stream::Transport;
use super::template::{width_mask, Element, ElementKind, MessageTemplate};
use super::{FrameError, DEFAULT_TIMEOUT_MS};

/// One message in flight
#[derive(Debug)]
pub struct ReconstructionState {
    /// Payload bytes (fixed + variable data); resized when a length is decoded
    buffer: Vec<u8>,
    filled: usize,
    element: usize,
    checksum: Box<dyn ChecksumEngine>,
    /// Computed and received checksum, captured when the CRC element is read
    crc: Option<(u64, u64)>,
    last_progress: Instant,
}

impl ReconstructionState {
    pub fn new(template: &MessageTemplate, now: Instant) -> Self {
        Self {
            buffer: vec![0u8; template.initial_data_length()],
            filled: 0,
            element: 0,
            checksum: template.inbound_checksum(),
            crc: None,
            last_progress: now,
        }
    }

    /// Index of the next element to parse
    pub fn element_index(&self) -> usize {
        self.element
    }

    /// Payload bytes filled so far
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Current payload allocation
    pub fn data_length(&self) -> usize {
        self.buffer.len()
    }

    fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_progress) > timeout
    }

    fn resize(&mut self, length: usize, max: usize) -> Result<(), FrameError> {
        if length > max {
            return Err(FrameError::LengthOverflow { length, max });
        }
        if length < self.filled {
            return Err(FrameError::InvalidLength {
                decoded: length as u64,
            });
        }
        // Vec::resize keeps the bytes already filled
        self.buffer.resize(length, 0);
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        let end = self.filled + bytes.len();
        let max = self.buffer.len();
        let slot = self
            .buffer
            .get_mut(self.filled..end)
            .ok_or(FrameError::LengthOverflow { length: end, max })?;
        slot.copy_from_slice(bytes);
        self.filled = end;
        Ok(())
    }
}

/// Result of one transition of the reconstruction state machine
#[derive(Debug)]
pub enum Phase {
    Assembling(ReconstructionState),
    /// Checksum verified; carries the payload
    Complete(Vec<u8>),
    /// Frame discarded
    Resyncing(FrameError),
}

fn io_error(e: std::io::Error) -> FrameError {
    FrameError::Io(e.to_string())
}

/// Width of `element` on the wire given the message allocation so far
fn element_length(element: &Element, state: &ReconstructionState) -> usize {
    match element.kind {
        ElementKind::VariableData => state.buffer.len().saturating_sub(state.filled),
        _ => element.length,
    }
}

/// Consume as many whole elements as `source` has bytes for
pub fn advance(
    template: &MessageTemplate,
    mut state: ReconstructionState,
    source: &mut dyn Transport,
    now: Instant,
) -> Phase {
    match consume_elements(template, &mut state, source, now) {
        Ok(true) => finish(state),
        Ok(false) => Phase::Assembling(state),
        Err(e) => Phase::Resyncing(e),
    }
}

/// Returns `Ok(true)` once every element has been consumed
fn consume_elements(
    template: &MessageTemplate,
    state: &mut ReconstructionState,
    source: &mut dyn Transport,
    now: Instant,
) -> Result<bool, FrameError> {
    while let Some(element) = template.elements().get(state.element) {
        let len = element_length(element, state);
        let mut bytes = vec![0u8; len];

        if len > 0 {
            let available = source.bytes_to_read().map_err(io_error)?;
            if available < len {
                trace!(element = state.element, available, needed = len, "waiting for bytes");
                return Ok(false);
            }
            let read = source.read_bytes(&mut bytes).map_err(io_error)?;
            if read < len {
                return Err(FrameError::ShortRead { read, wanted: len });
            }
            state.last_progress = now;
        }

        // Elements after the CRC field are not covered by it
        if element.include_in_crc && element.kind != ElementKind::Crc && state.crc.is_none() {
            state
                .checksum
                .hash(&bytes, 0, len)
                .map_err(|e| FrameError::Io(e.to_string()))?;
        }

        match &element.kind {
            ElementKind::Constant { .. } | ElementKind::ConstantMask { .. } => {}
            ElementKind::FixedData | ElementKind::VariableData => state.append(&bytes)?,
            ElementKind::DataLength => {
                let decoded = element.decode_uint(&bytes);
                state.resize(to_len(decoded)?, template.max_data_length())?;
            }
            ElementKind::ConstantDataLengthMask { mask } => {
                let decoded = mask.remove(element.decode_uint(&bytes));
                state.resize(to_len(decoded)?, template.max_data_length())?;
            }
            ElementKind::FullLength => {
                let decoded = element.decode_uint(&bytes);
                let data = to_len(decoded)?
                    .checked_sub(template.non_data_length())
                    .ok_or(FrameError::InvalidLength { decoded })?;
                state.resize(data, template.max_data_length())?;
            }
            ElementKind::LengthPlusDataLength => {
                let decoded = element.decode_uint(&bytes);
                let data = plus_length_data(template, element, decoded)?;
                state.resize(data, template.max_data_length())?;
            }
            ElementKind::Crc => {
                let computed = u64::from(state.checksum.value()) & width_mask(element.length);
                state.crc = Some((computed, element.decode_uint(&bytes)));
            }
        }

        trace!(element = state.element, len, filled = state.filled, "element consumed");
        state.element += 1;
    }
    Ok(true)
}

fn to_len(decoded: u64) -> Result<usize, FrameError> {
    usize::try_from(decoded).map_err(|_| FrameError::InvalidLength { decoded })
}

/// Data length from a `LengthPlusDataLength` value. A template's expected
/// length wins when the wire value lands within its tolerance.
fn plus_length_data(
    template: &MessageTemplate,
    element: &Element,
    decoded: u64,
) -> Result<usize, FrameError> {
    let data = to_len(decoded)?
        .checked_sub(element.length)
        .ok_or(FrameError::InvalidLength { decoded })?;
    match template.expected_data_length() {
        Some(expected) if expected.abs_diff(data) <= template.length_tolerance() => {
            if expected != data {
                debug!(expected, decoded = data, "using expected data length");
            }
            Ok(expected)
        }
        _ => Ok(data),
    }
}

fn finish(state: ReconstructionState) -> Phase {
    if state.filled != state.buffer.len() {
        return Phase::Resyncing(FrameError::Incomplete {
            filled: state.filled,
            expected: state.buffer.len(),
        });
    }
    if let Some((computed, received)) = state.crc {
        if computed != received {
            return Phase::Resyncing(FrameError::ChecksumMismatch { computed, received });
        }
    }
    Phase::Complete(state.buffer)
}

/// What one reconstruction pass produced
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing in flight and nothing to read
    Idle,
    /// A frame is partially assembled
    Pending,
    /// A verified payload
    Complete(Vec<u8>),
    /// The in-progress frame was discarded and the transport flushed
    Resynced(FrameError),
}

/// Drives reconstruction of one template's frames from a transport
#[derive(Debug)]
pub struct Reconstructor {
    template: Arc<MessageTemplate>,
    in_flight: Option<ReconstructionState>,
    frame_timeout: Duration,
    flush_after_frame: bool,
    completed: u64,
    resyncs: u64,
}

impl Reconstructor {
    pub fn new(template: Arc<MessageTemplate>) -> Self {
        Self {
            template,
            in_flight: None,
            frame_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            flush_after_frame: false,
            completed: 0,
            resyncs: 0,
        }
    }

    /// Abandon a partial frame that makes no progress for `timeout`
    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    /// Flush the transport after every good frame
    pub fn with_flush_after_frame(mut self, flush: bool) -> Self {
        self.flush_after_frame = flush;
        self
    }

    pub fn template(&self) -> &Arc<MessageTemplate> {
        &self.template
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    pub fn in_flight(&self) -> Option<&ReconstructionState> {
        self.in_flight.as_ref()
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Drop any partial frame without touching the transport
    pub fn reset(&mut self) {
        self.in_flight = None;
    }

    /// Run one pass against whatever the transport has buffered
    pub fn poll(&mut self, source: &mut dyn Transport) -> Outcome {
        self.poll_at(source, Instant::now())
    }

    pub fn poll_at(&mut self, source: &mut dyn Transport, now: Instant) -> Outcome {
        if let Some(error) = self.expire(source, now) {
            return Outcome::Resynced(error);
        }

        let state = match self.in_flight.take() {
            Some(state) => state,
            None => match source.bytes_to_read() {
                Ok(0) => return Outcome::Idle,
                Ok(_) => ReconstructionState::new(&self.template, now),
                // Nothing to discard; a closed or failing transport is just quiet
                Err(e) => {
                    trace!("transport unavailable: {e}");
                    return Outcome::Idle;
                }
            },
        };

        match advance(&self.template, state, source, now) {
            Phase::Assembling(state) => {
                self.in_flight = Some(state);
                Outcome::Pending
            }
            Phase::Complete(payload) => {
                self.completed += 1;
                debug!(len = payload.len(), "frame reconstructed");
                if self.flush_after_frame {
                    flush(source);
                }
                Outcome::Complete(payload)
            }
            Phase::Resyncing(error) => self.resync(source, error),
        }
    }

    /// Abandon a stalled partial frame. Returns the timeout it was discarded for.
    pub fn expire(&mut self, source: &mut dyn Transport, now: Instant) -> Option<FrameError> {
        let state = self.in_flight.as_ref()?;
        if !state.is_stale(now, self.frame_timeout) {
            return None;
        }
        let elapsed_ms = now.saturating_duration_since(state.last_progress).as_millis() as u64;
        match self.resync(source, FrameError::Timeout { elapsed_ms }) {
            Outcome::Resynced(error) => Some(error),
            _ => None,
        }
    }

    /// Wait for one complete frame, polling the transport until `deadline`
    /// elapses. On timeout the partial frame is discarded.
    pub fn receive(
        &mut self,
        source: &mut dyn Transport,
        deadline: Duration,
        poll_interval: Duration,
    ) -> Result<Vec<u8>, FrameError> {
        let start = Instant::now();
        loop {
            match self.poll(source) {
                Outcome::Complete(payload) => return Ok(payload),
                Outcome::Resynced(error) => return Err(error),
                Outcome::Idle | Outcome::Pending => {}
            }
            if start.elapsed() >= deadline {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                return match self.resync(source, FrameError::Timeout { elapsed_ms }) {
                    Outcome::Resynced(error) => Err(error),
                    _ => Err(FrameError::Timeout { elapsed_ms }),
                };
            }
            thread::sleep(poll_interval);
        }
    }

    fn resync(&mut self, source: &mut dyn Transport, error: FrameError) -> Outcome {
        let element = self.in_flight.take().map(|s| s.element);
        self.resyncs += 1;
        warn!(?element, "discarding frame: {error}");
        flush(source);
        Outcome::Resynced(error)
    }
}

fn flush(source: &mut dyn Transport) {
    if let Err(e) = source.flush_input() {
        warn!("input flush failed: {e}");
    }
    if let Err(e) = source.flush_output() {
        warn!("output flush failed: {e}");
    }
}
