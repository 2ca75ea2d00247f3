//! Transport boundary
//!
//! The engine never performs I/O directly; it drives a [`Transport`], which
//! only has to move raw byte ranges and report how many bytes are waiting.

use serialport::SerialPort;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use super::config::SerialSettings;
use super::serial::{clear_buffers, configure_port, open_port};
use super::ProtocolError;

/// Raised by a transport whenever bytes arrive.
pub type DataCallback = Arc<dyn Fn() + Send + Sync>;

/// Byte-transfer contract consumed by the protocol engine
pub trait Transport: Send {
    /// Open the underlying channel
    fn open(&mut self) -> io::Result<()>;

    /// Close the underlying channel. Closing a closed transport is a no-op.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Number of bytes that can be read without blocking
    fn bytes_to_read(&mut self) -> io::Result<usize>;

    /// Read up to `buf.len()` bytes, returning the count actually read
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data`
    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()>;

    /// Discard pending input
    fn flush_input(&mut self) -> io::Result<()>;

    /// Push out or discard pending output
    fn flush_output(&mut self) -> io::Result<()>;

    /// Set read and write timeouts
    fn set_timeouts(&mut self, read: Duration, write: Duration) -> io::Result<()>;

    /// Register (or clear) the arrival notification. Returns `false` when the
    /// transport cannot notify, in which case the engine watches
    /// [`bytes_to_read`](Transport::bytes_to_read) instead.
    fn set_data_callback(&mut self, _callback: Option<DataCallback>) -> bool {
        false
    }
}

fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is not open")
}

/// Serial port transport
pub struct SerialChannel {
    settings: SerialSettings,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialChannel {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            port: None,
        }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or_else(not_open)
    }
}

impl fmt::Debug for SerialChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialChannel")
            .field("settings", &self.settings)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl Transport for SerialChannel {
    fn open(&mut self) -> io::Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let to_io = |e: ProtocolError| io::Error::new(io::ErrorKind::Other, e);
        let mut port = open_port(&self.settings.port_name, Some(self.settings.baud_rate))
            .map_err(to_io)?;
        configure_port(port.as_mut()).map_err(to_io)?;
        clear_buffers(port.as_mut()).map_err(to_io)?;
        debug!(port = %self.settings.port_name, baud = self.settings.baud_rate, "serial port open");
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.settings.port_name, "serial port closed");
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        self.port()?
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port()?.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()
    }

    fn flush_input(&mut self) -> io::Result<()> {
        self.port()?
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn flush_output(&mut self) -> io::Result<()> {
        self.port()?
            .clear(serialport::ClearBuffer::Output)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn set_timeouts(&mut self, read: Duration, _write: Duration) -> io::Result<()> {
        // serialport exposes a single timeout for both directions
        self.port()?
            .set_timeout(read)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Answers each write with the bytes the simulated device sends back.
pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

#[derive(Default)]
struct MemoryState {
    open: bool,
    inbound: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    callback: Option<DataCallback>,
    responder: Option<Responder>,
    fail_io: bool,
    opens: usize,
    closes: usize,
    input_flushes: usize,
}

/// In-memory loopback transport
///
/// Clones share the same state, so a test (or a device simulator) keeps one
/// handle to inject inbound bytes and inspect writes while the engine owns
/// another.
#[derive(Clone)]
pub struct MemoryChannel {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryChannel")
            .field("open", &state.open)
            .field("pending", &state.inbound.len())
            .field("writes", &state.writes.len())
            .finish()
    }
}

impl MemoryChannel {
    /// Create an open channel with nothing pending
    pub fn new() -> Self {
        let state = MemoryState {
            open: true,
            ..MemoryState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Create an open channel that answers writes through `responder`
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        let channel = Self::new();
        channel.lock().responder = Some(Box::new(responder));
        channel
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue inbound bytes and raise the arrival notification
    pub fn inject(&self, bytes: &[u8]) {
        let callback = {
            let mut state = self.lock();
            state.inbound.extend(bytes.iter().copied());
            state.callback.clone()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Every write, in order, as it was issued
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// All written bytes concatenated
    pub fn written(&self) -> Vec<u8> {
        self.lock().writes.concat()
    }

    /// Inbound bytes not yet consumed
    pub fn pending(&self) -> usize {
        self.lock().inbound.len()
    }

    /// Make every subsequent I/O call fail
    pub fn set_failing(&self, fail: bool) {
        self.lock().fail_io = fail;
    }

    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    pub fn input_flush_count(&self) -> usize {
        self.lock().input_flushes
    }

    pub fn has_callback(&self) -> bool {
        self.lock().callback.is_some()
    }

    fn check(state: &MemoryState) -> io::Result<()> {
        if state.fail_io {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated failure"));
        }
        if !state.open {
            return Err(not_open());
        }
        Ok(())
    }
}

impl Transport for MemoryChannel {
    fn open(&mut self) -> io::Result<()> {
        let mut state = self.lock();
        if state.fail_io {
            return Err(io::Error::new(io::ErrorKind::NotFound, "simulated failure"));
        }
        state.open = true;
        state.opens += 1;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.lock();
        if state.open {
            state.open = false;
            state.closes += 1;
        }
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        let state = self.lock();
        Self::check(&state)?;
        Ok(state.inbound.len())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        Self::check(&state)?;
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        let (reply, callback) = {
            let mut state = self.lock();
            Self::check(&state)?;
            state.writes.push(data.to_vec());
            let reply = state.responder.as_mut().and_then(|respond| respond(data));
            if let Some(reply) = &reply {
                state.inbound.extend(reply.iter().copied());
            }
            (reply, state.callback.clone())
        };
        if let (Some(_), Some(callback)) = (reply, callback) {
            callback();
        }
        Ok(())
    }

    fn flush_input(&mut self) -> io::Result<()> {
        let mut state = self.lock();
        Self::check(&state)?;
        if !state.inbound.is_empty() {
            warn!(discarded = state.inbound.len(), "flushing pending input");
        }
        state.inbound.clear();
        state.input_flushes += 1;
        Ok(())
    }

    fn flush_output(&mut self) -> io::Result<()> {
        Self::check(&self.lock())
    }

    fn set_timeouts(&mut self, _read: Duration, _write: Duration) -> io::Result<()> {
        Ok(())
    }

    fn set_data_callback(&mut self, callback: Option<DataCallback>) -> bool {
        self.lock().callback = callback;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_memory_channel_read_write() {
        let handle = MemoryChannel::new();
        let mut transport = handle.clone();

        handle.inject(&[1, 2, 3]);
        assert_eq!(transport.bytes_to_read().unwrap(), 3);

        let mut buf = [0u8; 2];
        assert_eq!(transport.read_bytes(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(handle.pending(), 1);

        transport.write_bytes(b"hi").unwrap();
        assert_eq!(handle.written(), b"hi".to_vec());
    }

    #[test]
    fn test_memory_channel_closed_rejects_io() {
        let mut transport = MemoryChannel::new();
        transport.close();
        assert!(!transport.is_open());
        assert!(transport.write_bytes(&[0]).is_err());
        assert!(transport.bytes_to_read().is_err());

        transport.open().unwrap();
        assert!(transport.write_bytes(&[0]).is_ok());
        assert_eq!(transport.open_count(), 1);
        assert_eq!(transport.close_count(), 1);
    }

    #[test]
    fn test_memory_channel_callback_and_responder() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let mut transport = MemoryChannel::with_responder(|data| {
            if data == [0x05] {
                Some(vec![0xAA])
            } else {
                None
            }
        });
        assert!(transport.set_data_callback(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))));

        transport.write_bytes(&[0x01]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        transport.write_bytes(&[0x05]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(transport.pending(), 1);

        transport.flush_input().unwrap();
        assert_eq!(transport.pending(), 0);
        assert_eq!(transport.input_flush_count(), 1);
    }
}
