//! Connection management
//!
//! [`ProtocolEngine`] owns one device: its transport, template, reconstructor
//! and poll accounting, all behind a single per-device lock. Every entry point
//! (configuration, open/close, sends, inbound reconstruction, status polls,
//! command dispatch) takes that lock, so a poll in flight and a frame being
//! reconstructed never interleave.
//!
//! Device-specific behavior plugs in through [`DeviceAdapter`]; its hooks get
//! a [`DeviceLink`] for framed I/O while the lock is held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::commands::{Command, DeviceIdentity};
use super::config::EngineConfig;
use super::frame::{build_frame, write_chunked};
use super::poll::{LinkEvent, PollTracker};
use super::reconstruct::{Outcome, Reconstructor};
use super::stream::{DataCallback, Transport};
use super::template::MessageTemplate;
use super::{FrameError, ProtocolError};

/// Capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 64;

/// How often a blocking wait re-checks the transport
const BLOCKING_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Notification published by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A checksum-verified payload
    MessageReceived(Vec<u8>),
    Attached,
    Detached,
    Identity(DeviceIdentity),
    FirmwareCrc(u32),
    Acknowledged { resync: bool },
    SelfTestComplete { passed: bool },
    /// An inbound frame was discarded
    Resynced(FrameError),
}

/// Traffic counters for one link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkCounters {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_frames: u64,
    pub rx_frames: u64,
    pub resyncs: u64,
}

/// Device-specific hooks
///
/// Only [`request_status`](DeviceAdapter::request_status) and
/// [`set_enabled`](DeviceAdapter::set_enabled) are required; the remaining
/// hooks default to "not supported" or no-ops.
pub trait DeviceAdapter: Send {
    /// One status poll. `Ok` counts as a successful poll.
    fn request_status(&mut self, link: &mut DeviceLink<'_>) -> Result<(), ProtocolError>;

    fn set_enabled(&mut self, link: &mut DeviceLink<'_>, enabled: bool) -> Result<(), ProtocolError>;

    /// Whether a fault currently forbids enabling the device
    fn has_disabling_fault(&self) -> bool {
        false
    }

    /// Run the self test; `Ok(true)` when it passed
    fn self_test(&mut self, _link: &mut DeviceLink<'_>) -> Result<bool, ProtocolError> {
        Err(ProtocolError::Unsupported("self test"))
    }

    fn read_identity(&mut self, _link: &mut DeviceLink<'_>) -> Result<DeviceIdentity, ProtocolError> {
        Err(ProtocolError::Unsupported("identity report"))
    }

    fn firmware_crc(&mut self, _link: &mut DeviceLink<'_>, _seed: u32) -> Result<u32, ProtocolError> {
        Err(ProtocolError::Unsupported("firmware CRC"))
    }

    /// Reset the transaction sequence after an acknowledge with resync
    fn resync_sequence(&mut self) {}

    /// An unsolicited message reconstructed in event-driven delivery
    fn on_message(&mut self, _payload: &[u8]) {}
}

/// Framed I/O handed to adapter hooks while the device lock is held
pub struct DeviceLink<'a> {
    transport: &'a mut dyn Transport,
    reconstructor: &'a mut Reconstructor,
    config: &'a EngineConfig,
    counters: &'a mut LinkCounters,
    events: &'a broadcast::Sender<EngineEvent>,
}

impl DeviceLink<'_> {
    pub fn template(&self) -> &MessageTemplate {
        self.reconstructor.template()
    }

    pub fn config(&self) -> &EngineConfig {
        self.config
    }

    /// Frame `payload` with the device template and write it
    pub fn send(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        if !self.transport.is_open() {
            return Err(ProtocolError::NotOpen);
        }
        let frame = build_frame(self.reconstructor.template(), payload)?;
        let written = write_chunked(&mut *self.transport, &frame, self.config.max_write_chunk)?;
        self.counters.tx_bytes += written as u64;
        self.counters.tx_frames += 1;
        debug!(len = written, "frame sent");
        Ok(())
    }

    /// Wait for one frame whose payload is about `expected_len` bytes.
    ///
    /// The deadline grows with the expected length. A frame discarded while
    /// waiting is published as [`EngineEvent::Resynced`] and returned as an
    /// error.
    pub fn receive(&mut self, expected_len: usize) -> Result<Vec<u8>, ProtocolError> {
        let frame_len = expected_len + self.reconstructor.template().non_data_length();
        let deadline = self.config.response_timing().deadline(frame_len);
        match self
            .reconstructor
            .receive(&mut *self.transport, deadline, BLOCKING_POLL_INTERVAL)
        {
            Ok(payload) => {
                self.counters.rx_frames += 1;
                self.counters.rx_bytes += (payload.len() + self.template().non_data_length()) as u64;
                Ok(payload)
            }
            Err(FrameError::Timeout { elapsed_ms }) => {
                self.counters.resyncs += 1;
                debug!(elapsed_ms, expected_len, "no response before deadline");
                Err(ProtocolError::Timeout)
            }
            Err(error) => {
                self.counters.resyncs += 1;
                let _ = self.events.send(EngineEvent::Resynced(error.clone()));
                Err(error.into())
            }
        }
    }

    /// Send `payload` and wait for the response
    pub fn transact(&mut self, payload: &[u8], expected_len: usize) -> Result<Vec<u8>, ProtocolError> {
        self.send(payload)?;
        self.receive(expected_len)
    }
}

struct EngineCore {
    transport: Box<dyn Transport>,
    adapter: Box<dyn DeviceAdapter>,
    reconstructor: Reconstructor,
    config: EngineConfig,
    counters: LinkCounters,
    tracker: PollTracker,
    identity: Option<DeviceIdentity>,
}

impl EngineCore {
    /// Borrow the adapter and a link over the rest of the core at once
    fn split<'a>(
        &'a mut self,
        events: &'a broadcast::Sender<EngineEvent>,
    ) -> (&'a mut dyn DeviceAdapter, DeviceLink<'a>) {
        let EngineCore {
            transport,
            adapter,
            reconstructor,
            config,
            counters,
            ..
        } = self;
        let link = DeviceLink {
            transport: transport.as_mut(),
            reconstructor,
            config,
            counters,
            events,
        };
        (adapter.as_mut(), link)
    }

    fn rebuild_reconstructor(&mut self) {
        let template = self.reconstructor.template().clone();
        self.reconstructor = Reconstructor::new(template)
            .with_frame_timeout(self.config.frame_timeout())
            .with_flush_after_frame(self.config.flush_after_frame);
    }
}

/// Template-driven engine for one device
///
/// Cloning yields another handle to the same device.
#[derive(Clone)]
pub struct ProtocolEngine {
    core: Arc<Mutex<EngineCore>>,
    events: broadcast::Sender<EngineEvent>,
    disposed: Arc<AtomicBool>,
}

impl ProtocolEngine {
    pub fn new<T, A>(transport: T, template: Arc<MessageTemplate>, adapter: A) -> Self
    where
        T: Transport + 'static,
        A: DeviceAdapter + 'static,
    {
        let config = EngineConfig::default();
        let mut core = EngineCore {
            transport: Box::new(transport),
            adapter: Box::new(adapter),
            reconstructor: Reconstructor::new(template),
            tracker: PollTracker::new(config.max_failed_polls),
            config,
            counters: LinkCounters::default(),
            identity: None,
        };
        core.rebuild_reconstructor();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            core: Arc::new(Mutex::new(core)),
            events,
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run `f` under the device lock
    fn with_core<R>(
        &self,
        f: impl FnOnce(&mut EngineCore, &broadcast::Sender<EngineEvent>) -> Result<R, ProtocolError>,
    ) -> Result<R, ProtocolError> {
        if self.is_disposed() {
            return Err(ProtocolError::Disposed);
        }
        let mut core = self.core.lock().map_err(|_| ProtocolError::LockPoisoned)?;
        // Disposal may have completed while this call waited for the lock
        if self.is_disposed() {
            return Err(ProtocolError::Disposed);
        }
        f(&mut *core, &self.events)
    }

    fn publish(events: &broadcast::Sender<EngineEvent>, event: EngineEvent) {
        // No subscribers is not an error
        let _ = events.send(event);
    }

    /// Apply `config` and (re)open the transport.
    ///
    /// Transport failures close the transport again and are reported as an
    /// error rather than left half-open.
    pub fn configure(&self, config: EngineConfig) -> Result<(), ProtocolError> {
        self.with_core(|core, _| {
            core.config = config;
            core.tracker = PollTracker::new(core.config.max_failed_polls);
            core.rebuild_reconstructor();

            let read = Duration::from_millis(core.config.read_timeout_ms);
            let write = Duration::from_millis(core.config.write_timeout_ms);
            let opened = core
                .transport
                .open()
                .and_then(|()| core.transport.set_timeouts(read, write));
            if let Err(e) = opened {
                warn!("configuration failed, closing transport: {e}");
                core.transport.close();
                return Err(ProtocolError::SerialError(e.to_string()));
            }
            info!(mode = ?core.config.delivery_mode, "engine configured");
            Ok(())
        })
    }

    pub fn open(&self) -> Result<(), ProtocolError> {
        self.with_core(|core, _| {
            core.transport.open()?;
            Ok(())
        })
    }

    /// Close the transport and drop any partial frame
    pub fn close(&self) -> Result<(), ProtocolError> {
        self.with_core(|core, _| {
            core.transport.close();
            core.reconstructor.reset();
            Ok(())
        })
    }

    pub fn is_open(&self) -> bool {
        self.with_core(|core, _| Ok(core.transport.is_open()))
            .unwrap_or(false)
    }

    /// Frame and write `payload`
    pub fn send(&self, payload: &[u8]) -> Result<(), ProtocolError> {
        self.with_core(|core, events| core.split(events).1.send(payload))
    }

    /// Send `payload` and wait for a response of about `expected_len` bytes
    pub fn transact(&self, payload: &[u8], expected_len: usize) -> Result<Vec<u8>, ProtocolError> {
        self.with_core(|core, events| core.split(events).1.transact(payload, expected_len))
    }

    /// One event-driven reconstruction pass.
    ///
    /// Consumes whatever is buffered, publishing every completed message and
    /// every discarded frame. Framing problems never surface as errors.
    /// Returns the number of messages delivered.
    pub fn process_incoming(&self) -> Result<usize, ProtocolError> {
        self.with_core(|core, events| {
            let mut delivered = 0;
            loop {
                match core.reconstructor.poll(core.transport.as_mut()) {
                    Outcome::Complete(payload) => {
                        let frame_len = payload.len() + core.reconstructor.template().non_data_length();
                        core.counters.rx_frames += 1;
                        core.counters.rx_bytes += frame_len as u64;
                        core.adapter.on_message(&payload);
                        Self::publish(events, EngineEvent::MessageReceived(payload));
                        delivered += 1;
                    }
                    Outcome::Resynced(error) => {
                        core.counters.resyncs += 1;
                        // A failing transport yields nothing more this pass
                        let stop = matches!(error, FrameError::Io(_));
                        Self::publish(events, EngineEvent::Resynced(error));
                        if stop {
                            return Ok(delivered);
                        }
                    }
                    Outcome::Pending | Outcome::Idle => return Ok(delivered),
                }
            }
        })
    }

    /// Run one status poll and apply attach/detach accounting
    pub fn poll_once(&self) -> Result<Option<LinkEvent>, ProtocolError> {
        self.with_core(|core, events| {
            let success = {
                let (adapter, mut link) = core.split(events);
                match adapter.request_status(&mut link) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("status request failed: {e}");
                        false
                    }
                }
            };

            let transition = core.tracker.record(success);
            match transition {
                Some(LinkEvent::Attached) => {
                    Self::publish(events, EngineEvent::Attached);
                    if core.identity.is_none() {
                        let (adapter, mut link) = core.split(events);
                        match adapter.read_identity(&mut link) {
                            Ok(identity) => {
                                info!(%identity, "device identified");
                                core.identity = Some(identity.clone());
                                Self::publish(events, EngineEvent::Identity(identity));
                            }
                            Err(e) => debug!("identity not read on attach: {e}"),
                        }
                    }
                }
                Some(LinkEvent::Detached) => {
                    core.identity = None;
                    Self::publish(events, EngineEvent::Detached);
                }
                None => {}
            }
            Ok(transition)
        })
    }

    /// Execute one generic command
    pub fn dispatch(&self, command: Command) -> Result<(), ProtocolError> {
        self.with_core(|core, events| {
            debug!(code = command.code(), ?command, "dispatching command");
            let (adapter, mut link) = core.split(events);
            match command {
                Command::Acknowledge { resync } => {
                    if resync {
                        adapter.resync_sequence();
                    }
                    Self::publish(events, EngineEvent::Acknowledged { resync });
                }
                Command::Enable => {
                    if adapter.has_disabling_fault() {
                        warn!("enable refused: device reports a disabling fault");
                        return Err(ProtocolError::DisablingFault);
                    }
                    adapter.set_enabled(&mut link, true)?;
                }
                Command::Disable => adapter.set_enabled(&mut link, false)?,
                Command::SelfTest => {
                    let passed = adapter.self_test(&mut link)?;
                    Self::publish(events, EngineEvent::SelfTestComplete { passed });
                }
                Command::RequestIdentity => {
                    let identity = adapter.read_identity(&mut link)?;
                    core.identity = Some(identity.clone());
                    Self::publish(events, EngineEvent::Identity(identity));
                }
                Command::QueryFirmwareCrc { seed } => {
                    let crc = adapter.firmware_crc(&mut link, seed)?;
                    Self::publish(events, EngineEvent::FirmwareCrc(crc));
                }
                Command::Unknown(code) => {
                    debug!(code, "ignoring unknown command");
                }
            }
            Ok(())
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn is_attached(&self) -> bool {
        self.with_core(|core, _| Ok(core.tracker.is_attached()))
            .unwrap_or(false)
    }

    /// Identity read since the last attach
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.with_core(|core, _| Ok(core.identity.clone()))
            .ok()
            .flatten()
    }

    pub fn counters(&self) -> LinkCounters {
        self.with_core(|core, _| Ok(core.counters)).unwrap_or_default()
    }

    pub fn config(&self) -> Result<EngineConfig, ProtocolError> {
        self.with_core(|core, _| Ok(core.config.clone()))
    }

    /// Register the arrival notification; `false` when the transport cannot
    /// notify
    pub fn set_data_callback(&self, callback: Option<DataCallback>) -> Result<bool, ProtocolError> {
        self.with_core(|core, _| Ok(core.transport.set_data_callback(callback)))
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Mark the engine disposed, unregister the arrival notification and
    /// release the transport. Later calls fail with
    /// [`ProtocolError::Disposed`]. Disposing twice is a no-op.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Waits for in-flight work, which observes the flag on its next call
        let mut core = match self.core.lock() {
            Ok(core) => core,
            Err(poisoned) => poisoned.into_inner(),
        };
        core.transport.set_data_callback(None);
        core.reconstructor.reset();
        core.transport.close();
        info!("engine disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::checksum::ChecksumKind;
    use crate::protocol::stream::MemoryChannel;
    use crate::protocol::template::{Element, TemplateBuilder};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;

    fn template() -> Arc<MessageTemplate> {
        Arc::new(
            TemplateBuilder::new(ChecksumKind::Xor)
                .element(Element::constant(&[0x02]).unchecked())
                .element(Element::data_length(1))
                .element(Element::fixed_data(1))
                .element(Element::variable_data())
                .element(Element::crc(1))
                .build()
                .unwrap(),
        )
    }

    /// Succeeds while `healthy` is set
    struct StubAdapter {
        healthy: Arc<AtomicBool>,
        enables: Arc<AtomicU32>,
    }

    impl DeviceAdapter for StubAdapter {
        fn request_status(&mut self, _link: &mut DeviceLink<'_>) -> Result<(), ProtocolError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ProtocolError::Timeout)
            }
        }

        fn set_enabled(&mut self, link: &mut DeviceLink<'_>, enabled: bool) -> Result<(), ProtocolError> {
            self.enables.fetch_add(1, Ordering::SeqCst);
            link.send(&[if enabled { b'E' } else { b'D' }])
        }
    }

    fn engine() -> (ProtocolEngine, MemoryChannel, Arc<AtomicBool>) {
        let channel = MemoryChannel::new();
        let healthy = Arc::new(AtomicBool::new(true));
        let adapter = StubAdapter {
            healthy: healthy.clone(),
            enables: Arc::new(AtomicU32::new(0)),
        };
        let engine = ProtocolEngine::new(channel.clone(), template(), adapter);
        (engine, channel, healthy)
    }

    #[test]
    fn test_send_counts_traffic() {
        let (engine, channel, _) = engine();
        engine.send(&[0x41, 1, 2]).unwrap();
        assert_eq!(channel.written().len(), 6);
        let counters = engine.counters();
        assert_eq!(counters.tx_frames, 1);
        assert_eq!(counters.tx_bytes, 6);
    }

    #[test]
    fn test_process_incoming_publishes() {
        let (engine, channel, _) = engine();
        let mut events = engine.subscribe();
        let frame = build_frame(&template(), &[0x41, 7]).unwrap();
        channel.inject(&frame);

        assert_eq!(engine.process_incoming().unwrap(), 1);
        assert_eq!(
            events.try_recv().unwrap(),
            EngineEvent::MessageReceived(vec![0x41, 7])
        );
        assert_eq!(engine.counters().rx_frames, 1);
    }

    #[test]
    fn test_process_incoming_on_closed_transport_returns() {
        let (engine, channel, _) = engine();
        let mut events = engine.subscribe();
        engine.close().unwrap();
        assert_eq!(engine.process_incoming().unwrap(), 0);

        // A partial frame cut off by a failing transport is discarded once
        engine.open().unwrap();
        channel.inject(&[0x02, 0x05]);
        assert_eq!(engine.process_incoming().unwrap(), 0);
        channel.set_failing(true);
        assert_eq!(engine.process_incoming().unwrap(), 0);
        assert!(matches!(
            events.try_recv().unwrap(),
            EngineEvent::Resynced(FrameError::Io(_))
        ));
        assert_eq!(engine.process_incoming().unwrap(), 0);
        assert!(events.try_recv().is_err());
        assert_eq!(engine.counters().resyncs, 1);
    }

    #[test]
    fn test_configure_failure_closes_transport() {
        let (engine, channel, _) = engine();
        channel.set_failing(true);
        assert!(engine.configure(EngineConfig::default()).is_err());
        assert!(!engine.is_open());
    }

    #[test]
    fn test_unsupported_hook() {
        let (engine, _, _) = engine();
        let err = engine.dispatch(Command::SelfTest).unwrap_err();
        assert!(matches!(err, ProtocolError::Unsupported("self test")));
        assert!(engine.dispatch(Command::Unknown(0x7E)).is_ok());
    }

    #[test]
    fn test_dispose_rejects_further_calls() {
        let (engine, channel, _) = engine();
        engine.dispose();
        assert!(!channel.is_open());
        assert!(matches!(engine.send(&[0x41]), Err(ProtocolError::Disposed)));
        engine.dispose();
        assert_eq!(channel.close_count(), 1);
    }
}
