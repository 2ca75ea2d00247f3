use periwire_core::protocol::{
    ChecksumKind, DeviceAdapter, DeviceIdentity, DeviceLink, Element, EngineConfig, EngineEvent,
    LinkEvent, MemoryChannel, PollTracker, ProtocolEngine, ProtocolError, TemplateBuilder,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::TryRecvError;

/// Status succeeds while `healthy` is set; identity reads are counted
struct Hopper {
    healthy: Arc<AtomicBool>,
    identity_reads: Arc<AtomicUsize>,
}

impl DeviceAdapter for Hopper {
    fn request_status(&mut self, _link: &mut DeviceLink<'_>) -> Result<(), ProtocolError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProtocolError::Timeout)
        }
    }

    fn set_enabled(&mut self, _link: &mut DeviceLink<'_>, _enabled: bool) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn read_identity(&mut self, _link: &mut DeviceLink<'_>) -> Result<DeviceIdentity, ProtocolError> {
        self.identity_reads.fetch_add(1, Ordering::SeqCst);
        Ok(DeviceIdentity::new("Acme", "Hopper", "1.20", "B"))
    }
}

struct Fixture {
    engine: ProtocolEngine,
    healthy: Arc<AtomicBool>,
    identity_reads: Arc<AtomicUsize>,
}

fn fixture(max_failed_polls: u32) -> Fixture {
    let template = TemplateBuilder::new(ChecksumKind::Xor)
        .element(Element::constant(&[0x02]).unchecked())
        .element(Element::data_length(1))
        .element(Element::variable_data())
        .element(Element::crc(1))
        .build()
        .unwrap();
    let healthy = Arc::new(AtomicBool::new(true));
    let identity_reads = Arc::new(AtomicUsize::new(0));
    let adapter = Hopper {
        healthy: healthy.clone(),
        identity_reads: identity_reads.clone(),
    };
    let engine = ProtocolEngine::new(MemoryChannel::new(), Arc::new(template), adapter);
    engine
        .configure(EngineConfig {
            max_failed_polls,
            poll_interval_ms: None,
            ..EngineConfig::default()
        })
        .unwrap();
    Fixture {
        engine,
        healthy,
        identity_reads,
    }
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return seen,
            Err(TryRecvError::Lagged(_)) => continue,
        }
    }
}

#[test]
fn test_three_failures_detach_once() {
    let f = fixture(3);
    let mut events = f.engine.subscribe();

    assert_eq!(f.engine.poll_once().unwrap(), Some(LinkEvent::Attached));
    f.healthy.store(false, Ordering::SeqCst);
    assert_eq!(f.engine.poll_once().unwrap(), None);
    assert_eq!(f.engine.poll_once().unwrap(), None);
    assert_eq!(f.engine.poll_once().unwrap(), Some(LinkEvent::Detached));
    assert_eq!(f.engine.poll_once().unwrap(), None);
    assert!(!f.engine.is_attached());

    let detaches = drain(&mut events)
        .into_iter()
        .filter(|e| *e == EngineEvent::Detached)
        .count();
    assert_eq!(detaches, 1);
}

#[test]
fn test_success_between_failures_resets_counter() {
    let f = fixture(3);
    let mut events = f.engine.subscribe();
    f.engine.poll_once().unwrap();

    f.healthy.store(false, Ordering::SeqCst);
    f.engine.poll_once().unwrap();
    f.healthy.store(true, Ordering::SeqCst);
    f.engine.poll_once().unwrap();
    f.healthy.store(false, Ordering::SeqCst);
    f.engine.poll_once().unwrap();
    f.engine.poll_once().unwrap();

    assert!(f.engine.is_attached());
    assert!(!drain(&mut events).contains(&EngineEvent::Detached));
}

#[test]
fn test_failures_while_detached_do_not_count() {
    let f = fixture(2);
    f.healthy.store(false, Ordering::SeqCst);
    for _ in 0..5 {
        assert_eq!(f.engine.poll_once().unwrap(), None);
    }
    f.healthy.store(true, Ordering::SeqCst);
    assert_eq!(f.engine.poll_once().unwrap(), Some(LinkEvent::Attached));
}

#[test]
fn test_identity_read_on_attach_and_cleared_on_detach() {
    let f = fixture(1);
    let mut events = f.engine.subscribe();

    f.engine.poll_once().unwrap();
    f.engine.poll_once().unwrap();
    assert_eq!(f.identity_reads.load(Ordering::SeqCst), 1);
    let identity = f.engine.identity().unwrap();
    assert_eq!(identity.to_string(), "Acme Hopper fw 1.20 rev B");
    assert_eq!(
        drain(&mut events),
        vec![EngineEvent::Attached, EngineEvent::Identity(identity)]
    );

    f.healthy.store(false, Ordering::SeqCst);
    assert_eq!(f.engine.poll_once().unwrap(), Some(LinkEvent::Detached));
    assert_eq!(f.engine.identity(), None);

    // Re-read on the next attach
    f.healthy.store(true, Ordering::SeqCst);
    f.engine.poll_once().unwrap();
    assert_eq!(f.identity_reads.load(Ordering::SeqCst), 2);
}

#[test]
fn test_tracker_threshold_of_one() {
    let mut tracker = PollTracker::new(1);
    assert_eq!(tracker.record(true), Some(LinkEvent::Attached));
    assert_eq!(tracker.record(false), Some(LinkEvent::Detached));
}
