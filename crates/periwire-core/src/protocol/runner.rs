//! Background driver for a [`ProtocolEngine`]
//!
//! One actor task owns the timing for a device. It waits on:
//!
//! - cancellation
//! - data arrival (the transport's notification, or a watch tick when the
//!   transport cannot notify)
//! - the next status poll
//! - poll schedule changes (suspend, resume, new interval)
//!
//! Engine calls hold the per-device lock and may wait on the transport, so
//! they run on the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::config::DeliveryMode;
use super::connection::ProtocolEngine;
use super::poll::PollSchedule;
use super::ProtocolError;

/// Run `f` against the engine on the blocking pool
async fn blocking<R, F>(engine: &ProtocolEngine, f: F) -> Result<R, ProtocolError>
where
    R: Send + 'static,
    F: FnOnce(&ProtocolEngine) -> Result<R, ProtocolError> + Send + 'static,
{
    let engine = engine.clone();
    tokio::task::spawn_blocking(move || f(&engine))
        .await
        .map_err(|e| ProtocolError::TaskFailed(e.to_string()))?
}

enum Wake {
    Stop,
    Data,
    Poll,
    Reschedule,
}

struct Actor {
    engine: ProtocolEngine,
    notify: Arc<Notify>,
    schedule: watch::Receiver<PollSchedule>,
    cancel: CancellationToken,
    event_driven: bool,
    housekeeping: Duration,
}

impl Actor {
    fn next_poll(&self) -> Option<Instant> {
        let now = Instant::now();
        let delay = self.schedule.borrow().next_delay(now)?;
        Some(now + delay)
    }

    async fn run(mut self) {
        let mut housekeeping = tokio::time::interval(self.housekeeping);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_poll = self.next_poll();

        loop {
            let poll_due = async move {
                match next_poll {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            let wake = tokio::select! {
                _ = self.cancel.cancelled() => Wake::Stop,
                _ = self.notify.notified(), if self.event_driven => Wake::Data,
                _ = housekeeping.tick(), if self.event_driven => Wake::Data,
                _ = poll_due => Wake::Poll,
                changed = self.schedule.changed() => match changed {
                    Ok(()) => Wake::Reschedule,
                    Err(_) => Wake::Stop,
                },
            };

            let outcome = match wake {
                Wake::Stop => break,
                Wake::Data => blocking(&self.engine, |e| e.process_incoming().map(drop)).await,
                Wake::Poll => {
                    let polled = blocking(&self.engine, |e| e.poll_once().map(drop)).await;
                    next_poll = self.next_poll();
                    polled
                }
                Wake::Reschedule => {
                    next_poll = self.next_poll();
                    debug!(?next_poll, "poll schedule changed");
                    Ok(())
                }
            };

            match outcome {
                Ok(()) => {}
                Err(ProtocolError::Disposed) => break,
                Err(e) => warn!("engine runner: {e}"),
            }
        }
        debug!("engine runner stopped");
    }
}

/// Drives polling and event-driven delivery for one engine
pub struct EngineRunner {
    engine: ProtocolEngine,
    schedule: watch::Sender<PollSchedule>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    native_notify: bool,
}

impl EngineRunner {
    /// Spawn the actor for `engine`. Must be called from a tokio runtime.
    pub fn start(engine: ProtocolEngine) -> Result<Self, ProtocolError> {
        let config = engine.config()?;
        let event_driven = config.delivery_mode == DeliveryMode::EventDriven;

        let notify = Arc::new(Notify::new());
        let native_notify = if event_driven {
            let waker = notify.clone();
            engine.set_data_callback(Some(Arc::new(move || waker.notify_one())))?
        } else {
            false
        };
        // Stalled partial frames still need expiring when the transport notifies
        let housekeeping = if native_notify {
            (config.frame_timeout() / 2).max(Duration::from_millis(1))
        } else {
            config.data_watch_interval()
        };

        let (schedule, schedule_rx) = watch::channel(PollSchedule::new(config.poll_interval()));
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();

        let actor = Actor {
            engine: engine.clone(),
            notify,
            schedule: schedule_rx,
            cancel: cancel.clone(),
            event_driven,
            housekeeping,
        };
        tasks.spawn(actor.run());
        info!(mode = ?config.delivery_mode, native_notify, "engine runner started");

        Ok(Self {
            engine,
            schedule,
            cancel,
            tasks,
            native_notify,
        })
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    /// Whether the transport raises arrival notifications itself
    pub fn has_native_notify(&self) -> bool {
        self.native_notify
    }

    /// Stop polling for `duration`; polling resumes on its own afterwards.
    /// A poll already in flight completes.
    pub fn suspend_polling(&self, duration: Duration) {
        self.schedule
            .send_modify(|s| s.suspend(duration, Instant::now()));
    }

    pub fn resume_polling(&self) {
        self.schedule.send_modify(PollSchedule::resume);
    }

    /// Change the poll interval; `None` disables polling
    pub fn set_poll_interval(&self, interval: Option<Duration>) {
        self.schedule.send_modify(|s| s.set_interval(interval));
    }

    pub fn poll_schedule(&self) -> PollSchedule {
        *self.schedule.borrow()
    }

    /// Close the transport, wait for the configured reset delay, then reopen.
    ///
    /// Returns immediately. The reconnect runs as a tracked task that
    /// [`shutdown`](Self::shutdown) cancels and awaits.
    pub fn reset_connection(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let delay = match engine.config() {
                Ok(config) => config.reset_delay(),
                Err(e) => {
                    warn!("reset skipped: {e}");
                    return;
                }
            };
            if let Err(e) = blocking(&engine, |e| e.close()).await {
                warn!("reset: close failed: {e}");
                return;
            }
            info!(delay_ms = delay.as_millis() as u64, "connection closed for reset");

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("reset cancelled before reopen");
                    return;
                }
                _ = sleep(delay) => {}
            }

            match blocking(&engine, |e| e.open()).await {
                Ok(()) => info!("connection reopened"),
                Err(e) => warn!("reset: reopen failed: {e}"),
            }
        })
    }

    /// Stop the actor and any reconnect, then release the engine.
    ///
    /// Teardown runs in reverse order of startup: background tasks, the
    /// arrival notification, then the transport.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        if let Err(e) = self.engine.set_data_callback(None) {
            debug!("callback already released: {e}");
        }
        self.engine.dispose();
        info!("engine runner shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::checksum::ChecksumKind;
    use crate::protocol::config::EngineConfig;
    use crate::protocol::connection::{DeviceAdapter, DeviceLink};
    use crate::protocol::stream::{MemoryChannel, Transport};
    use crate::protocol::template::{Element, TemplateBuilder};

    struct Silent;

    impl DeviceAdapter for Silent {
        fn request_status(&mut self, _link: &mut DeviceLink<'_>) -> Result<(), ProtocolError> {
            Ok(())
        }

        fn set_enabled(&mut self, _link: &mut DeviceLink<'_>, _enabled: bool) -> Result<(), ProtocolError> {
            Ok(())
        }
    }

    fn engine(channel: &MemoryChannel) -> ProtocolEngine {
        let template = TemplateBuilder::new(ChecksumKind::None)
            .element(Element::data_length(1))
            .element(Element::variable_data())
            .build()
            .unwrap();
        ProtocolEngine::new(channel.clone(), Arc::new(template), Silent)
    }

    #[tokio::test]
    async fn test_shutdown_releases_in_order() {
        let channel = MemoryChannel::new();
        let engine = engine(&channel);
        engine.configure(EngineConfig {
            poll_interval_ms: None,
            ..EngineConfig::default()
        })
        .unwrap();

        let runner = EngineRunner::start(engine.clone()).unwrap();
        assert!(runner.has_native_notify());
        assert!(channel.has_callback());

        runner.shutdown().await;
        assert!(!channel.has_callback());
        assert!(!channel.is_open());
        assert!(engine.is_disposed());
    }

    #[tokio::test]
    async fn test_schedule_controls() {
        let channel = MemoryChannel::new();
        let runner = EngineRunner::start(engine(&channel)).unwrap();

        runner.set_poll_interval(Some(Duration::from_millis(50)));
        assert_eq!(runner.poll_schedule().interval(), Some(Duration::from_millis(50)));

        runner.suspend_polling(Duration::from_secs(10));
        assert!(runner.poll_schedule().is_suspended(Instant::now()));
        runner.resume_polling();
        assert!(!runner.poll_schedule().is_suspended(Instant::now()));

        runner.shutdown().await;
    }
}
