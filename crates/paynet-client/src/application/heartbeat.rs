//! Keepalive for a ready session.
//!
//! Every `interval` the monitor sends a fresh `Ping` built by the configured
//! factory.  The dispatch loop calls [`AckClock::record`] whenever a `Pong`
//! arrives.  If `miss_limit` intervals pass without one, the monitor returns
//! [`ClientError::HeartbeatTimeout`] once and stops.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use paynet_core::protocol::paybox::TYPE_PING;
use paynet_core::{Frame, Message};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::application::outbox::FrameWriter;
use crate::domain::config::HeartbeatFactory;
use crate::domain::error::ClientError;

/// Time of the most recent keepalive acknowledgment.
#[derive(Debug, Clone)]
pub struct AckClock(Arc<Mutex<Instant>>);

impl AckClock {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    pub fn record(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn last(&self) -> Instant {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for AckClock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct HeartbeatMonitor {
    interval: Duration,
    miss_limit: u32,
    factory: HeartbeatFactory,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, miss_limit: u32, factory: HeartbeatFactory) -> Self {
        Self {
            interval,
            miss_limit: miss_limit.max(1),
            factory,
        }
    }

    /// Runs until cancelled (`None`) or until the session must be torn down
    /// (`Some(error)`).
    pub async fn run(
        self,
        writer: Arc<dyn FrameWriter>,
        acks: AckClock,
        cancel: CancellationToken,
    ) -> Option<ClientError> {
        let window = self.interval * self.miss_limit;
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = ticker.tick() => {}
            }

            let silent_for = acks.last().elapsed();
            if silent_for >= window {
                warn!(
                    ?silent_for,
                    missed = self.miss_limit,
                    "no heartbeat acknowledgment; declaring session dead"
                );
                return Some(ClientError::HeartbeatTimeout {
                    missed: self.miss_limit,
                    interval: self.interval,
                });
            }

            let ping = (self.factory)();
            let payload = match ping.encode_payload() {
                Ok(payload) => payload,
                Err(e) => return Some(e.into()),
            };
            debug!(timestamp = ping.timestamp, "sending heartbeat");
            let write = writer.write_frame(Frame::new(TYPE_PING, payload));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                result = write => {
                    if let Err(e) = result {
                        return Some(e);
                    }
                }
            }
        }
    }
}
