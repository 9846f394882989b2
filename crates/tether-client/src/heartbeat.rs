//! Heartbeat/keepalive mechanism.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tether_proto::Envelope;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::transport::OutboundFrame;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between pings. The first ping goes out one interval after start.
    pub interval: Duration,
    /// Number of pings allowed to go unanswered before the connection is
    /// declared dead. `None` sends pings without expecting pongs.
    pub max_missed_pongs: Option<u32>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_missed_pongs: None,
        }
    }
}

/// Sends periodic pings while the connection is open.
#[derive(Debug, Default)]
pub struct HeartbeatMonitor {
    running: Arc<AtomicBool>,
    missed_pongs: Arc<AtomicU32>,
    pings_sent: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    /// Create a stopped monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start pinging through `outbound`, replacing any previous run.
    ///
    /// `on_dead` fires at most once, when pong enforcement is enabled and
    /// too many pings went unanswered.
    pub fn start<F>(
        &self,
        outbound: mpsc::Sender<OutboundFrame>,
        config: HeartbeatConfig,
        on_dead: F,
    )
    where
        F: FnOnce() + Send + 'static,
    {
        self.stop();
        self.missed_pongs.store(0, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let running = Arc::clone(&self.running);
        let missed_pongs = Arc::clone(&self.missed_pongs);
        let pings_sent = Arc::clone(&self.pings_sent);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                if let Some(max) = config.max_missed_pongs {
                    let outstanding = missed_pongs.load(Ordering::SeqCst);
                    if outstanding >= max {
                        warn!(outstanding, "heartbeat unanswered, declaring connection dead");
                        running.store(false, Ordering::SeqCst);
                        on_dead();
                        break;
                    }
                }

                let frame = match Envelope::ping().to_json() {
                    Ok(json) => OutboundFrame::Text(json),
                    Err(e) => {
                        warn!(error = %e, "failed to encode ping");
                        continue;
                    }
                };
                // Counted before sending so a fast pong cannot be overwritten.
                missed_pongs.fetch_add(1, Ordering::SeqCst);
                if outbound.send(frame).await.is_err() {
                    // Transport gone; the close path stops us for good.
                    running.store(false, Ordering::SeqCst);
                    break;
                }
                pings_sent.fetch_add(1, Ordering::SeqCst);
                debug!("heartbeat sent");
            }
        });

        *self.task.lock() = Some(handle);
    }

    /// Stop pinging. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Check if the heartbeat is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Pings sent since the monitor was created.
    #[must_use]
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent.load(Ordering::SeqCst)
    }

    /// Pings sent since the last pong.
    #[must_use]
    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs.load(Ordering::SeqCst)
    }

    /// Record a pong from the gateway.
    pub fn pong_received(&self) {
        self.missed_pongs.store(0, Ordering::SeqCst);
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
