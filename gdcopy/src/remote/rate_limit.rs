//! Soft request throttle over a trailing time window.
//!
//! Calls are admitted freely while the trailing window holds fewer than
//! `max_requests - 1` calls; past that the caller sleeps a fixed cooldown and
//! checks again. Bursts are fine as long as the window never fills up.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::report::{SyncEvent, SyncObserver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(10),
            cooldown: Duration::from_secs(2),
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    recent: Mutex<VecDeque<Instant>>,
    observer: Arc<dyn SyncObserver>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, observer: Arc<dyn SyncObserver>) -> Self {
        Self {
            config: RateLimitConfig {
                cooldown: config.cooldown.max(Duration::from_millis(1)),
                ..config
            },
            recent: Mutex::new(VecDeque::new()),
            observer,
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Waits until the trailing window has room, then records the call.
    pub async fn admit(&self) {
        loop {
            let in_window = {
                let mut recent = self.lock();
                let now = Instant::now();
                self.prune(&mut recent, now);
                if recent.len() < self.threshold() {
                    recent.push_back(now);
                    return;
                }
                recent.len()
            };

            debug!(
                in_window,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "request budget reached, cooling down"
            );
            self.observer.notify(&SyncEvent::RateLimited {
                in_window,
                cooldown: self.config.cooldown,
            });
            tokio::time::sleep(self.config.cooldown).await;
        }
    }

    /// Number of calls recorded inside the trailing window.
    pub fn in_window(&self) -> usize {
        let mut recent = self.lock();
        self.prune(&mut recent, Instant::now());
        recent.len()
    }

    fn threshold(&self) -> usize {
        self.config.max_requests.saturating_sub(1).max(1) as usize
    }

    fn prune(&self, recent: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = recent.front() {
            if now.duration_since(*oldest) >= self.config.window {
                recent.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Instant>> {
        self.recent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
