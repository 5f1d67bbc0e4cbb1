//! Per-channel rate limiting using a sliding window
//!
//! Each channel may admit at most `rate_limit_per_minute` sends within any
//! window of `window_secs` (60 by default). Admission timestamps older than
//! the window are evicted lazily whenever the channel is consulted.
//!
//! A granted slot is consumed for good: a send that fails afterwards does
//! not give it back.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use courier_common::{ChannelKind, tracing};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Length of the sliding window, in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
        }
    }
}

const fn default_window_secs() -> u64 {
    60
}

/// Admission log for a single channel
#[derive(Debug)]
struct SlidingWindow {
    limit: u32,
    window: Duration,
    admitted: VecDeque<Instant>,
}

impl SlidingWindow {
    fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            admitted: VecDeque::with_capacity(limit as usize),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.admitted.front()
            && now.saturating_duration_since(*oldest) >= self.window
        {
            self.admitted.pop_front();
        }
    }

    fn is_saturated(&mut self, now: Instant) -> bool {
        self.evict(now);
        self.admitted.len() >= self.limit as usize
    }

    fn try_admit(&mut self, now: Instant) -> bool {
        if self.is_saturated(now) {
            false
        } else {
            self.admitted.push_back(now);
            true
        }
    }

    /// Time until the oldest admission leaves the window
    fn wait_time(&mut self, now: Instant) -> Duration {
        if !self.is_saturated(now) {
            return Duration::ZERO;
        }

        self.admitted.front().map_or(Duration::ZERO, |oldest| {
            (*oldest + self.window).saturating_duration_since(now)
        })
    }
}

/// Per-channel rate limiter
///
/// Channels without a configured limit are never limited.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    limits: HashMap<ChannelKind, u32>,
    windows: DashMap<ChannelKind, Arc<parking_lot::Mutex<SlidingWindow>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(
        config: &RateLimitConfig,
        limits: impl IntoIterator<Item = (ChannelKind, u32)>,
    ) -> Self {
        Self {
            window: Duration::from_secs(config.window_secs),
            limits: limits.into_iter().collect(),
            windows: DashMap::new(),
        }
    }

    fn get_window(&self, channel: ChannelKind) -> Option<Arc<parking_lot::Mutex<SlidingWindow>>> {
        let limit = *self.limits.get(&channel)?;

        Some(
            self.windows
                .entry(channel)
                .or_insert_with(|| {
                    Arc::new(parking_lot::Mutex::new(SlidingWindow::new(
                        limit,
                        self.window,
                    )))
                })
                .clone(),
        )
    }

    /// Try to take a slot on `channel`
    pub fn try_admit(&self, channel: ChannelKind) -> bool {
        self.try_admit_at(channel, Instant::now())
    }

    pub fn try_admit_at(&self, channel: ChannelKind, now: Instant) -> bool {
        let Some(window) = self.get_window(channel) else {
            return true;
        };

        let admitted = window.lock().try_admit(now);
        if !admitted {
            tracing::debug!(channel = %channel, "Rate limit reached, send not admitted");
        }
        admitted
    }

    #[must_use]
    pub fn is_saturated(&self, channel: ChannelKind) -> bool {
        self.is_saturated_at(channel, Instant::now())
    }

    #[must_use]
    pub fn is_saturated_at(&self, channel: ChannelKind, now: Instant) -> bool {
        self.get_window(channel)
            .is_some_and(|window| window.lock().is_saturated(now))
    }

    /// How long until `channel` can admit again; zero if it can now
    #[must_use]
    pub fn wait_time(&self, channel: ChannelKind) -> Duration {
        self.wait_time_at(channel, Instant::now())
    }

    #[must_use]
    pub fn wait_time_at(&self, channel: ChannelKind, now: Instant) -> Duration {
        self.get_window(channel)
            .map_or(Duration::ZERO, |window| window.lock().wait_time(now))
    }

    /// Current usage of a channel's window, `None` if it was never used
    #[must_use]
    pub fn stats(&self, channel: ChannelKind) -> Option<RateLimitStats> {
        self.windows.get(&channel).map(|window| {
            let mut window = window.lock();
            window.evict(Instant::now());

            RateLimitStats {
                admitted_in_window: window.admitted.len(),
                limit: window.limit,
                window: window.window,
            }
        })
    }
}

/// Statistics for a channel's rate limiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStats {
    pub admitted_in_window: usize,
    pub limit: u32,
    pub window: Duration,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn limiter(limit: u32) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig::default(), [(ChannelKind::Sms, limit)])
    }

    #[test]
    fn test_admits_up_to_limit() {
        let limiter = limiter(3);
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.try_admit_at(ChannelKind::Sms, now));
        }
        assert!(!limiter.try_admit_at(ChannelKind::Sms, now));
        assert!(limiter.is_saturated_at(ChannelKind::Sms, now));
    }

    #[test]
    fn test_window_slides() {
        let limiter = limiter(2);
        let start = Instant::now();

        assert!(limiter.try_admit_at(ChannelKind::Sms, start));
        assert!(limiter.try_admit_at(ChannelKind::Sms, start + Duration::from_secs(30)));
        assert!(!limiter.try_admit_at(ChannelKind::Sms, start + Duration::from_secs(59)));

        assert_eq!(
            limiter.wait_time_at(ChannelKind::Sms, start + Duration::from_secs(59)),
            Duration::from_secs(1)
        );

        // The first admission has left the window
        assert!(limiter.try_admit_at(ChannelKind::Sms, start + Duration::from_secs(60)));
        assert!(!limiter.try_admit_at(ChannelKind::Sms, start + Duration::from_secs(61)));
    }

    #[test]
    fn test_unlimited_channel() {
        let limiter = limiter(1);
        let now = Instant::now();

        for _ in 0..100 {
            assert!(limiter.try_admit_at(ChannelKind::Email, now));
        }
        assert!(!limiter.is_saturated_at(ChannelKind::Email, now));
        assert_eq!(limiter.wait_time_at(ChannelKind::Email, now), Duration::ZERO);
    }

    #[test]
    fn test_stats() {
        let limiter = limiter(5);
        assert!(limiter.stats(ChannelKind::Sms).is_none());

        limiter.try_admit(ChannelKind::Sms);
        limiter.try_admit(ChannelKind::Sms);

        let stats = limiter.stats(ChannelKind::Sms).unwrap();
        assert_eq!(stats.admitted_in_window, 2);
        assert_eq!(stats.limit, 5);
        assert_eq!(stats.window, Duration::from_secs(60));
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_limit() {
        let limiter = Arc::new(limiter(50));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.try_admit(ChannelKind::Sms))
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
