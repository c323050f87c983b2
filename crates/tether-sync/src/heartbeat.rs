//! Liveness detection and link quality classification.
//!
//! The client pings at a fixed interval and smooths the round-trip times it
//! observes. A ping left unanswered for longer than a multiple of the smoothed
//! RTT marks the link degraded. Independently, the server announces a
//! heartbeat interval; silence for longer than that interval times a
//! tolerance factor means the link is dead and must be re-established.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Most unanswered pings remembered at once.
const MAX_OUTSTANDING: usize = 64;

/// Quality of an established connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkQuality {
    Healthy,
    Degraded,
}

/// Exponentially weighted moving average of round-trip times.
#[derive(Clone, Debug, Default)]
pub struct RttEstimator {
    smoothed: Option<Duration>,
}

impl RttEstimator {
    pub fn observe(&mut self, sample: Duration) {
        self.smoothed = Some(match self.smoothed {
            None => sample,
            Some(current) => current.mul_f64(0.875) + sample.mul_f64(0.125),
        });
    }

    pub fn smoothed(&self) -> Option<Duration> {
        self.smoothed
    }
}

/// Thresholds used by the [`HeartbeatMonitor`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HeartbeatPolicy {
    /// Unanswered ping age, as a multiple of smoothed RTT, that marks degraded.
    pub degraded_rtt_factor: f64,
    /// Lower bound on the degraded threshold.
    pub min_degraded: Duration,
    /// Multiple of the server's heartbeat interval tolerated as silence.
    pub server_tolerance: f64,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        HeartbeatPolicy {
            degraded_rtt_factor: 4.0,
            min_degraded: Duration::from_secs(1),
            server_tolerance: 2.0,
        }
    }
}

/// Tracks pings, pongs and server heartbeats for one connection.
#[derive(Clone, Debug)]
pub struct HeartbeatMonitor {
    policy: HeartbeatPolicy,
    rtt: RttEstimator,
    next_nonce: u64,
    outstanding: BTreeMap<u64, Instant>,
    server_interval: Duration,
    last_server_beat: Instant,
}

impl HeartbeatMonitor {
    pub fn new(policy: HeartbeatPolicy, server_interval: Duration, now: Instant) -> Self {
        HeartbeatMonitor {
            policy,
            rtt: RttEstimator::default(),
            next_nonce: 1,
            outstanding: BTreeMap::new(),
            server_interval,
            last_server_beat: now,
        }
    }

    /// Register an outgoing ping and return its nonce.
    pub fn ping(&mut self, now: Instant) -> u64 {
        let nonce = self.next_nonce;
        self.next_nonce += 1;
        self.outstanding.insert(nonce, now);
        while self.outstanding.len() > MAX_OUTSTANDING {
            self.outstanding.pop_first();
        }
        nonce
    }

    /// Record a pong. Returns the RTT sample if the nonce was outstanding.
    /// Older pings are considered answered too.
    pub fn pong(&mut self, nonce: u64, now: Instant) -> Option<Duration> {
        let sent = self.outstanding.get(&nonce).copied()?;
        let sample = now.saturating_duration_since(sent);
        self.rtt.observe(sample);
        self.outstanding = self.outstanding.split_off(&(nonce + 1));
        Some(sample)
    }

    /// Any server heartbeat resets the silence timer; a new advertised
    /// interval replaces the old one.
    pub fn server_beat(&mut self, interval: Option<Duration>, now: Instant) {
        if let Some(interval) = interval {
            self.server_interval = interval;
        }
        self.last_server_beat = now;
    }

    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.rtt.smoothed()
    }

    /// Age an unanswered ping may reach before the link counts as degraded.
    pub fn degraded_threshold(&self) -> Duration {
        match self.rtt.smoothed() {
            Some(rtt) => rtt
                .mul_f64(self.policy.degraded_rtt_factor)
                .max(self.policy.min_degraded),
            None => self.policy.min_degraded,
        }
    }

    pub fn quality(&self, now: Instant) -> LinkQuality {
        match self.outstanding.values().next() {
            Some(oldest) if now.saturating_duration_since(*oldest) > self.degraded_threshold() => {
                LinkQuality::Degraded
            }
            _ => LinkQuality::Healthy,
        }
    }

    /// True once the server has been silent for too long.
    pub fn server_silent(&self, now: Instant) -> bool {
        let allowed = self.server_interval.mul_f64(self.policy.server_tolerance);
        now.saturating_duration_since(self.last_server_beat) > allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_rtt_smoothing() {
        let mut rtt = RttEstimator::default();
        assert_eq!(rtt.smoothed(), None);

        rtt.observe(ms(100));
        assert_eq!(rtt.smoothed(), Some(ms(100)));

        rtt.observe(ms(900));
        let smoothed = rtt.smoothed().unwrap();
        assert!(smoothed > ms(199) && smoothed < ms(201));
    }

    #[test]
    fn test_degraded_when_pong_is_late() {
        let start = Instant::now();
        let policy = HeartbeatPolicy {
            degraded_rtt_factor: 4.0,
            min_degraded: ms(100),
            server_tolerance: 2.0,
        };
        let mut monitor = HeartbeatMonitor::new(policy, Duration::from_secs(10), start);

        let nonce = monitor.ping(start);
        assert_eq!(monitor.pong(nonce, start + ms(50)), Some(ms(50)));
        assert_eq!(monitor.degraded_threshold(), ms(200));

        let t = start + ms(1_000);
        monitor.ping(t);
        assert_eq!(monitor.quality(t + ms(150)), LinkQuality::Healthy);
        assert_eq!(monitor.quality(t + ms(250)), LinkQuality::Degraded);

        // Answering the latest ping clears every older one
        let latest = monitor.ping(t + ms(260));
        monitor.pong(latest, t + ms(270));
        assert_eq!(monitor.quality(t + ms(300)), LinkQuality::Healthy);
        assert_eq!(monitor.pong(latest, t + ms(280)), None);
    }

    #[test]
    fn test_server_silence() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(HeartbeatPolicy::default(), ms(100), start);

        assert!(!monitor.server_silent(start + ms(200)));
        assert!(monitor.server_silent(start + ms(201)));

        monitor.server_beat(Some(ms(500)), start + ms(150));
        assert!(!monitor.server_silent(start + ms(1_100)));
        assert!(monitor.server_silent(start + ms(1_200)));
    }
}
