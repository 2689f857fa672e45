//! Keep-Alive Engine (C4): adaptive heartbeat scheduling and the
//! Healthy/AtRisk/Degraded/Unhealthy state machine.

use std::time::{Duration, Instant};

/// Connection health as tracked by the keep-alive state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    AtRisk,
    Degraded,
    Unhealthy,
}

/// Per-connection keep-alive bookkeeping: current health state, the
/// adaptive ping interval, and missed-pong counters.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    state: HealthState,
    consecutive_missed_pongs: u32,
    last_ping_sent_at: Option<Instant>,
    current_interval: Duration,
    min_interval: Duration,
    max_interval: Duration,
    adaptive_enabled: bool,
    quality_threshold: f32,
    consecutive_samples_in_band: (QualityBand, u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QualityBand {
    High,
    Mid,
    Low,
}

impl KeepAlive {
    pub fn new(
        base_interval: Duration,
        min_interval: Duration,
        max_interval: Duration,
        adaptive_enabled: bool,
        quality_threshold: f32,
    ) -> Self {
        KeepAlive {
            state: HealthState::Healthy,
            consecutive_missed_pongs: 0,
            last_ping_sent_at: None,
            current_interval: base_interval,
            min_interval,
            max_interval,
            adaptive_enabled,
            quality_threshold,
            consecutive_samples_in_band: (QualityBand::Mid, 0),
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// The instant the most recently sent ping went out, if one is still
    /// awaiting its pong. `None` once a pong (or any other activity) has
    /// cleared it.
    pub fn last_ping_sent_at(&self) -> Option<Instant> {
        self.last_ping_sent_at
    }

    /// Activity (any inbound or outbound byte, or a pong) resets state to
    /// Healthy, clears the missed-pong counter, and clears any outstanding
    /// ping deadline ("Any -> Healthy").
    pub fn record_activity(&mut self) {
        self.state = HealthState::Healthy;
        self.consecutive_missed_pongs = 0;
        self.last_ping_sent_at = None;
    }

    pub fn record_ping_sent(&mut self, at: Instant) {
        self.last_ping_sent_at = Some(at);
    }

    /// A ping went unanswered; advances the state machine per the table:
    /// one miss -> Degraded from Healthy, three consecutive -> Unhealthy.
    pub fn record_missed_pong(&mut self) {
        self.consecutive_missed_pongs += 1;
        self.last_ping_sent_at = None;
        self.state = match (self.state, self.consecutive_missed_pongs) {
            (_, n) if n >= 3 => HealthState::Unhealthy,
            (HealthState::Healthy, _) => HealthState::Degraded,
            (other, _) => other,
        };
    }

    /// True once idle time exceeds `loadBalancerTimeout - 5s`.
    pub fn note_idle(&mut self, idle: Duration, load_balancer_timeout: Duration) {
        if self.state == HealthState::Healthy
            && load_balancer_timeout > Duration::from_secs(5)
            && idle > load_balancer_timeout - Duration::from_secs(5)
        {
            self.state = HealthState::AtRisk;
        }
    }

    /// Whether a ping should fire now, given idle time since last activity.
    /// A ping is only emitted once the connection has been idle for
    /// `maxIdleTime`.
    pub fn should_ping(&self, idle: Duration, max_idle_time: Duration) -> bool {
        idle >= max_idle_time
    }

    /// Apply the adaptive-interval policy given the latest quality score,
    /// with 3-sample hysteresis before a band change takes effect.
    pub fn adapt_interval(&mut self, quality_score: f32) {
        if !self.adaptive_enabled {
            return;
        }
        let band = if quality_score >= 0.8 {
            QualityBand::High
        } else if quality_score < 0.5 {
            QualityBand::Low
        } else {
            QualityBand::Mid
        };

        if band == self.consecutive_samples_in_band.0 {
            self.consecutive_samples_in_band.1 =
                self.consecutive_samples_in_band.1.saturating_add(1);
        } else {
            self.consecutive_samples_in_band = (band, 1);
        }

        if self.consecutive_samples_in_band.1 < 3 {
            return;
        }

        match band {
            QualityBand::High => {
                self.current_interval =
                    (self.current_interval * 2).min(self.max_interval);
            }
            QualityBand::Low => {
                self.current_interval =
                    (self.current_interval / 2).max(self.min_interval);
            }
            QualityBand::Mid => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> KeepAlive {
        KeepAlive::new(
            Duration::from_secs(2),
            Duration::from_secs(1),
            Duration::from_secs(10),
            true,
            0.7,
        )
    }

    #[test]
    fn starts_healthy() {
        assert_eq!(engine().state(), HealthState::Healthy);
    }

    #[test]
    fn one_missed_pong_degrades_from_healthy() {
        let mut ka = engine();
        ka.record_missed_pong();
        assert_eq!(ka.state(), HealthState::Degraded);
    }

    #[test]
    fn three_consecutive_missed_pongs_reach_unhealthy() {
        let mut ka = engine();
        ka.record_missed_pong();
        ka.record_missed_pong();
        ka.record_missed_pong();
        assert_eq!(ka.state(), HealthState::Unhealthy);
    }

    #[test]
    fn activity_recovers_to_healthy_from_any_state() {
        let mut ka = engine();
        ka.record_missed_pong();
        ka.record_missed_pong();
        ka.record_missed_pong();
        assert_eq!(ka.state(), HealthState::Unhealthy);
        ka.record_activity();
        assert_eq!(ka.state(), HealthState::Healthy);
    }

    #[test]
    fn ping_only_fires_after_max_idle_time() {
        let ka = engine();
        assert!(!ka.should_ping(Duration::from_secs(1), Duration::from_secs(55)));
        assert!(ka.should_ping(Duration::from_secs(55), Duration::from_secs(55)));
    }

    #[test]
    fn adaptive_interval_widens_after_three_high_quality_samples() {
        let mut ka = engine();
        ka.adapt_interval(0.9);
        ka.adapt_interval(0.9);
        assert_eq!(ka.current_interval(), Duration::from_secs(2));
        ka.adapt_interval(0.9);
        assert_eq!(ka.current_interval(), Duration::from_secs(4));
    }

    #[test]
    fn adaptive_interval_narrows_after_three_low_quality_samples_and_is_capped() {
        let mut ka = engine();
        for _ in 0..3 {
            ka.adapt_interval(0.3);
        }
        assert_eq!(ka.current_interval(), Duration::from_secs(1));
        for _ in 0..3 {
            ka.adapt_interval(0.3);
        }
        assert_eq!(ka.current_interval(), Duration::from_secs(1), "clamped to min");
    }

    #[test]
    fn single_sample_in_a_new_band_does_not_change_interval_yet() {
        let mut ka = engine();
        ka.adapt_interval(0.3);
        assert_eq!(ka.current_interval(), Duration::from_secs(2));
    }
}
