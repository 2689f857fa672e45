//! Quality Meter (C5): sliding RTT/jitter/loss accounting and the composite
//! quality score consumed only by the Keep-Alive Engine (C4).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const RTT_PENALTY_COEFFICIENT: f32 = 1.0 / 500.0; // ms -> penalty
const JITTER_PENALTY_COEFFICIENT: f32 = 1.0 / 200.0; // ms -> penalty
const LOSS_PENALTY_COEFFICIENT: f32 = 1.0; // loss ratio -> penalty, 1:1
const RTT_EMA_ALPHA: f32 = 0.2;

/// Per-session quality accounting: a ring of the last `K` RTT samples plus
/// derived EMA latency, jitter, and a missed-ping/pong loss ratio.
#[derive(Debug, Clone)]
pub struct QualityMeter {
    window_size: usize,
    samples_ms: VecDeque<f32>,
    ema_rtt_ms: Option<f32>,
    pending_ping_sent_at: Option<Instant>,
    pings_sent: u32,
    pongs_received: u32,
    score: f32,
}

impl QualityMeter {
    pub fn new(window_size: usize) -> Self {
        QualityMeter {
            window_size: window_size.max(1),
            samples_ms: VecDeque::new(),
            ema_rtt_ms: None,
            pending_ping_sent_at: None,
            pings_sent: 0,
            pongs_received: 0,
            score: 1.0,
        }
    }

    pub fn record_ping_sent(&mut self, at: Instant) {
        self.pending_ping_sent_at = Some(at);
        self.pings_sent += 1;
    }

    /// Record a pong; recomputes RTT EMA, jitter, loss ratio, and score.
    /// Returns the sample RTT if a matching ping was outstanding.
    pub fn record_pong_received(&mut self, at: Instant) -> Option<Duration> {
        let sent_at = self.pending_ping_sent_at.take()?;
        let rtt = at.saturating_duration_since(sent_at);
        let rtt_ms = rtt.as_secs_f32() * 1000.0;
        self.pongs_received += 1;

        self.samples_ms.push_back(rtt_ms);
        while self.samples_ms.len() > self.window_size {
            self.samples_ms.pop_front();
        }

        self.ema_rtt_ms = Some(match self.ema_rtt_ms {
            Some(prev) => RTT_EMA_ALPHA * rtt_ms + (1.0 - RTT_EMA_ALPHA) * prev,
            None => rtt_ms,
        });

        self.recompute_score();
        Some(rtt)
    }

    /// Record a ping that never received a pong within its deadline; slides
    /// the loss ratio without contributing an RTT sample.
    pub fn record_missed_ping(&mut self) {
        self.pending_ping_sent_at = None;
        self.recompute_score();
    }

    fn jitter_ms(&self) -> f32 {
        if self.samples_ms.len() < 2 {
            return 0.0;
        }
        let mean: f32 = self.samples_ms.iter().sum::<f32>() / self.samples_ms.len() as f32;
        self.samples_ms.iter().map(|s| (s - mean).abs()).sum::<f32>() / self.samples_ms.len() as f32
    }

    fn loss_ratio(&self) -> f32 {
        if self.pings_sent == 0 {
            return 0.0;
        }
        let missed = self.pings_sent.saturating_sub(self.pongs_received);
        missed as f32 / self.pings_sent as f32
    }

    fn recompute_score(&mut self) {
        let rtt_penalty = self.ema_rtt_ms.unwrap_or(0.0) * RTT_PENALTY_COEFFICIENT;
        let jitter_penalty = self.jitter_ms() * JITTER_PENALTY_COEFFICIENT;
        let loss_penalty = self.loss_ratio() * LOSS_PENALTY_COEFFICIENT;
        self.score = (1.0 - rtt_penalty - jitter_penalty - loss_penalty).clamp(0.0, 1.0);
    }

    /// Composite score in `[0, 1]`; higher is better.
    pub fn score(&self) -> f32 {
        self.score
    }

    pub fn ema_rtt(&self) -> Option<Duration> {
        self.ema_rtt_ms.map(|ms| Duration::from_secs_f32(ms / 1000.0))
    }
}
