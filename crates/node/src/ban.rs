//! Per-peer misbehavior scoring.

use std::time::Instant;

/// Half-life of the transient score component.
const DECAY_HALF_LIFE_SECS: f64 = 60.0;

/// Two-part misbehavior score: a persistent component that never decays and
/// a transient component that halves every minute. Callers pick which knob
/// to turn based on the kind of misbehavior.
#[derive(Debug)]
pub struct DynamicBanScore {
    persistent: u32,
    transient: f64,
    last_update: Option<Instant>,
}

impl Default for DynamicBanScore {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicBanScore {
    pub fn new() -> Self {
        Self {
            persistent: 0,
            transient: 0.0,
            last_update: None,
        }
    }

    /// Combined score at `now` without mutating the accumulators.
    pub fn int(&self, now: Instant) -> u32 {
        self.persistent.saturating_add(self.decayed_transient(now) as u32)
    }

    /// Raises the accumulators and returns the combined score at `now`.
    pub fn increase(&mut self, persistent: u32, transient: u32, now: Instant) -> u32 {
        self.persistent = self.persistent.saturating_add(persistent);
        if transient > 0 {
            self.transient = self.decayed_transient(now) + transient as f64;
            self.last_update = Some(now);
        }
        self.int(now)
    }

    pub fn reset(&mut self) {
        self.persistent = 0;
        self.transient = 0.0;
        self.last_update = None;
    }

    fn decayed_transient(&self, now: Instant) -> f64 {
        let Some(last) = self.last_update else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(last).as_secs_f64();
        self.transient * 0.5f64.powf(elapsed / DECAY_HALF_LIFE_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn persistent_score_never_decays() {
        let start = Instant::now();
        let mut score = DynamicBanScore::new();
        score.increase(30, 0, start);
        assert_eq!(score.int(start + Duration::from_secs(3600)), 30);
    }

    #[test]
    fn transient_score_halves_each_minute() {
        let start = Instant::now();
        let mut score = DynamicBanScore::new();
        assert_eq!(score.increase(0, 40, start), 40);
        assert_eq!(score.int(start + Duration::from_secs(60)), 20);
        assert_eq!(score.int(start + Duration::from_secs(120)), 10);
    }

    #[test]
    fn increase_applies_decay_before_adding() {
        let start = Instant::now();
        let mut score = DynamicBanScore::new();
        score.increase(0, 40, start);
        let after = score.increase(0, 10, start + Duration::from_secs(60));
        assert_eq!(after, 30);
    }

    #[test]
    fn components_sum() {
        let start = Instant::now();
        let mut score = DynamicBanScore::new();
        score.increase(50, 25, start);
        assert_eq!(score.int(start), 75);
        score.reset();
        assert_eq!(score.int(start), 0);
    }
}
