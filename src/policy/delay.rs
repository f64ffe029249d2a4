use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::DelayConfig;

/// Randomised, risk-weighted pre-send delay.
///
/// The multiplier shrinks on success (never below the floor) and grows on
/// error. The controller never sleeps itself; callers wait out the returned
/// duration.
#[derive(Debug, Clone)]
pub struct AdaptiveDelayController {
    config: DelayConfig,
    multiplier: f64,
    last_send: Option<Instant>,
}

impl AdaptiveDelayController {
    pub fn new(config: DelayConfig) -> Self {
        let multiplier = 1.0_f64.max(config.multiplier_floor);
        Self {
            config,
            multiplier,
            last_send: None,
        }
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn next_delay(&self) -> Duration {
        self.next_delay_at(Instant::now(), &mut rand::rng())
    }

    pub fn next_delay_at<R: Rng + ?Sized>(&self, now: Instant, rng: &mut R) -> Duration {
        let base = if self.config.max_secs > self.config.min_secs {
            rng.random_range(self.config.min_secs..=self.config.max_secs)
        } else {
            self.config.min_secs
        };

        let mut secs = base * self.multiplier;
        if self.in_burst(now) {
            secs += self.config.burst_penalty_secs;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    pub fn on_success(&mut self) {
        self.on_success_at(Instant::now());
    }

    pub fn on_success_at(&mut self, now: Instant) {
        self.multiplier = (self.multiplier * self.config.success_factor)
            .max(self.config.multiplier_floor);
        self.last_send = Some(now);
    }

    pub fn on_error(&mut self) {
        let grown = self.multiplier * self.config.error_factor;
        self.multiplier = match self.config.multiplier_ceiling {
            Some(ceiling) => grown.min(ceiling),
            None => grown,
        };
    }

    fn in_burst(&self, now: Instant) -> bool {
        let lookback = Duration::from_secs_f64(self.config.burst_lookback_secs.max(0.0));
        self.last_send
            .is_some_and(|last| now.saturating_duration_since(last) < lookback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> AdaptiveDelayController {
        AdaptiveDelayController::new(DelayConfig::default())
    }

    #[test]
    fn test_initial_delay_within_range() {
        let c = controller();
        let now = Instant::now();
        let mut rng = rand::rng();
        for _ in 0..200 {
            let d = c.next_delay_at(now, &mut rng).as_secs_f64();
            assert!((5.0..=20.0).contains(&d), "delay {} out of range", d);
        }
    }

    #[test]
    fn test_success_decays_to_floor() {
        let mut c = controller();
        let mut previous = c.multiplier();
        for _ in 0..100 {
            c.on_success();
            assert!(c.multiplier() <= previous);
            assert!(c.multiplier() >= 0.5);
            previous = c.multiplier();
        }
        assert_eq!(c.multiplier(), 0.5);
    }

    #[test]
    fn test_error_grows_without_bound() {
        let mut c = controller();
        let mut previous = c.multiplier();
        for _ in 0..20 {
            c.on_error();
            assert!(c.multiplier() >= previous);
            previous = c.multiplier();
        }
        assert_eq!(c.multiplier(), 2f64.powi(20));
    }

    #[test]
    fn test_optional_ceiling_caps_growth() {
        let mut c = AdaptiveDelayController::new(DelayConfig {
            multiplier_ceiling: Some(8.0),
            ..DelayConfig::default()
        });
        for _ in 0..10 {
            c.on_error();
        }
        assert_eq!(c.multiplier(), 8.0);
    }

    #[test]
    fn test_burst_penalty_applies_within_lookback() {
        let mut c = AdaptiveDelayController::new(DelayConfig {
            min_secs: 10.0,
            max_secs: 10.0,
            success_factor: 1.0,
            ..DelayConfig::default()
        });
        let sent = Instant::now();
        c.on_success_at(sent);
        let mut rng = rand::rng();

        let soon = c.next_delay_at(sent + Duration::from_secs(3), &mut rng);
        assert_eq!(soon, Duration::from_secs(55));

        let later = c.next_delay_at(sent + Duration::from_secs(10), &mut rng);
        assert_eq!(later, Duration::from_secs(10));
    }

    #[test]
    fn test_multiplier_scales_delay() {
        let mut c = AdaptiveDelayController::new(DelayConfig {
            min_secs: 4.0,
            max_secs: 4.0,
            ..DelayConfig::default()
        });
        c.on_error();
        let d = c.next_delay_at(Instant::now(), &mut rand::rng());
        assert_eq!(d, Duration::from_secs(8));
    }
}
