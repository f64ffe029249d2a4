use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::RateConfig;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

/// One fixed window: a counter that resets lazily once its length has elapsed
#[derive(Debug, Clone)]
struct Window {
    length: Duration,
    ceiling: u32,
    count: u32,
    started: Instant,
}

impl Window {
    fn new(length: Duration, ceiling: u32, now: Instant) -> Self {
        Self {
            length,
            ceiling,
            count: 0,
            started: now,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.started) >= self.length {
            self.count = 0;
            self.started = now;
        }
    }

    fn has_capacity(&self) -> bool {
        self.count < self.ceiling
    }
}

/// Count/ceiling pair for status reporting
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WindowUsage {
    pub count: u32,
    pub ceiling: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateUsage {
    pub minute: WindowUsage,
    pub hour: WindowUsage,
    pub day: WindowUsage,
}

/// Minute/hour/day send quotas
#[derive(Debug, Clone)]
pub struct RateGate {
    minute: Window,
    hour: Window,
    day: Window,
}

impl RateGate {
    pub fn new(config: &RateConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    fn new_at(config: &RateConfig, now: Instant) -> Self {
        Self {
            minute: Window::new(MINUTE, config.per_minute, now),
            hour: Window::new(HOUR, config.per_hour, now),
            day: Window::new(DAY, config.per_day, now),
        }
    }

    /// True only if every window is strictly below its ceiling
    pub fn admit(&mut self) -> bool {
        self.admit_at(Instant::now())
    }

    pub fn admit_at(&mut self, now: Instant) -> bool {
        self.roll(now);
        self.minute.has_capacity() && self.hour.has_capacity() && self.day.has_capacity()
    }

    /// Count one attempted send against every window
    pub fn record_send(&mut self) {
        self.record_send_at(Instant::now());
    }

    pub fn record_send_at(&mut self, now: Instant) {
        self.roll(now);
        self.minute.count += 1;
        self.hour.count += 1;
        self.day.count += 1;
    }

    pub fn usage(&mut self) -> RateUsage {
        self.roll(Instant::now());
        let usage = |w: &Window| WindowUsage {
            count: w.count,
            ceiling: w.ceiling,
        };
        RateUsage {
            minute: usage(&self.minute),
            hour: usage(&self.hour),
            day: usage(&self.day),
        }
    }

    fn roll(&mut self, now: Instant) {
        self.minute.roll(now);
        self.hour.roll(now);
        self.day.roll(now);
    }
}
