//! Hourly attempt budget and global cooldown

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Attempts counted per clock hour
#[derive(Debug, Clone)]
pub struct HourlyBudget {
    hour: i64,
    used: u32,
    limit: u32,
}

impl HourlyBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            hour: i64::MIN,
            used: 0,
            limit,
        }
    }

    fn hour_of(at: DateTime<Utc>) -> i64 {
        at.timestamp().div_euclid(3_600)
    }

    /// Reset the counter when the clock entered a new hour
    pub fn roll(&mut self, now: DateTime<Utc>) {
        let hour = Self::hour_of(now);
        if hour != self.hour {
            self.hour = hour;
            self.used = 0;
        }
    }

    /// Attempts counted in the current hour
    pub fn used(&mut self, now: DateTime<Utc>) -> u32 {
        self.roll(now);
        self.used
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Whether no further admissions fit in this hour
    pub fn exhausted(&mut self, now: DateTime<Utc>) -> bool {
        self.used(now) >= self.limit
    }

    /// Count one attempt; true when the count now exceeds the limit
    pub fn record(&mut self, now: DateTime<Utc>) -> bool {
        self.roll(now);
        self.used = self.used.saturating_add(1);
        self.used > self.limit
    }
}

/// Global admission cooldown (circuit breaker)
#[derive(Debug, Clone, Default)]
pub struct Cooldown {
    until: Option<DateTime<Utc>>,
}

impl Cooldown {
    /// Whether admissions are suspended at `now`
    pub fn active_at(&self, now: DateTime<Utc>) -> bool {
        self.until.is_some_and(|until| now < until)
    }

    /// Suspend admissions for `duration` from `now`; an active cooldown is extended, never shortened
    pub fn trigger(&mut self, now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
        let candidate =
            now + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        let until = match self.until {
            Some(current) if current > candidate => current,
            _ => candidate,
        };
        self.until = Some(until);
        until
    }

    /// Lift the cooldown; true when it was still in force
    pub fn clear(&mut self, now: DateTime<Utc>) -> bool {
        let was_active = self.active_at(now);
        self.until = None;
        was_active
    }

    pub fn until(&self) -> Option<DateTime<Utc>> {
        self.until
    }

    pub fn status(&self, now: DateTime<Utc>) -> CooldownStatus {
        let active = self.active_at(now);
        CooldownStatus {
            active,
            until: if active { self.until } else { None },
        }
    }
}

/// Cooldown as reported in statistics
#[derive(Debug, Clone, Serialize)]
pub struct CooldownStatus {
    pub active: bool,
    pub until: Option<DateTime<Utc>>,
}
