//! Client-side daily quota estimate.
//!
//! A best-effort mirror of the server's per-day request counter, used to
//! refuse a send before any network call and to show remaining usage. The
//! server stays authoritative: a limit response forces the tracker to
//! exhausted regardless of the local count, and a fresh profile replaces the
//! estimate wholesale.
//!
//! Usage belongs to the local calendar day it was counted on. The first
//! check on a later day starts from zero, as does the first check after a
//! server-reported reset time has elapsed. Every clock-dependent method has
//! an `_at` variant taking the current time explicitly.

use chrono::{Local, NaiveDate, NaiveDateTime, TimeDelta};

use noor_core::config::QuotaConfig;
use noor_core::types::{QuotaState, UserProfile};

/// Allowance the service applies to accounts without a plan.
const DEFAULT_DAILY_LIMIT: i64 = 5;

/// A reset time reported by the server, anchored to when it arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ServerReset {
    text: String,
    /// `None` when `text` was not in `"<h>h <m>m"` form.
    deadline: Option<NaiveDateTime>,
}

/// Locally cached view of today's usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaTracker {
    /// Daily allowance; `<= 0` means unlimited.
    limit: i64,
    used_today: i64,
    /// Set when the server refused a request for quota reasons.
    exhausted: bool,
    /// Day `used_today` and `exhausted` refer to.
    as_of: NaiveDate,
    server_reset: Option<ServerReset>,
}

impl QuotaTracker {
    /// A tracker for today with `used_today` requests already consumed.
    pub fn new(limit: i64, used_today: i64) -> Self {
        Self::new_on(limit, used_today, now().date())
    }

    /// A tracker whose usage was counted on `as_of`.
    pub fn new_on(limit: i64, used_today: i64, as_of: NaiveDate) -> Self {
        Self {
            limit,
            used_today: used_today.max(0),
            exhausted: false,
            as_of,
            server_reset: None,
        }
    }

    /// A tracker that never refuses.
    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    /// Seed from the `[quota]` configuration section.
    pub fn from_config(config: &QuotaConfig) -> Self {
        Self::from_config_on(config, now().date())
    }

    /// Seed from the `[quota]` section as of `today`. A count recorded on
    /// another day is ignored.
    pub fn from_config_on(config: &QuotaConfig, today: NaiveDate) -> Self {
        let used = match config.last_request_date {
            Some(date) if date != today => 0,
            _ => config.used_today,
        };
        Self::new_on(config.daily_limit, used, today)
    }

    /// Seed from a cached user profile as of `today`.
    ///
    /// A profile whose last request was on another day counts as unused,
    /// matching the server's daily reset.
    pub fn from_profile(profile: &UserProfile, today: NaiveDate) -> Self {
        let (limit, used) = profile_usage(profile, today);
        Self::new_on(limit, used, today)
    }

    /// Whether a new request may be attempted.
    pub fn has_capacity(&mut self) -> bool {
        self.has_capacity_at(now())
    }

    pub fn has_capacity_at(&mut self, now: NaiveDateTime) -> bool {
        self.roll_over(now);
        self.within_limit()
    }

    /// Count a completed turn before the server confirms it.
    pub fn record_success(&mut self) {
        self.record_success_at(now())
    }

    pub fn record_success_at(&mut self, now: NaiveDateTime) {
        self.roll_over(now);
        self.used_today += 1;
        tracing::debug!(used_today = self.used_today, limit = self.limit, "Quota usage recorded");
    }

    /// Mark the quota exhausted because the server said so.
    ///
    /// A reset time of `None` keeps the previously reported one.
    pub fn force_exhausted(&mut self, reset_time: Option<String>) {
        self.force_exhausted_at(reset_time, now())
    }

    pub fn force_exhausted_at(&mut self, reset_time: Option<String>, now: NaiveDateTime) {
        self.roll_over(now);
        self.exhausted = true;
        if let Some(text) = reset_time {
            let deadline = parse_remaining(&text).map(|d| now + d);
            self.server_reset = Some(ServerReset { text, deadline });
        }
        if self.limit > 0 {
            self.used_today = self.used_today.max(self.limit);
        }
        tracing::info!(
            reset_time = ?self.server_reset.as_ref().map(|r| &r.text),
            "Quota forced to exhausted"
        );
    }

    /// Replace the local estimate with a server-confirmed profile.
    ///
    /// A profile showing remaining capacity lifts a previous forced
    /// exhaustion.
    pub fn reconcile(&mut self, profile: &UserProfile, today: NaiveDate) {
        let (limit, used) = profile_usage(profile, today);
        if today != self.as_of {
            self.exhausted = false;
            self.server_reset = None;
        }
        self.as_of = today;
        self.limit = limit;
        self.used_today = used.max(0);
        if self.limit <= 0 || self.used_today < self.limit {
            self.exhausted = false;
            self.server_reset = None;
        }
    }

    /// Time until the quota replenishes: what is left of the server's
    /// reported delay, otherwise the time until local midnight.
    pub fn reset_time(&self) -> String {
        self.reset_time_at(now())
    }

    pub fn reset_time_at(&self, now: NaiveDateTime) -> String {
        match &self.server_reset {
            Some(ServerReset {
                deadline: Some(deadline),
                ..
            }) if *deadline > now => format_remaining((*deadline - now).num_seconds()),
            Some(ServerReset {
                text,
                deadline: None,
            }) => text.clone(),
            _ => until_midnight(now),
        }
    }

    /// Snapshot for display.
    pub fn state(&mut self) -> QuotaState {
        self.state_at(now())
    }

    pub fn state_at(&mut self, now: NaiveDateTime) -> QuotaState {
        let reached = !self.has_capacity_at(now);
        QuotaState {
            limit: self.limit,
            used_today: self.used_today,
            reset_time: reached.then(|| self.reset_time_at(now)),
        }
    }

    fn within_limit(&self) -> bool {
        !self.exhausted && (self.limit <= 0 || self.used_today < self.limit)
    }

    /// Start a fresh count when the day changed or the server's reset
    /// time has passed.
    fn roll_over(&mut self, now: NaiveDateTime) {
        let today = now.date();
        let deadline_passed = self
            .server_reset
            .as_ref()
            .and_then(|r| r.deadline)
            .is_some_and(|deadline| now >= deadline);
        if today == self.as_of && !deadline_passed {
            return;
        }
        if self.used_today > 0 || self.exhausted {
            tracing::info!(
                previous_day = %self.as_of,
                used = self.used_today,
                "Daily quota replenished"
            );
        }
        self.used_today = 0;
        self.exhausted = false;
        self.server_reset = None;
        self.as_of = today;
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::from_config(&QuotaConfig::default())
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// A profile without a last request date counts its usage as today's.
fn profile_usage(profile: &UserProfile, today: NaiveDate) -> (i64, i64) {
    let limit = profile
        .subscription_plan
        .as_ref()
        .map_or(DEFAULT_DAILY_LIMIT, |p| p.daily_request_limit);
    let used = match profile.last_request_date {
        Some(date) if date != today => 0,
        _ => profile.requests_today,
    };
    (limit, used)
}

/// Parse a `"<h>h <m>m"` delay as reported by the server.
fn parse_remaining(text: &str) -> Option<TimeDelta> {
    let mut secs = 0i64;
    let mut parts = 0;
    for part in text.split_whitespace() {
        let (digits, unit) = if let Some(h) = part.strip_suffix('h') {
            (h, 3600)
        } else if let Some(m) = part.strip_suffix('m') {
            (m, 60)
        } else if let Some(s) = part.strip_suffix('s') {
            (s, 1)
        } else {
            return None;
        };
        secs += digits.parse::<i64>().ok()?.checked_mul(unit)?;
        parts += 1;
    }
    if parts == 0 {
        return None;
    }
    TimeDelta::try_seconds(secs)
}

/// Format a delay as `"<h>h <m>m"`. Partial minutes round up so the value
/// never reads `0h 0m` before the moment has passed.
fn format_remaining(secs: i64) -> String {
    let minutes = (secs.max(0) + 59) / 60;
    format!("{}h {}m", minutes / 60, minutes % 60)
}

/// Duration from `now` until the next midnight, formatted as `"<h>h <m>m"`.
fn until_midnight(now: NaiveDateTime) -> String {
    let next_midnight = now
        .date()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(now);
    format_remaining((next_midnight - now).num_seconds())
}
