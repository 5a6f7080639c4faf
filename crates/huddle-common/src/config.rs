//! Runtime configuration for calls and theater sessions.
//!
//! Every value has a default and can be overridden through `HUDDLE_*`
//! environment variables. Malformed values fall back to the default.

use std::time::Duration;

const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

fn lookup_secs<F>(lookup: &F, name: &str, default: u64, min: u64) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_secs(
        lookup(name)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(default)
            .max(min),
    )
}

fn lookup_millis<F>(lookup: &F, name: &str, default: u64, min: u64) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_millis(
        lookup(name)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(default)
            .max(min),
    )
}

fn lookup_f64<F>(lookup: &F, name: &str, default: f64) -> f64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(default)
}

fn lookup_usize<F>(lookup: &F, name: &str, default: usize) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Call lifecycle timing and peer link settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CallConfig {
    /// A call still ringing after this long is ended as missed.
    pub ring_timeout: Duration,
    /// Delay between a record reaching `ended` and its physical deletion.
    pub ended_grace: Duration,
    /// Local auto-dismiss of an unanswered incoming call notification.
    pub incoming_dismiss: Duration,
    /// ICE server URLs handed to the peer transport.
    pub ice_servers: Vec<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(60),
            ended_grace: Duration::from_secs(5),
            incoming_dismiss: Duration::from_secs(30),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

impl CallConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let ice_servers = lookup("HUDDLE_ICE_SERVERS")
            .map(|raw| {
                raw.split([',', ';'])
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|servers| !servers.is_empty())
            .unwrap_or(defaults.ice_servers);

        Self {
            ring_timeout: lookup_secs(&lookup, "HUDDLE_RING_TIMEOUT_SECS", 60, 5),
            ended_grace: lookup_millis(&lookup, "HUDDLE_ENDED_GRACE_MS", 5_000, 0),
            incoming_dismiss: lookup_secs(&lookup, "HUDDLE_INCOMING_DISMISS_SECS", 30, 1),
            ice_servers,
        }
    }
}

/// Watch-together limits and drift correction thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct TheaterConfig {
    pub max_queue: usize,
    pub ended_grace: Duration,
    /// Drift above this (seconds) is corrected with a direct seek.
    pub seek_threshold: f64,
    /// Drift above this (seconds) is corrected by biasing the playback rate.
    pub nudge_threshold: f64,
    /// Fractional rate change applied while nudging (0.05 = +/-5%).
    pub rate_bias: f64,
    pub nudge_duration: Duration,
    /// How often a viewer re-checks its position against the session.
    pub follow_interval: Duration,
}

impl Default for TheaterConfig {
    fn default() -> Self {
        Self {
            max_queue: 3,
            ended_grace: Duration::from_secs(5),
            seek_threshold: 2.0,
            nudge_threshold: 0.5,
            rate_bias: 0.05,
            nudge_duration: Duration::from_secs(1),
            follow_interval: Duration::from_millis(500),
        }
    }
}

impl TheaterConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let seek_threshold = lookup_f64(&lookup, "HUDDLE_SEEK_THRESHOLD_SECS", defaults.seek_threshold);
        let nudge_threshold = lookup_f64(
            &lookup,
            "HUDDLE_NUDGE_THRESHOLD_SECS",
            defaults.nudge_threshold,
        )
        .min(seek_threshold);

        Self {
            max_queue: lookup_usize(&lookup, "HUDDLE_THEATER_MAX_QUEUE", defaults.max_queue),
            ended_grace: lookup_millis(&lookup, "HUDDLE_ENDED_GRACE_MS", 5_000, 0),
            seek_threshold,
            nudge_threshold,
            rate_bias: lookup_f64(&lookup, "HUDDLE_RATE_BIAS", defaults.rate_bias).min(0.5),
            nudge_duration: lookup_millis(&lookup, "HUDDLE_NUDGE_MS", 1_000, 100),
            follow_interval: lookup_millis(&lookup, "HUDDLE_FOLLOW_INTERVAL_MS", 500, 50),
        }
    }
}
