use std::time::Duration;

use serde::Deserialize;
use shared::domain::RequestStatus;
use tracing::warn;

/// Tunables for the coordination core. Values load from an optional
/// `linguet.toml` next to the binary and can be overridden one by one with
/// `APP__`-prefixed environment variables (`APP__REQUEST_TTL_MILLIS=60000`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Lifetime of a pending connection request before it reads as expired.
    pub request_ttl_millis: i64,
    /// An accepted request older than this is stale and must not open a
    /// session.
    pub accept_freshness_millis: i64,
    /// How long a cancelled request notice stays visible before dismissal.
    pub dismiss_cancelled_millis: u64,
    /// Dismissal delay for the other terminal statuses.
    pub dismiss_terminal_millis: u64,
    /// Slack when matching an end marker against the session start, covering
    /// clock skew between the two writers.
    pub session_end_tolerance_millis: i64,
    /// Minimum wall time a variant rotation appears to take, so back-to-back
    /// taps render as distinct phrasing changes.
    pub min_rotation_duration_millis: u64,
    /// How many recent messages a translation request may carry as context.
    pub context_depth: u32,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            request_ttl_millis: 5 * 60 * 1000,
            accept_freshness_millis: 30 * 1000,
            dismiss_cancelled_millis: 3000,
            dismiss_terminal_millis: 1500,
            session_end_tolerance_millis: 2000,
            min_rotation_duration_millis: 1000,
            context_depth: 25,
        }
    }
}

impl CoreSettings {
    pub fn load() -> Self {
        let mut settings = match std::fs::read_to_string("linguet.toml") {
            Ok(raw) => match toml::from_str(&raw) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(error = %err, "config: linguet.toml unreadable, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };
        settings.apply_env();
        settings
    }

    fn apply_env(&mut self) {
        overlay_i64("APP__REQUEST_TTL_MILLIS", &mut self.request_ttl_millis);
        overlay_i64(
            "APP__ACCEPT_FRESHNESS_MILLIS",
            &mut self.accept_freshness_millis,
        );
        overlay_u64(
            "APP__DISMISS_CANCELLED_MILLIS",
            &mut self.dismiss_cancelled_millis,
        );
        overlay_u64(
            "APP__DISMISS_TERMINAL_MILLIS",
            &mut self.dismiss_terminal_millis,
        );
        overlay_i64(
            "APP__SESSION_END_TOLERANCE_MILLIS",
            &mut self.session_end_tolerance_millis,
        );
        overlay_u64(
            "APP__MIN_ROTATION_DURATION_MILLIS",
            &mut self.min_rotation_duration_millis,
        );
        if let Some(depth) = read_env("APP__CONTEXT_DEPTH") {
            self.context_depth = depth;
        }
    }

    pub fn min_rotation_duration(&self) -> Duration {
        Duration::from_millis(self.min_rotation_duration_millis)
    }

    /// Delay before a terminal request notice auto-dismisses. Pending
    /// requests stay up until they resolve.
    pub fn dismiss_delay(&self, status: RequestStatus) -> Option<Duration> {
        match status {
            RequestStatus::Pending => None,
            RequestStatus::Cancelled => Some(Duration::from_millis(self.dismiss_cancelled_millis)),
            _ => Some(Duration::from_millis(self.dismiss_terminal_millis)),
        }
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, raw, "config: ignoring unparseable override");
            None
        }
    }
}

fn overlay_i64(key: &str, slot: &mut i64) {
    if let Some(value) = read_env(key) {
        *slot = value;
    }
}

fn overlay_u64(key: &str, slot: &mut u64) {
    if let Some(value) = read_env(key) {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = CoreSettings::default();
        assert_eq!(settings.request_ttl_millis, 300_000);
        assert_eq!(settings.accept_freshness_millis, 30_000);
        assert_eq!(settings.min_rotation_duration_millis, 1000);
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let settings: CoreSettings =
            toml::from_str("request_ttl_millis = 60000").expect("parse");
        assert_eq!(settings.request_ttl_millis, 60_000);
        assert_eq!(settings.context_depth, 25);
    }

    #[test]
    fn dismiss_delay_per_status() {
        let settings = CoreSettings::default();
        assert_eq!(settings.dismiss_delay(RequestStatus::Pending), None);
        assert_eq!(
            settings.dismiss_delay(RequestStatus::Cancelled),
            Some(Duration::from_millis(3000))
        );
        assert_eq!(
            settings.dismiss_delay(RequestStatus::Rejected),
            Some(Duration::from_millis(1500))
        );
    }
}
