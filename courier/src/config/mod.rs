//! Runtime configuration.
//!
//! Every option has a default and a `COURIER_*` environment variable. A `.env`
//! file in the working directory is loaded first when present.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::notification::channels::{EmailSettings, LaneOptions, PushSettings};
use crate::queue::ProcessorConfig;
use crate::rate_limit::RateLimitConfig;
use crate::{Error, Result};

const ENV_PREFIX: &str = "COURIER_";

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Directory for daily log files. Console only when unset.
    pub log_dir: Option<String>,
    /// Filter directive used when `RUST_LOG` is not set.
    pub filter: Option<String>,
    /// Rolled log files older than this are deleted.
    pub retention_days: u32,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_dir: None,
            filter: None,
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Workers per channel lane.
    pub max_workers: usize,
    pub max_retries: u32,
    /// Base of the linear retry backoff.
    pub retry_delay_base_seconds: u64,
    pub rate_limit_per_minute: u32,
    pub rate_limit_per_hour: u32,
    pub min_delay_between_sends_seconds: u64,
    /// How long a dispatch waits for each channel.
    pub dispatch_completion_timeout_seconds: u64,
    pub max_notifications_per_recipient_per_hour: u32,

    pub poll_interval_ms: u64,
    pub delivery_timeout_seconds: u64,
    pub shutdown_timeout_seconds: u64,
    pub dead_letter_capacity: usize,
    /// Dispatch records older than this are dropped by maintenance.
    pub dispatch_retention_hours: u64,
    pub maintenance_interval_seconds: u64,
    /// Periodic dead-letter requeue. Disabled when unset.
    pub dead_letter_requeue_interval_seconds: Option<u64>,

    pub email: EmailSettings,
    pub push: PushSettings,
    pub logging: LoggingSettings,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            max_retries: 3,
            retry_delay_base_seconds: 60,
            rate_limit_per_minute: 60,
            rate_limit_per_hour: 1000,
            min_delay_between_sends_seconds: 0,
            dispatch_completion_timeout_seconds: 30,
            max_notifications_per_recipient_per_hour: 100,
            poll_interval_ms: 1000,
            delivery_timeout_seconds: 60,
            shutdown_timeout_seconds: 5,
            dead_letter_capacity: 1000,
            dispatch_retention_hours: 24,
            maintenance_interval_seconds: 3600,
            dead_letter_requeue_interval_seconds: None,
            email: EmailSettings::default(),
            push: PushSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl CourierConfig {
    /// Load from the process environment (and `.env`), then validate.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source, then validate.
    ///
    /// `lookup` receives the full variable name, e.g. `COURIER_MAX_WORKERS`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = EnvVars { lookup };
        let mut config = Self::default();

        vars.parse("MAX_WORKERS", &mut config.max_workers)?;
        vars.parse("MAX_RETRIES", &mut config.max_retries)?;
        vars.parse("RETRY_DELAY_BASE_SECONDS", &mut config.retry_delay_base_seconds)?;
        vars.parse("RATE_LIMIT_PER_MINUTE", &mut config.rate_limit_per_minute)?;
        vars.parse("RATE_LIMIT_PER_HOUR", &mut config.rate_limit_per_hour)?;
        vars.parse(
            "MIN_DELAY_BETWEEN_SENDS_SECONDS",
            &mut config.min_delay_between_sends_seconds,
        )?;
        vars.parse(
            "DISPATCH_COMPLETION_TIMEOUT_SECONDS",
            &mut config.dispatch_completion_timeout_seconds,
        )?;
        vars.parse(
            "MAX_NOTIFICATIONS_PER_RECIPIENT_PER_HOUR",
            &mut config.max_notifications_per_recipient_per_hour,
        )?;
        vars.parse("POLL_INTERVAL_MS", &mut config.poll_interval_ms)?;
        vars.parse("DELIVERY_TIMEOUT_SECONDS", &mut config.delivery_timeout_seconds)?;
        vars.parse("SHUTDOWN_TIMEOUT_SECONDS", &mut config.shutdown_timeout_seconds)?;
        vars.parse("DEAD_LETTER_CAPACITY", &mut config.dead_letter_capacity)?;
        vars.parse("DISPATCH_RETENTION_HOURS", &mut config.dispatch_retention_hours)?;
        vars.parse(
            "MAINTENANCE_INTERVAL_SECONDS",
            &mut config.maintenance_interval_seconds,
        )?;
        config.dead_letter_requeue_interval_seconds =
            vars.parse_opt("DEAD_LETTER_REQUEUE_INTERVAL_SECONDS")?;

        let email = &mut config.email;
        vars.string("EMAIL_API_URL", &mut email.api_url);
        email.api_key = vars.get("EMAIL_API_KEY");
        vars.string("EMAIL_SENDER_EMAIL", &mut email.sender_email);
        vars.string("EMAIL_SENDER_NAME", &mut email.sender_name);
        vars.parse("EMAIL_MAX_SUBJECT_LENGTH", &mut email.max_subject_length)?;
        vars.parse("EMAIL_MAX_BODY_LENGTH", &mut email.max_body_length)?;
        if let Some(domains) = vars.get("EMAIL_BLOCKED_DOMAINS") {
            email.blocked_domains = domains
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect();
        }

        config.push.gateway_url = vars.get("PUSH_GATEWAY_URL");
        config.push.auth_token = vars.get("PUSH_AUTH_TOKEN");

        config.logging.log_dir = vars.get("LOG_DIR");
        config.logging.filter = vars.get("LOG_FILTER");
        vars.parse("LOG_RETENTION_DAYS", &mut config.logging.retention_days)?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::config("max_workers must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::config("poll_interval_ms must be greater than 0"));
        }
        if self.delivery_timeout_seconds == 0 {
            return Err(Error::config("delivery_timeout_seconds must be greater than 0"));
        }
        if self.dispatch_completion_timeout_seconds == 0 {
            return Err(Error::config(
                "dispatch_completion_timeout_seconds must be greater than 0",
            ));
        }
        if self.maintenance_interval_seconds == 0 {
            return Err(Error::config("maintenance_interval_seconds must be greater than 0"));
        }
        if self.dead_letter_requeue_interval_seconds == Some(0) {
            return Err(Error::config(
                "dead_letter_requeue_interval_seconds must be greater than 0 when set",
            ));
        }
        if self.rate_limit_per_minute > 0
            && self.rate_limit_per_hour > 0
            && self.rate_limit_per_minute > self.rate_limit_per_hour
        {
            return Err(Error::config(format!(
                "rate_limit_per_minute ({}) exceeds rate_limit_per_hour ({})",
                self.rate_limit_per_minute, self.rate_limit_per_hour
            )));
        }
        Ok(())
    }

    /// Limits applied to the email lane.
    pub fn email_rate_limits(&self) -> RateLimitConfig {
        RateLimitConfig {
            per_minute: self.rate_limit_per_minute,
            per_hour: self.rate_limit_per_hour,
            min_delay: Duration::from_secs(self.min_delay_between_sends_seconds),
        }
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            max_workers: self.max_workers,
            poll_interval_ms: self.poll_interval_ms,
            delivery_timeout_secs: self.delivery_timeout_seconds,
            shutdown_timeout_secs: self.shutdown_timeout_seconds,
        }
    }

    pub fn lane_options(&self) -> LaneOptions {
        LaneOptions {
            processor: self.processor_config(),
            max_retries: self.max_retries,
            retry_delay_base: Duration::from_secs(self.retry_delay_base_seconds),
        }
    }

    pub fn dispatch_completion_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_completion_timeout_seconds)
    }

    pub fn dispatch_retention(&self) -> Duration {
        Duration::from_secs(self.dispatch_retention_hours * 3600)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

struct EnvVars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvVars<F> {
    /// Non-blank value of `COURIER_<key>`.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", ENV_PREFIX, key))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, target: &mut String) {
        if let Some(value) = self.get(key) {
            *target = value;
        }
    }

    fn parse<T: FromStr>(&self, key: &str, target: &mut T) -> Result<()> {
        if let Some(value) = self.parse_opt(key)? {
            *target = value;
        }
        Ok(())
    }

    fn parse_opt<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)
            .map(|value| {
                value.parse().map_err(|_| {
                    Error::config(format!("{}{} has invalid value '{}'", ENV_PREFIX, key, value))
                })
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<CourierConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CourierConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay_base_seconds, 60);
        assert_eq!(config.rate_limit_per_minute, 60);
        assert_eq!(config.rate_limit_per_hour, 1000);
        assert_eq!(config.min_delay_between_sends_seconds, 0);
        assert_eq!(config.dispatch_completion_timeout_seconds, 30);
        assert_eq!(config.max_notifications_per_recipient_per_hour, 100);
        assert!(config.dead_letter_requeue_interval_seconds.is_none());
        assert!(config.email.api_key.is_none());
        assert!(config.push.gateway_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("COURIER_MAX_WORKERS", "8"),
            ("COURIER_RATE_LIMIT_PER_MINUTE", "0"),
            ("COURIER_MIN_DELAY_BETWEEN_SENDS_SECONDS", "2"),
            ("COURIER_DEAD_LETTER_REQUEUE_INTERVAL_SECONDS", "600"),
            ("COURIER_EMAIL_API_KEY", "SG.key"),
            ("COURIER_EMAIL_BLOCKED_DOMAINS", "spam.test, , Junk.test"),
            ("COURIER_PUSH_GATEWAY_URL", "http://gateway.local/push"),
            ("COURIER_LOG_FILTER", "  "),
        ])
        .unwrap();

        assert_eq!(config.processor_config().max_workers, 8);
        let limits = config.email_rate_limits();
        assert_eq!(limits.per_minute, 0);
        assert_eq!(limits.min_delay, Duration::from_secs(2));
        assert_eq!(config.dead_letter_requeue_interval_seconds, Some(600));
        assert_eq!(config.email.api_key.as_deref(), Some("SG.key"));
        assert_eq!(config.email.blocked_domains, vec!["spam.test", "Junk.test"]);
        assert_eq!(config.push.gateway_url.as_deref(), Some("http://gateway.local/push"));
        assert!(config.logging.filter.is_none());
    }

    #[test]
    fn test_invalid_number() {
        let err = load(&[("COURIER_MAX_RETRIES", "lots")]).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("COURIER_MAX_RETRIES"));
    }

    #[test]
    fn test_validate() {
        assert!(load(&[("COURIER_MAX_WORKERS", "0")]).is_err());
        assert!(load(&[("COURIER_DELIVERY_TIMEOUT_SECONDS", "0")]).is_err());
        assert!(load(&[("COURIER_DISPATCH_COMPLETION_TIMEOUT_SECONDS", "0")]).is_err());
        assert!(load(&[("COURIER_DEAD_LETTER_REQUEUE_INTERVAL_SECONDS", "0")]).is_err());
        assert!(
            load(&[
                ("COURIER_RATE_LIMIT_PER_MINUTE", "500"),
                ("COURIER_RATE_LIMIT_PER_HOUR", "100"),
            ])
            .is_err()
        );
        // A disabled hourly cap does not conflict with the minute cap.
        assert!(
            load(&[
                ("COURIER_RATE_LIMIT_PER_MINUTE", "500"),
                ("COURIER_RATE_LIMIT_PER_HOUR", "0"),
            ])
            .is_ok()
        );
    }

    #[test]
    fn test_lane_options() {
        let config = load(&[("COURIER_RETRY_DELAY_BASE_SECONDS", "30")]).unwrap();
        let lane = config.lane_options();
        assert_eq!(lane.retry_delay_base, Duration::from_secs(30));
        assert_eq!(lane.max_retries, 3);
        assert_eq!(config.dispatch_retention(), Duration::from_secs(24 * 3600));
    }
}
