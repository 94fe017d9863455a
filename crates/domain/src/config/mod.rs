mod fabric;
mod server;
mod tools;

pub use fabric::*;
pub use server::*;
pub use tools::*;

use std::fmt;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub fabric: FabricConfig,
    #[serde(default)]
    pub tools: ToolPolicyConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        // Server port must be non-zero.
        if self.server.port == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }

        // Server host must not be empty.
        if self.server.host.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }

        // Accumulation window must be ordered and non-degenerate.
        let acc = &self.fabric.accumulation;
        if acc.min_wait_ms == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "fabric.accumulation.min_wait_ms".into(),
                message: "min_wait_ms must be greater than 0".into(),
            });
        }
        if acc.min_wait_ms > acc.max_wait_ms {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "fabric.accumulation.max_wait_ms".into(),
                message: format!(
                    "max_wait_ms ({}) must be >= min_wait_ms ({})",
                    acc.max_wait_ms, acc.min_wait_ms
                ),
            });
        }

        // Mutex lock timeout must be non-zero.
        if self.fabric.mutex.lock_timeout_secs == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "fabric.mutex.lock_timeout_secs".into(),
                message: "lock_timeout_secs must be greater than 0".into(),
            });
        }

        // Index TTL must cover a full lock lifetime, otherwise a live
        // workflow could vanish from the index while still holding the
        // mutex and a second workflow would block against it.
        if self.fabric.index.ttl_secs < self.fabric.mutex.lock_timeout_secs {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "fabric.index.ttl_secs".into(),
                message: format!(
                    "index ttl ({}) is shorter than mutex lock_timeout ({})",
                    self.fabric.index.ttl_secs, self.fabric.mutex.lock_timeout_secs
                ),
            });
        }

        // Rate-limit window and tier limits must be non-zero.
        let rl = &self.fabric.rate_limit;
        if rl.window_seconds == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "fabric.rate_limit.window_seconds".into(),
                message: "window_seconds must be greater than 0".into(),
            });
        }
        for (field, limit) in [
            ("free", rl.free_limit),
            ("pro", rl.pro_limit),
            ("enterprise", rl.enterprise_limit),
        ] {
            if limit == 0 {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("fabric.rate_limit.{field}_limit"),
                    message: "tier limit must be greater than 0".into(),
                });
            }
        }

        // HTTP rate limit: if set, both values must be > 0.
        if let Some(rl) = &self.server.rate_limit {
            if rl.requests_per_second == 0 {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "server.rate_limit.requests_per_second".into(),
                    message: "requests_per_second must be greater than 0".into(),
                });
            }
            if rl.burst_size == 0 {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "server.rate_limit.burst_size".into(),
                    message: "burst_size must be greater than 0".into(),
                });
            }
        }

        // CORS: warn if wildcard is used.
        if self.server.cors.allowed_origins.len() == 1
            && self.server.cors.allowed_origins[0] == "*"
        {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "server.cors.allowed_origins".into(),
                message: "wildcard \"*\" allows all origins (not recommended for production)"
                    .into(),
            });
        }

        errors
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
