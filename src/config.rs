//! Node configuration.

use std::fmt;
use std::time::Duration;

use crate::connection::{CLAIM_GRACE, CONNECT_TIMEOUT};
use crate::envelope::{DEFAULT_MAX_EXPIRATION_AHEAD_SECS, EnvelopeLimits};
use crate::messages::{DEFAULT_MESSAGE_TTL, MAX_BACK_PATH_LEN, MAX_ENVELOPE_SIZE, MAX_FORWARD_PATH_LEN};
use crate::routing::{DEFAULT_K, DEFAULT_SIBLINGS};

/// Tunables for one overlay node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    // ========================================================================
    // Routing Table
    // ========================================================================
    /// k-bucket capacity.
    pub k: usize,
    /// Sibling list capacity per side.
    pub siblings: usize,

    // ========================================================================
    // Connection Lifecycle
    // ========================================================================
    /// How long an unclaimed connection survives.
    pub claim_grace: Duration,
    /// A connection not open after this long is abandoned.
    pub connect_timeout: Duration,
    /// Bound on every transport description call.
    pub negotiation_timeout: Duration,

    // ========================================================================
    // Envelopes
    // ========================================================================
    /// Lifetime written into routable and forwardable bodies we originate.
    pub message_ttl: Duration,
    pub max_expiration_ahead: Duration,
    pub max_envelope_size: usize,
    pub max_back_path: usize,
    /// How long `lookup` waits for its result.
    pub request_timeout: Duration,

    // ========================================================================
    // Caches and Maintenance
    // ========================================================================
    pub path_cache_size: usize,
    /// Replay detection window, in processed envelopes.
    pub seen_cache_size: usize,
    pub bucket_refresh_interval: Duration,
    pub identity_sweep_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            siblings: DEFAULT_SIBLINGS,
            claim_grace: CLAIM_GRACE,
            connect_timeout: CONNECT_TIMEOUT,
            negotiation_timeout: Duration::from_secs(10),
            message_ttl: DEFAULT_MESSAGE_TTL,
            max_expiration_ahead: Duration::from_secs(DEFAULT_MAX_EXPIRATION_AHEAD_SECS),
            max_envelope_size: MAX_ENVELOPE_SIZE,
            max_back_path: MAX_BACK_PATH_LEN,
            request_timeout: Duration::from_secs(10),
            path_cache_size: 1024,
            seen_cache_size: 4096,
            bucket_refresh_interval: Duration::from_secs(60),
            identity_sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Zero(&'static str),
    /// The message TTL must not exceed what receivers accept.
    TtlBeyondHorizon,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Zero(field) => write!(f, "{field} must be non-zero"),
            ConfigError::TtlBeyondHorizon => {
                write!(f, "message_ttl exceeds max_expiration_ahead")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("k", self.k),
            ("siblings", self.siblings),
            ("max_envelope_size", self.max_envelope_size),
            ("max_back_path", self.max_back_path),
            ("path_cache_size", self.path_cache_size),
            ("seen_cache_size", self.seen_cache_size),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        let durations = [
            ("claim_grace", self.claim_grace),
            ("connect_timeout", self.connect_timeout),
            ("negotiation_timeout", self.negotiation_timeout),
            ("message_ttl", self.message_ttl),
            ("max_expiration_ahead", self.max_expiration_ahead),
            ("request_timeout", self.request_timeout),
            ("bucket_refresh_interval", self.bucket_refresh_interval),
            ("identity_sweep_interval", self.identity_sweep_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.message_ttl > self.max_expiration_ahead {
            return Err(ConfigError::TtlBeyondHorizon);
        }
        Ok(())
    }

    pub fn envelope_limits(&self) -> EnvelopeLimits {
        EnvelopeLimits {
            max_envelope_size: self.max_envelope_size,
            max_back_path: self.max_back_path,
            max_forward_path: MAX_FORWARD_PATH_LEN.min(self.max_back_path),
            max_expiration_ahead_secs: self.max_expiration_ahead.as_secs(),
        }
    }
}
