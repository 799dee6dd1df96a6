//! Gateway configuration.
//!
//! Env-var overrides on top of defaults. The three network segments are
//! timed independently and deliberately not linked: the caller↔gateway
//! segment has no gateway-imposed timeout at all, the gateway↔backend
//! segment uses `request_timeout` (generation) and `metadata_timeout`
//! (model/tool listing), and the backend↔external segment governs itself —
//! including interactive authorization steps with their own expiry. A
//! segment timing out does not cancel the others.

use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
const DEFAULT_METADATA_TIMEOUT_SECS: u64 = 10;
const DEFAULT_FILTER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_AGENT_CALL_DEPTH: usize = 4;
const DEFAULT_BRIDGE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway↔backend timeout for generation calls.
    pub request_timeout: Duration,
    /// Gateway↔backend timeout for metadata-only calls (listing models).
    pub metadata_timeout: Duration,
    /// Per-filter-invocation timeout.
    pub filter_timeout: Duration,
    /// Persist partial content on every chunk instead of only at stream
    /// end/cancellation.
    pub persist_each_chunk: bool,
    /// Forward caller-identity headers to remote backends.
    pub forward_user_headers: bool,
    /// Maximum depth of agent→agent call chains.
    pub agent_call_depth: usize,
    /// Streaming bridge channel capacity (bounded; slow consumers stall
    /// producers, items are never dropped).
    pub bridge_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            metadata_timeout: Duration::from_secs(DEFAULT_METADATA_TIMEOUT_SECS),
            filter_timeout: Duration::from_secs(DEFAULT_FILTER_TIMEOUT_SECS),
            persist_each_chunk: false,
            forward_user_headers: false,
            agent_call_depth: DEFAULT_AGENT_CALL_DEPTH,
            bridge_capacity: DEFAULT_BRIDGE_CAPACITY,
        }
    }
}

impl GatewayConfig {
    /// Build from environment, falling back to defaults on missing or
    /// unparsable values (logged, never fatal).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            request_timeout: env_secs("SKIFF_REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            metadata_timeout: env_secs("SKIFF_METADATA_TIMEOUT_SECS", defaults.metadata_timeout),
            filter_timeout: env_secs("SKIFF_FILTER_TIMEOUT_SECS", defaults.filter_timeout),
            persist_each_chunk: env_bool("SKIFF_PERSIST_EACH_CHUNK", defaults.persist_each_chunk),
            forward_user_headers: env_bool(
                "SKIFF_FORWARD_USER_HEADERS",
                defaults.forward_user_headers,
            ),
            agent_call_depth: env_usize("SKIFF_AGENT_CALL_DEPTH", defaults.agent_call_depth),
            bridge_capacity: env_usize("SKIFF_BRIDGE_CAPACITY", defaults.bridge_capacity),
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "Invalid duration value; using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<usize>() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "Invalid numeric value; using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => matches!(raw.trim(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
