//! Application configuration.
//!
//! Precedence: env vars > .env file > starling.toml > defaults. Loaded once
//! at process start and owned by the application context; nothing reads
//! configuration through a global.

use serde::Deserialize;

/// Load configuration from the environment.
///
/// Environment variables use the `STARLING` prefix with `__` separators,
/// e.g. `STARLING_SERVER__PORT=7000`.
pub fn load() -> Result<AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 7000)?
        .set_default("server.name", "starling")?
        .set_default("server.description", "A Starling relay")?
        .set_default("server.contact", "")?
        .set_default("server.relay_url", "")?
        .set_default("server.pubkey", "")?
        .set_default("limits.max_filter_limit", 500)?
        .set_default("limits.max_subscriptions", 20)?
        .set_default("storage.req_timeout_secs", 8)?
        .set_default("pipeline.dedupe_cache_size", 4096)?
        .set_default("pipeline.fresh_event_max_age_secs", 300)?
        .set_default("pipeline.ingest_timeout_ms", 1000)?
        .set_default("pipeline.eligibility", "policy-gate")?
        .set_default("policy.timeout_ms", 1000)?
        .set_default("outbox.enabled", true)?
        .set_default("outbox.max_subscribe_relays", 5)?
        .set_default("outbox.max_publish_relays", 10)?
        .set_default("outbox.connect_timeout_secs", 5)?
        // Optional config file
        .add_source(config::File::with_name("starling").required(false))
        // Environment variables (STARLING_SERVER__PORT, etc.)
        .add_source(
            config::Environment::with_prefix("STARLING")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    cfg.try_deserialize()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub policy: PolicyConfig,
    pub outbox: OutboxConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Relay name advertised in the information document.
    pub name: String,
    pub description: String,
    /// Operator contact (email or URI); empty to omit.
    pub contact: String,
    /// Public URL of this relay (e.g. "wss://relay.example.com"). Used to
    /// exclude ourselves from outbox publish targets.
    pub relay_url: String,
    /// Operator pubkey advertised in the information document.
    pub pubkey: String,
}

/// One rate-limit tier: at most `limit` hits per `window_secs` window.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RateTier {
    pub limit: u64,
    pub window_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Clamp for per-filter `limit` values sent to storage.
    pub max_filter_limit: u64,
    /// Maximum concurrent subscriptions per connection.
    pub max_subscriptions: usize,
    /// Tiers for the all-messages limiter. Exceeding any closes the socket.
    #[serde(default = "default_message_tiers")]
    pub message_tiers: Vec<RateTier>,
    /// Tiers for REQ/COUNT operations; exceeding rejects the operation.
    #[serde(default = "default_req_tiers")]
    pub req_tiers: Vec<RateTier>,
    /// Tiers for ordinary EVENT submissions; exceeding drops the event.
    #[serde(default = "default_event_tiers")]
    pub event_tiers: Vec<RateTier>,
    /// Tiers for ephemeral-kind EVENT submissions.
    #[serde(default = "default_ephemeral_tiers")]
    pub ephemeral_tiers: Vec<RateTier>,
}

fn default_message_tiers() -> Vec<RateTier> {
    vec![
        RateTier { limit: 300, window_secs: 5 * 60 },
        RateTier { limit: 1000, window_secs: 60 * 60 },
    ]
}

fn default_req_tiers() -> Vec<RateTier> {
    vec![RateTier { limit: 60, window_secs: 60 }]
}

fn default_event_tiers() -> Vec<RateTier> {
    vec![RateTier { limit: 10, window_secs: 10 }]
}

fn default_ephemeral_tiers() -> Vec<RateTier> {
    vec![RateTier { limit: 30, window_secs: 10 }]
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Deadline for a subscription's stored-event stream; expiry surfaces to
    /// the client as "could not respond fast enough".
    pub req_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Ids remembered by the dedupe cache.
    pub dedupe_cache_size: usize,
    /// Events older than this are treated as backfill: stored but neither
    /// published to the live bus nor broadcast through the outbox.
    pub fresh_event_max_age_secs: u64,
    /// Deadline for pipeline invocations from non-relay callers.
    pub ingest_timeout_ms: u64,
    /// Storage-eligibility strategy: "policy-gate" or "known-authors".
    pub eligibility: String,
    /// Pubkeys always eligible under the known-authors strategy.
    #[serde(default)]
    pub admin_pubkeys: Vec<String>,
    /// Pubkeys whose fresh events are broadcast to their outbox relays.
    #[serde(default)]
    pub local_pubkeys: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    /// Path to the external policy executable; unset runs allow-all.
    #[serde(default)]
    pub command: Option<String>,
    /// Per-call deadline for policy evaluation.
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutboxConfig {
    pub enabled: bool,
    /// Write relays considered per author when routing subscriptions.
    pub max_subscribe_relays: usize,
    /// Relays targeted per event when routing publishes.
    pub max_publish_relays: usize,
    pub connect_timeout_secs: u64,
    /// Operator relay list used when an author has none of their own.
    #[serde(default)]
    pub fallback_relays: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_environment() {
        let cfg = load().expect("defaults should satisfy every field");
        assert_eq!(cfg.server.port, 7000);
        assert_eq!(cfg.outbox.max_subscribe_relays, 5);
        assert_eq!(cfg.outbox.max_publish_relays, 10);
        assert_eq!(cfg.pipeline.eligibility, "policy-gate");
        assert!(!cfg.limits.message_tiers.is_empty());
    }
}
