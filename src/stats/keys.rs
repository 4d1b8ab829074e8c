//! KV key namespace for statistics.
//!
//! The namespace is fixed: the recorder writes these keys, the aggregator
//! consumes them, and the summary service reads them for the open window.
//! Keyspaces are disjoint per writer so no cross-key coordination is
//! needed.

use crate::models::ApiType;

pub struct StatsKeys;

impl StatsKeys {
    /// Total requests counter: stats:requests:total
    pub fn requests_total() -> &'static str {
        "stats:requests:total"
    }

    /// Blocked requests counter: stats:requests:blocked
    pub fn requests_blocked() -> &'static str {
        "stats:requests:blocked"
    }

    /// Cache-hit counter: stats:requests:cached
    pub fn requests_cached() -> &'static str {
        "stats:requests:cached"
    }

    /// Per-user request counter: stats:requests:user:{id}
    pub fn requests_user(user_id: &str) -> String {
        format!("stats:requests:user:{}", user_id)
    }

    /// Prefix probe for the per-user keyspace.
    pub fn requests_user_pattern() -> &'static str {
        "stats:requests:user:*"
    }

    /// Per-flag counter: stats:flags:{flag}
    pub fn flag(flag: &str) -> String {
        format!("stats:flags:{}", flag)
    }

    /// Prefix probe for the flag keyspace.
    pub fn flag_pattern() -> &'static str {
        "stats:flags:*"
    }

    /// Extract the flag name back out of a flag counter key.
    pub fn flag_name(key: &str) -> Option<&str> {
        key.strip_prefix("stats:flags:")
    }

    /// Extract the user id back out of a per-user counter key.
    pub fn user_id(key: &str) -> Option<&str> {
        key.strip_prefix("stats:requests:user:")
    }

    /// Capped latency sample list: stats:latency:all
    pub fn latency_list() -> &'static str {
        "stats:latency:all"
    }

    /// Per-API-type call hash: api:stats:{text|image}
    /// Fields: calls, errors, total_time
    pub fn api_stats(api: ApiType) -> String {
        format!("api:stats:{}", api)
    }

    /// Prefix probe for the api-stats keyspace.
    pub fn api_stats_pattern() -> &'static str {
        "api:stats:*"
    }
}

/// Field names inside the api:stats hashes.
pub mod api_fields {
    pub const CALLS: &str = "calls";
    pub const ERRORS: &str = "errors";
    pub const TOTAL_TIME: &str = "total_time";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        assert_eq!(StatsKeys::requests_total(), "stats:requests:total");
        assert_eq!(StatsKeys::requests_user("u1"), "stats:requests:user:u1");
        assert_eq!(StatsKeys::flag("phone_number"), "stats:flags:phone_number");
        assert_eq!(StatsKeys::api_stats(ApiType::Text), "api:stats:text");
        assert_eq!(StatsKeys::api_stats(ApiType::Image), "api:stats:image");
    }

    #[test]
    fn test_key_round_trips() {
        assert_eq!(
            StatsKeys::flag_name(&StatsKeys::flag("nsfw")),
            Some("nsfw")
        );
        assert_eq!(
            StatsKeys::user_id(&StatsKeys::requests_user("alice")),
            Some("alice")
        );
        assert_eq!(StatsKeys::flag_name("unrelated"), None);
    }
}
