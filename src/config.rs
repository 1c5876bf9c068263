// =============================================================================
// Service configuration — environment-driven
// =============================================================================
//
// Everything operational comes from the environment (dotenv is loaded in
// main): the fleet identity, per-user venue credentials, the testnet
// toggle, the store path, and the bind address. Credentials are looked up
// as `<USER_ID_UPPERCASE>_API_KEY` / `_API_SECRET`.
// =============================================================================

use tracing::warn;

/// Venue credentials for one fleet member.
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub user_id: String,
    pub api_key: String,
    pub api_secret: String,
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub users: Vec<UserCredentials>,
    pub testnet: bool,
    pub db_path: String,
    pub bind_addr: String,
    /// Optional shared mark-price cache TTL in seconds (≤30).
    pub price_cache_secs: Option<u64>,
}

/// The four-account fleet of the current deployment.
const DEFAULT_USERS: &str = "copy_trading,futures,hufsa,copy_2";

impl ExecConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let user_list = lookup("EXEC_USERS").unwrap_or_else(|| DEFAULT_USERS.to_string());

        let users = user_list
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .map(|user_id| {
                let prefix = user_id.to_uppercase();
                let api_key = lookup(&format!("{prefix}_API_KEY")).unwrap_or_default();
                let api_secret = lookup(&format!("{prefix}_API_SECRET")).unwrap_or_default();
                if api_key.is_empty() || api_secret.is_empty() {
                    warn!(user_id = %user_id, "missing venue credentials for user");
                }
                UserCredentials {
                    user_id,
                    api_key,
                    api_secret,
                }
            })
            .collect();

        let testnet = lookup("BINANCE_TESTNET")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Self {
            users,
            testnet,
            db_path: lookup("EXEC_DB_PATH").unwrap_or_else(|| "archer_exec.db".to_string()),
            bind_addr: lookup("EXEC_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            price_cache_secs: lookup("EXEC_PRICE_CACHE_SECS").and_then(|v| v.parse().ok()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn defaults_describe_the_four_user_fleet() {
        let cfg = ExecConfig::from_lookup(lookup_from(&[]));
        let ids: Vec<&str> = cfg.users.iter().map(|u| u.user_id.as_str()).collect();
        assert_eq!(ids, vec!["copy_trading", "futures", "hufsa", "copy_2"]);
        assert!(!cfg.testnet);
        assert_eq!(cfg.bind_addr, "0.0.0.0:8000");
        assert_eq!(cfg.db_path, "archer_exec.db");
        assert!(cfg.price_cache_secs.is_none());
    }

    #[test]
    fn credentials_resolve_per_user() {
        let cfg = ExecConfig::from_lookup(lookup_from(&[
            ("EXEC_USERS", "alpha, beta"),
            ("ALPHA_API_KEY", "ak"),
            ("ALPHA_API_SECRET", "as"),
            ("BINANCE_TESTNET", "true"),
            ("EXEC_PRICE_CACHE_SECS", "15"),
        ]));

        assert_eq!(cfg.users.len(), 2);
        assert_eq!(cfg.users[0].user_id, "alpha");
        assert_eq!(cfg.users[0].api_key, "ak");
        assert_eq!(cfg.users[0].api_secret, "as");
        // beta has no credentials configured; the user still exists.
        assert_eq!(cfg.users[1].user_id, "beta");
        assert!(cfg.users[1].api_key.is_empty());
        assert!(cfg.testnet);
        assert_eq!(cfg.price_cache_secs, Some(15));
    }
}
