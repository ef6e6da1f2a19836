use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    domain::{SecretString, UserId},
    events::DEFAULT_CAPACITY,
    errors::Error,
    Result,
};

/// Typed process configuration.
///
/// Read once at startup; nothing in the core re-reads the environment.
#[derive(Clone, Debug)]
pub struct Config {
    // Identity
    pub owner_id: Option<UserId>,
    pub admin_ids: Vec<UserId>,
    pub owner_private_chat_only: bool,

    // Credential store
    pub master_key: Option<SecretString>,
    pub token_file: PathBuf,
    /// Used only when the store has no usable designated credential.
    pub telegram_bot_token: Option<SecretString>,

    // Security log
    pub security_log_path: PathBuf,
    pub security_log_capacity: usize,

    // Rate limiting
    pub rate_limit_enabled: bool,
    pub rate_limit_max: u32,
    pub rate_limit_interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (env in production, a map in tests).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_str = |key: &str| get(key).and_then(non_empty);

        // Identity
        let owner_id = match env_str("OWNER_ID") {
            Some(raw) => {
                let id = raw.trim().parse::<i64>().map_err(|_| {
                    Error::Config(format!("OWNER_ID must be numeric, got {raw:?}"))
                })?;
                // 0 is the historical "unset" sentinel.
                (id != 0).then_some(UserId(id))
            }
            None => None,
        };
        let admin_ids = parse_user_ids(env_str("ADMIN_IDS"));
        let owner_private_chat_only =
            parse_bool(env_str("OWNER_PRIVATE_CHAT_ONLY")).unwrap_or(false);

        // Credential store
        let master_key = env_str("NOVAXA_MASTER_KEY").map(SecretString::new);
        let token_file = PathBuf::from(
            env_str("TOKEN_FILE").unwrap_or_else(|| "config/tokens.json".to_string()),
        );
        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").map(SecretString::new);

        // Security log
        let security_log_path = PathBuf::from(
            env_str("SECURITY_LOG_FILE").unwrap_or_else(|| "logs/security.log".to_string()),
        );
        let security_log_capacity = parse_num::<usize>(env_str("SECURITY_LOG_CAPACITY"))
            .unwrap_or(DEFAULT_CAPACITY)
            .max(1);

        // Rate limiting
        let rate_limit_enabled = parse_bool(env_str("RATE_LIMIT_ENABLED")).unwrap_or(true);
        let rate_limit_max = parse_num::<u32>(env_str("RATE_LIMIT_MAX")).unwrap_or(30);
        let rate_limit_interval =
            Duration::from_secs(parse_num::<u64>(env_str("RATE_LIMIT_INTERVAL")).unwrap_or(60));

        if rate_limit_interval.is_zero() {
            return Err(Error::Config(
                "RATE_LIMIT_INTERVAL must be at least 1 second".to_string(),
            ));
        }

        Ok(Self {
            owner_id,
            admin_ids,
            owner_private_chat_only,
            master_key,
            token_file,
            telegram_bot_token,
            security_log_path,
            security_log_capacity,
            rate_limit_enabled,
            rate_limit_max,
            rate_limit_interval,
        })
    }
}

/// Export `.env` entries that the process environment does not already set.
fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };
    dotenv_entries(&contents)
        .filter(|(key, _)| env::var_os(key).is_none())
        .for_each(|(key, value)| env::set_var(key, value));
}

/// `KEY=value` pairs; blank lines, `#` comments and keyless lines are ignored.
/// One layer of matching quotes is removed from values.
fn dotenv_entries(contents: &str) -> impl Iterator<Item = (&str, &str)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim(), unquote(value.trim())))
        .filter(|(key, _)| !key.is_empty())
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|q| value.strip_prefix(*q)?.strip_suffix(*q))
        .unwrap_or(value)
}

fn parse_bool(v: Option<String>) -> Option<bool> {
    v.map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn parse_num<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
    v.and_then(|s| s.trim().parse::<T>().ok())
}

/// Comma-separated ids. Entries that are not integers are dropped.
fn parse_user_ids(v: Option<String>) -> Vec<UserId> {
    v.unwrap_or_default()
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .map(UserId)
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn cfg_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_env_is_empty() {
        let cfg = cfg_from(&[]).unwrap();
        assert_eq!(cfg.owner_id, None);
        assert!(cfg.admin_ids.is_empty());
        assert!(cfg.master_key.is_none());
        assert_eq!(cfg.token_file, PathBuf::from("config/tokens.json"));
        assert_eq!(cfg.security_log_path, PathBuf::from("logs/security.log"));
        assert_eq!(cfg.security_log_capacity, 1000);
        assert!(cfg.rate_limit_enabled);
        assert_eq!(cfg.rate_limit_max, 30);
        assert_eq!(cfg.rate_limit_interval, Duration::from_secs(60));
    }

    #[test]
    fn admin_ids_skip_garbage_entries() {
        let cfg = cfg_from(&[("ADMIN_IDS", "111, 222,abc,,333 ")]).unwrap();
        assert_eq!(cfg.admin_ids, vec![UserId(111), UserId(222), UserId(333)]);
    }

    #[test]
    fn dotenv_entries_skip_comments_and_strip_quotes() {
        let contents = "# comment\n\nOWNER_ID=111\n ADMIN_IDS = \"222,333\" \nNOVAXA_MASTER_KEY='k=v'\nnot a pair\n=orphan\nEMPTY=\nLONE=\"\n";
        let entries: Vec<_> = dotenv_entries(contents).collect();
        assert_eq!(
            entries,
            vec![
                ("OWNER_ID", "111"),
                ("ADMIN_IDS", "222,333"),
                ("NOVAXA_MASTER_KEY", "k=v"),
                ("EMPTY", ""),
                ("LONE", "\""),
            ]
        );
    }

    #[test]
    fn owner_zero_means_unset() {
        let cfg = cfg_from(&[("OWNER_ID", "0")]).unwrap();
        assert_eq!(cfg.owner_id, None);

        let cfg = cfg_from(&[("OWNER_ID", " 111 ")]).unwrap();
        assert_eq!(cfg.owner_id, Some(UserId(111)));
    }

    #[test]
    fn non_numeric_owner_is_rejected() {
        let err = cfg_from(&[("OWNER_ID", "me")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let cfg = cfg_from(&[
            ("NOVAXA_MASTER_KEY", "super-secret-master"),
            ("TELEGRAM_BOT_TOKEN", "123:fallback-token-value"),
        ])
        .unwrap();
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("super-secret-master"));
        assert!(!dbg.contains("fallback-token-value"));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = cfg_from(&[("RATE_LIMIT_INTERVAL", "0")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
