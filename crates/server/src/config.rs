use crate::util::decode_hex32;
use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing => write!(f, "configuration key missing"),
            Self::Invalid => write!(f, "configuration value invalid"),
        }
    }
}

impl Error for ConfigError {}

/// How accepted single-chat sends reach the recipient.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PipelineMode {
    /// Deliver and persist inline on the sender's connection task.
    Direct,
    /// Append to the shared Redis log and let leader workers drain it.
    TwoPhase,
    /// Like two-phase but over an in-process queue, for single-node runs.
    Local,
}

/// How group sends are presented to online members.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GroupFanoutMode {
    /// Pick push or notify from group size and online count.
    Auto,
    /// Always push the full message.
    Push,
    /// Always push a lightweight new-message notice.
    Notify,
    /// No online fanout; members rely on backlog replay.
    None,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub metrics_bind: Option<String>,
    pub instance_id: String,
    pub postgres_dsn: String,
    pub redis_url: String,
    pub auth_secret: [u8; 32],
    pub auth_timeout_seconds: u64,
    pub route_ttl_seconds: i64,
    pub idempotency_ttl_seconds: i64,
    pub epoch_recheck_seconds: u64,
    pub resend_limit: i64,
    pub resend_lock_seconds: i64,
    pub backpressure_grace_seconds: u64,
    pub call_ring_seconds: u64,
    pub pipeline_mode: PipelineMode,
    /// Two-phase ordering: true pushes to the recipient before the save
    /// phase persists, false persists first and pushes afterwards.
    pub pipeline_deliver_first: bool,
    pub group_fanout_mode: GroupFanoutMode,
    pub connection_keepalive: u64,
}

/// Loads gateway configuration from an INI-style file with environment
/// overrides.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let mut section = String::new();
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let key = if section.is_empty() {
            parts[0].trim().to_string()
        } else {
            format!("{}.{}", section, parts[0].trim())
        };
        let mut value = parts[1].trim().to_string();
        if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        map.insert(key, value);
    }

    let bind = required(override_env("WIREGATE_BIND", map.remove("server.bind"))?)?;
    let metrics_bind = override_env("WIREGATE_METRICS_BIND", map.remove("server.metrics_bind"))?
        .filter(|value| !value.is_empty());
    let instance_id = override_env("WIREGATE_INSTANCE", map.remove("server.instance_id"))?
        .unwrap_or_else(|| format!("gw-{}", std::process::id()));
    let postgres_dsn = required(override_env(
        "WIREGATE_PG_DSN",
        map.remove("storage.postgres_dsn"),
    )?)?;
    let redis_url = required(override_env(
        "WIREGATE_REDIS_URL",
        map.remove("storage.redis_url"),
    )?)?;
    let auth_secret_hex = required(override_env(
        "WIREGATE_AUTH_SECRET",
        map.remove("auth.secret"),
    )?)?;
    let auth_secret = decode_hex32(&auth_secret_hex).map_err(|_| ConfigError::Invalid)?;

    let auth_timeout = parse_with_default(
        override_env("WIREGATE_AUTH_TIMEOUT", map.remove("limits.auth_timeout"))?,
        "15",
    )?;
    let route_ttl = parse_with_default(
        override_env("WIREGATE_ROUTE_TTL", map.remove("limits.route_ttl"))?,
        "120",
    )?;
    let idempotency_ttl = parse_with_default(
        override_env(
            "WIREGATE_IDEMPOTENCY_TTL",
            map.remove("limits.idempotency_ttl"),
        )?,
        "1800",
    )?;
    let epoch_recheck = parse_with_default(
        override_env(
            "WIREGATE_EPOCH_RECHECK",
            map.remove("limits.epoch_recheck"),
        )?,
        "30",
    )?;
    let resend_limit = parse_with_default(
        override_env("WIREGATE_RESEND_LIMIT", map.remove("limits.resend_limit"))?,
        "200",
    )?;
    let resend_lock = parse_with_default(
        override_env("WIREGATE_RESEND_LOCK", map.remove("limits.resend_lock"))?,
        "10",
    )?;
    let backpressure_grace = parse_with_default(
        override_env(
            "WIREGATE_BACKPRESSURE_GRACE",
            map.remove("limits.backpressure_grace"),
        )?,
        "10",
    )?;
    let call_ring = parse_with_default(
        override_env("WIREGATE_CALL_RING", map.remove("limits.call_ring"))?,
        "30",
    )?;
    let keepalive = parse_with_default(
        override_env("WIREGATE_KEEPALIVE", map.remove("server.keepalive"))?,
        "60",
    )?;

    let pipeline_mode = match override_env("WIREGATE_PIPELINE", map.remove("pipeline.mode"))?
        .unwrap_or_else(|| "direct".to_string())
        .as_str()
    {
        "direct" => PipelineMode::Direct,
        "twophase" => PipelineMode::TwoPhase,
        "local" => PipelineMode::Local,
        _ => return Err(ConfigError::Invalid),
    };
    let pipeline_deliver_first = match override_env(
        "WIREGATE_PIPELINE_DELIVER_FIRST",
        map.remove("pipeline.deliver_first"),
    )?
    .unwrap_or_else(|| "true".to_string())
    .as_str()
    {
        "true" => true,
        "false" => false,
        _ => return Err(ConfigError::Invalid),
    };
    let group_fanout_mode = match override_env("WIREGATE_GROUP_FANOUT", map.remove("group.fanout"))?
        .unwrap_or_else(|| "auto".to_string())
        .as_str()
    {
        "auto" => GroupFanoutMode::Auto,
        "push" => GroupFanoutMode::Push,
        "notify" => GroupFanoutMode::Notify,
        "none" => GroupFanoutMode::None,
        _ => return Err(ConfigError::Invalid),
    };

    Ok(ServerConfig {
        bind,
        metrics_bind,
        instance_id,
        postgres_dsn,
        redis_url,
        auth_secret,
        auth_timeout_seconds: auth_timeout as u64,
        route_ttl_seconds: route_ttl,
        idempotency_ttl_seconds: idempotency_ttl,
        epoch_recheck_seconds: epoch_recheck as u64,
        resend_limit,
        resend_lock_seconds: resend_lock,
        backpressure_grace_seconds: backpressure_grace as u64,
        call_ring_seconds: call_ring as u64,
        pipeline_mode,
        pipeline_deliver_first,
        group_fanout_mode,
        connection_keepalive: keepalive as u64,
    })
}

fn override_env(key: &str, current: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(current),
        Err(_) => Err(ConfigError::Invalid),
    }
}

fn required(value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing)
}

fn parse_with_default(value: Option<String>, default: &str) -> Result<i64, ConfigError> {
    value
        .unwrap_or_else(|| default.to_string())
        .parse::<i64>()
        .map_err(|_| ConfigError::Invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn parse_configuration_minimal() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("wiregate_test_config.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind=\"127.0.0.1:9443\"\ninstance_id=\"gw-test\"\n[storage]\npostgres_dsn=\"postgres://\"\nredis_url=\"redis://localhost\"\n[auth]\nsecret=\"000102030405060708090a0b0c0d0e0f000102030405060708090a0b0c0d0e0f\"\n"
        )
        .unwrap();
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.bind, "127.0.0.1:9443");
        assert_eq!(config.instance_id, "gw-test");
        assert_eq!(config.auth_timeout_seconds, 15);
        assert_eq!(config.route_ttl_seconds, 120);
        assert_eq!(config.resend_limit, 200);
        assert_eq!(config.pipeline_mode, PipelineMode::Direct);
        assert!(config.pipeline_deliver_first);
        assert_eq!(config.group_fanout_mode, GroupFanoutMode::Auto);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_unknown_pipeline_mode() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("wiregate_test_config_badmode.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind=\"127.0.0.1:9443\"\n[storage]\npostgres_dsn=\"postgres://\"\nredis_url=\"redis://localhost\"\n[auth]\nsecret=\"000102030405060708090a0b0c0d0e0f000102030405060708090a0b0c0d0e0f\"\n[pipeline]\nmode=\"sideways\"\n"
        )
        .unwrap();
        assert!(matches!(
            load_configuration(&path),
            Err(ConfigError::Invalid)
        ));
        fs::remove_file(path).unwrap();
    }
}
