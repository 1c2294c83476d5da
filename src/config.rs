use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

const ENV_PREFIX: &str = "AKASH_PROXY_";

pub const DEFAULT_SEED_URL: &str =
    "https://raw.githubusercontent.com/cosmos/chain-registry/master/akash/chain.json";

/// Application configuration derived from `AKASH_PROXY_*` environment
/// variables.
#[derive(Clone, Debug)]
pub struct Config {
    pub listen: SocketAddr,
    pub autocert_email: Option<String>,
    pub autocert_hosts: Vec<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub seed_url: String,
    pub seed_refresh_interval: Duration,
    pub chain_id: String,
    pub healthy_threshold: Duration,
    pub check_health_interval: Duration,
    pub proxy_request_timeout: Duration,
    pub unhealthy_recovery_chance_pct: u32,
    pub healthy_error_rate_threshold: f64,
    pub error_rate_bucket_ttl: Duration,
}

impl Config {
    /// Load configuration from the environment with upstream defaults.
    /// Any invalid value is fatal.
    pub fn from_env() -> Result<Self> {
        let listen = parse_env("LISTEN", ":https", parse_listen)?;
        let autocert_email = optional_env("AUTOCERT_EMAIL");
        let autocert_hosts = optional_env("AUTOCERT_HOSTS")
            .map(|raw| {
                raw.split(',')
                    .map(|host| host.trim().to_string())
                    .filter(|host| !host.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let tls_cert = optional_env("TLS_CERT").map(PathBuf::from);
        let tls_key = optional_env("TLS_KEY").map(PathBuf::from);
        if tls_cert.is_some() != tls_key.is_some() {
            bail!("{ENV_PREFIX}TLS_CERT and {ENV_PREFIX}TLS_KEY must be set together");
        }
        let seed_url = parse_env("SEED_URL", DEFAULT_SEED_URL, parse_string)?;
        let seed_refresh_interval = parse_env("SEED_REFRESH_INTERVAL", "5m", parse_duration)?;
        let chain_id = parse_env("CHAIN_ID", "akashnet-2", parse_string)?;
        let healthy_threshold = parse_env("HEALTHY_THRESHOLD", "10s", parse_duration)?;
        let check_health_interval = parse_env("HEALTH_INTERVAL", "5m", parse_duration)?;
        let proxy_request_timeout = parse_env("PROXY_REQUEST_TIMEOUT", "15s", parse_duration)?;
        let unhealthy_recovery_chance_pct = parse_env(
            "UNHEALTHY_SERVER_RECOVERY_CHANCE_PERCENT",
            "1",
            parse_u32,
        )?;
        if unhealthy_recovery_chance_pct > 100 {
            bail!(
                "{ENV_PREFIX}UNHEALTHY_SERVER_RECOVERY_CHANCE_PERCENT must be within 0-100 (got {unhealthy_recovery_chance_pct})"
            );
        }
        let healthy_error_rate_threshold =
            parse_env("HEALTHY_ERROR_RATE_THRESHOLD", "30", parse_f64)?;
        if !(0.0..=100.0).contains(&healthy_error_rate_threshold) {
            bail!(
                "{ENV_PREFIX}HEALTHY_ERROR_RATE_THRESHOLD must be within 0-100 (got {healthy_error_rate_threshold})"
            );
        }
        let error_rate_bucket_ttl =
            parse_env("HEALTHY_ERROR_RATE_BUCKET_TIMEOUT", "1m", parse_duration)?;

        Ok(Self {
            listen,
            autocert_email,
            autocert_hosts,
            tls_cert,
            tls_key,
            seed_url,
            seed_refresh_interval,
            chain_id,
            healthy_threshold,
            check_health_interval,
            proxy_request_timeout,
            unhealthy_recovery_chance_pct,
            healthy_error_rate_threshold,
            error_rate_bucket_ttl,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            listen: "127.0.0.1:0".parse().expect("test listen addr"),
            autocert_email: None,
            autocert_hosts: Vec::new(),
            tls_cert: None,
            tls_key: None,
            seed_url: String::new(),
            seed_refresh_interval: Duration::from_millis(50),
            chain_id: "unittest".into(),
            healthy_threshold: Duration::from_secs(10),
            check_health_interval: Duration::from_secs(300),
            proxy_request_timeout: Duration::from_secs(2),
            unhealthy_recovery_chance_pct: 1,
            healthy_error_rate_threshold: 30.0,
            error_rate_bucket_ttl: Duration::from_secs(60),
        }
    }
}

fn optional_env(key: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_env<T, F>(key: &str, default: &str, parser: F) -> Result<T>
where
    F: Fn(&str) -> Result<T>,
{
    match optional_env(key) {
        Some(value) => parser(&value).with_context(|| format!("invalid {ENV_PREFIX}{key}")),
        None => parser(default),
    }
}

fn parse_string(input: &str) -> Result<String> {
    Ok(input.to_string())
}

fn parse_u32(input: &str) -> Result<u32> {
    input
        .parse()
        .with_context(|| format!("invalid integer value `{input}`"))
}

fn parse_f64(input: &str) -> Result<f64> {
    input
        .parse()
        .with_context(|| format!("invalid floating point value `{input}`"))
}

/// Listen strings in the upstream's format: `:https`, `:8443`,
/// `0.0.0.0:443`, `127.0.0.1:9000`. An empty host binds all interfaces.
fn parse_listen(input: &str) -> Result<SocketAddr> {
    let (host, port) = input
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("invalid listen address `{input}`"))?;
    let port: u16 = match port {
        "https" => 443,
        "http" => 80,
        other => other
            .parse()
            .with_context(|| format!("invalid listen port `{other}`"))?,
    };
    let ip: IpAddr = if host.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        host.parse()
            .with_context(|| format!("invalid listen host `{host}`"))?
    };
    Ok(SocketAddr::new(ip, port))
}

/// Durations in the upstream's format: `500ms`, `10s`, `5m`, `1h`, `1m30s`.
fn parse_duration(input: &str) -> Result<Duration> {
    let mut rest = input.trim();
    if rest.is_empty() {
        bail!("empty duration");
    }
    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| anyhow!("missing unit in duration `{input}`"))?;
        if digits_end == 0 {
            bail!("invalid duration `{input}`");
        }
        let value: u64 = rest[..digits_end]
            .parse()
            .with_context(|| format!("invalid duration `{input}`"))?;
        rest = &rest[digits_end..];
        let unit_end = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = &rest[unit_end..];
        total += match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            other => bail!("unknown duration unit `{other}` in `{input}`"),
        };
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;

    static ENV_GUARD: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    fn reset_env() {
        for key in [
            "LISTEN",
            "TLS_CERT",
            "TLS_KEY",
            "CHAIN_ID",
            "SEED_REFRESH_INTERVAL",
            "UNHEALTHY_SERVER_RECOVERY_CHANCE_PERCENT",
            "HEALTHY_ERROR_RATE_THRESHOLD",
        ] {
            env::remove_var(format!("{ENV_PREFIX}{key}"));
        }
    }

    #[test]
    fn parses_go_style_durations() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5d").is_err());
    }

    #[test]
    fn parses_listen_strings() {
        assert_eq!(
            parse_listen(":https").unwrap(),
            "0.0.0.0:443".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_listen(":8080").unwrap(),
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_listen("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_listen("8080").is_err());
        assert!(parse_listen(":nope").is_err());
    }

    #[test]
    fn applies_upstream_defaults() {
        let _lock = ENV_GUARD.lock().unwrap();
        reset_env();

        let config = Config::from_env().expect("default config");
        assert_eq!(config.listen.port(), 443);
        assert_eq!(config.chain_id, "akashnet-2");
        assert_eq!(config.seed_url, DEFAULT_SEED_URL);
        assert_eq!(config.seed_refresh_interval, Duration::from_secs(300));
        assert_eq!(config.healthy_threshold, Duration::from_secs(10));
        assert_eq!(config.proxy_request_timeout, Duration::from_secs(15));
        assert_eq!(config.unhealthy_recovery_chance_pct, 1);
        assert_eq!(config.healthy_error_rate_threshold, 30.0);
        assert_eq!(config.error_rate_bucket_ttl, Duration::from_secs(60));
    }

    #[test]
    fn rejects_out_of_range_recovery_chance() {
        let _lock = ENV_GUARD.lock().unwrap();
        reset_env();
        env::set_var(
            format!("{ENV_PREFIX}UNHEALTHY_SERVER_RECOVERY_CHANCE_PERCENT"),
            "101",
        );

        let result = Config::from_env();

        assert!(result
            .unwrap_err()
            .to_string()
            .contains("UNHEALTHY_SERVER_RECOVERY_CHANCE_PERCENT"));
        reset_env();
    }

    #[test]
    fn rejects_lonely_tls_material() {
        let _lock = ENV_GUARD.lock().unwrap();
        reset_env();
        env::set_var(format!("{ENV_PREFIX}TLS_CERT"), "/etc/proxy/tls.crt");

        let result = Config::from_env();

        assert!(result.unwrap_err().to_string().contains("TLS_KEY"));
        reset_env();
    }
}
