//! Broker configuration, loaded from a TOML file and immutable afterwards.

use crate::{consts, error::Error};
use serde::{de, Deserialize, Deserializer};
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Address the broker listens on.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Prefer IPv6 when dialing backends whose host is not a v4 literal.
    #[serde(default)]
    pub ipv6: bool,
    /// Number of worker event loops.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Budget for a client to complete a command after the TLS handshake.
    #[serde(default = "default_command_timeout", deserialize_with = "seconds")]
    pub command_timeout: Duration,

    /// Drop to this user after binding when started as root.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
    /// Log filter applied when `RUST_LOG` is not set.
    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    pub ssl_certificate: PathBuf,
    /// Key file; the certificate file is used when absent.
    #[serde(default)]
    pub ssl_certificate_key: Option<PathBuf>,
    #[serde(default)]
    pub ssl_password: Option<String>,
    /// OpenSSL cipher list; library defaults when absent or rejected.
    #[serde(default)]
    pub ssl_ciphers: Option<String>,
    #[serde(default)]
    pub ssl_dhparam: Option<PathBuf>,
    /// Minimum protocol version, "1.2" or "1.3"; anything else means 1.2.
    #[serde(default = "default_min_tls")]
    pub ssl_min_tls_version: String,

    /// Base URL of the authorization service.
    #[serde(default)]
    pub uds_server: String,
    #[serde(default)]
    pub uds_token: String,
    #[serde(default = "default_uds_timeout", deserialize_with = "seconds")]
    pub uds_timeout: Duration,
    #[serde(default = "default_true")]
    pub uds_verify_ssl: bool,

    /// Password for the stats commands; when set it must be exactly
    /// [`consts::PASSWORD_LENGTH`] bytes.
    #[serde(default)]
    pub secret: String,
    /// Source IPs permitted to issue the stats commands.
    #[serde(default)]
    pub allow: Vec<String>,
}

impl Config {
    pub fn try_load(path: &Path) -> Result<Config, Error> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        self.listen_address.parse::<IpAddr>().map_err(|_| {
            Error::Config(format!(
                "listen_address {:?} is not an IP address",
                self.listen_address
            ))
        })?;
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if !self.secret.is_empty() && self.secret.len() != consts::PASSWORD_LENGTH {
            return Err(Error::Config(format!(
                "secret must be exactly {} bytes, got {}",
                consts::PASSWORD_LENGTH,
                self.secret.len()
            )));
        }
        Ok(())
    }

    /// Socket address to bind, with the v4 wildcard widened to v6 when an
    /// IPv6 listener is forced.
    pub fn listen_addr(&self, force_ipv6: bool) -> Result<SocketAddr, Error> {
        let ip: IpAddr = self
            .listen_address
            .parse()
            .map_err(|_| Error::Config(format!("bad listen_address {:?}", self.listen_address)))?;
        let ip = if (force_ipv6 || self.ipv6) && ip == IpAddr::V4(Ipv4Addr::UNSPECIFIED) {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            ip
        };
        Ok(SocketAddr::new(ip, self.listen_port))
    }

    /// Host the stats client connects to; wildcard binds map to loopback.
    pub fn stats_host(&self) -> &str {
        match self.listen_address.as_str() {
            "0.0.0.0" => "127.0.0.1",
            "::" => "::1",
            other => other,
        }
    }
}

fn seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    if secs <= 0.0 || !secs.is_finite() {
        return Err(de::Error::custom("timeout must be a positive number of seconds"));
    }
    Ok(Duration::from_secs_f64(secs))
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    4443
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_loglevel() -> String {
    "info".to_string()
}

fn default_min_tls() -> String {
    "1.2".to_string()
}

fn default_uds_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const MINIMAL: &str = r#"
        ssl_certificate = "/tmp/cert.pem"
        uds_server = "https://uds.example.org/uds/rest/tunnel/ticket"
        uds_token = "token123"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(cfg.listen_address, "0.0.0.0");
        assert_eq!(cfg.listen_port, 4443);
        assert_eq!(cfg.command_timeout, Duration::from_secs(3));
        assert_eq!(cfg.uds_timeout, Duration::from_secs(10));
        assert_eq!(cfg.ssl_min_tls_version, "1.2");
        assert!(cfg.uds_verify_ssl);
        assert!(cfg.allow.is_empty());
        assert!(cfg.workers >= 1);
    }

    #[test]
    fn fractional_timeouts_are_accepted() {
        let raw = format!("{}\ncommand_timeout = 0.5", MINIMAL);
        let cfg: Config = toml::from_str(&raw).unwrap();
        assert_eq!(cfg.command_timeout, Duration::from_millis(500));
    }

    #[test]
    fn negative_timeouts_are_rejected() {
        let raw = format!("{}\ncommand_timeout = -1.0", MINIMAL);
        assert!(toml::from_str::<Config>(&raw).is_err());
    }

    #[test]
    fn short_secret_is_rejected() {
        let raw = format!("{}\nsecret = \"tooshort\"", MINIMAL);
        let cfg: Config = toml::from_str(&raw).unwrap();
        match cfg.validate().unwrap_err() {
            Error::Config(msg) => assert!(msg.contains("secret")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn exact_length_secret_is_accepted() {
        let raw = format!("{}\nsecret = \"{}\"", MINIMAL, "s".repeat(32));
        let cfg: Config = toml::from_str(&raw).unwrap();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn wildcard_listen_widens_to_v6_when_forced() {
        let cfg: Config = toml::from_str(MINIMAL).unwrap();
        let addr = cfg.listen_addr(true).unwrap();
        assert_eq!(addr.ip(), IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        let addr = cfg.listen_addr(false).unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let cfg = Config::try_load(file.path()).unwrap();
        assert_eq!(cfg.uds_token, "token123");
    }

    #[test]
    fn stats_host_maps_wildcards_to_loopback() {
        let mut cfg: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(cfg.stats_host(), "127.0.0.1");
        cfg.listen_address = "::".to_string();
        assert_eq!(cfg.stats_host(), "::1");
        cfg.listen_address = "192.0.2.7".to_string();
        assert_eq!(cfg.stats_host(), "192.0.2.7");
    }
}
