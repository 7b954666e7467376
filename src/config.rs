use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::promise::Promise;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os("OVERLAN_CONFIG") {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: PathBuf::from(p),
                source: ConfigPathSource::Env,
            });
        }
    }

    for name in ["overlan.toml", "overlan.yaml", "overlan.yml"] {
        let p = Path::new(name);
        if p.is_file() {
            return Ok(ResolvedConfigPath {
                path: p.to_path_buf(),
                source: ConfigPathSource::Cwd,
            });
        }
    }

    let proj =
        ProjectDirs::from("net", "overlan", "overlan").context("config: resolve config dir")?;
    Ok(ResolvedConfigPath {
        path: proj.config_dir().join("overlan.toml"),
        source: ConfigPathSource::Default,
    })
}

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub networks_path: Option<PathBuf>,
    pub point: Option<PointConfig>,
    pub proxy: ProxyConfig,
    pub dial_timeout: Duration,
    pub send_timeout: Duration,
    pub retry: Promise,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PointConfig {
    pub device: String,
    pub connect: String,
    pub mtu: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub http: Option<AuthListenerConfig>,
    pub socks: Option<AuthListenerConfig>,
    pub tcp: Vec<TcpForwardConfig>,
}

impl ProxyConfig {
    pub fn is_empty(&self) -> bool {
        self.http.is_none() && self.socks.is_none() && self.tcp.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct AuthListenerConfig {
    pub listen: String,
    pub users: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct TcpForwardConfig {
    pub listen: String,
    pub target: String,
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let text = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&text).with_context(|| format!("parse {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&text).with_context(|| format!("parse {}", path.display()))?
        }
        other => anyhow::bail!("config: unsupported extension {other:?} (want .toml or .yaml)"),
    };

    Config::from_file(fc)
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    logging: Option<FileLogging>,
    store: Option<FileStore>,
    point: Option<FilePoint>,
    proxy: Option<FileProxy>,
    timeouts: Option<FileTimeouts>,
    retry: Option<FileRetry>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileStore {
    networks: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct FilePoint {
    device: String,
    connect: String,
    mtu: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct FileProxy {
    http: Option<FileAuthListener>,
    socks: Option<FileAuthListener>,
    #[serde(default)]
    tcp: Vec<FileTcpForward>,
}

#[derive(Debug, Deserialize)]
struct FileAuthListener {
    listen: String,
    auth: Option<FileAuth>,
}

#[derive(Debug, Deserialize)]
struct FileAuth {
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Deserialize)]
struct FileTcpForward {
    listen: String,
    target: String,
}

#[derive(Debug, Deserialize)]
struct FileTimeouts {
    dial_timeout_ms: Option<u64>,
    send_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileRetry {
    first_ms: Option<u64>,
    min_ms: Option<u64>,
    max_ms: Option<u64>,
}

impl Config {
    fn from_file(fc: FileConfig) -> anyhow::Result<Config> {
        let logging = match fc.logging {
            Some(l) => {
                let d = LoggingConfig::default();
                LoggingConfig {
                    level: l.level.unwrap_or(d.level),
                    format: l.format.unwrap_or(d.format),
                    output: l.output.unwrap_or(d.output),
                    add_source: l.add_source,
                }
            }
            None => LoggingConfig::default(),
        };

        let point = match fc.point {
            Some(p) => {
                if p.device.trim().is_empty() {
                    anyhow::bail!("config: point.device is required");
                }
                if p.connect.trim().is_empty() {
                    anyhow::bail!("config: point.connect is required");
                }
                Some(PointConfig {
                    device: p.device.trim().to_string(),
                    connect: p.connect.trim().to_string(),
                    mtu: p.mtu.unwrap_or(1500),
                })
            }
            None => None,
        };

        let proxy = match fc.proxy {
            Some(p) => {
                let tcp = p
                    .tcp
                    .into_iter()
                    .map(|t| {
                        if t.listen.trim().is_empty() || t.target.trim().is_empty() {
                            anyhow::bail!("config: proxy.tcp entries need listen and target");
                        }
                        Ok(TcpForwardConfig {
                            listen: t.listen.trim().to_string(),
                            target: t.target.trim().to_string(),
                        })
                    })
                    .collect::<anyhow::Result<Vec<_>>>()?;
                ProxyConfig {
                    http: p.http.map(auth_listener),
                    socks: p.socks.map(auth_listener),
                    tcp,
                }
            }
            None => ProxyConfig::default(),
        };

        let dial_timeout = fc
            .timeouts
            .as_ref()
            .and_then(|t| t.dial_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(10));
        let send_timeout = fc
            .timeouts
            .as_ref()
            .and_then(|t| t.send_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5));

        let defaults = Promise::default();
        let retry = match fc.retry {
            Some(r) => Promise {
                first: r.first_ms.map(Duration::from_millis).unwrap_or(defaults.first),
                min: r.min_ms.map(Duration::from_millis).unwrap_or(defaults.min),
                max: r.max_ms.map(Duration::from_millis).unwrap_or(defaults.max),
            },
            None => defaults,
        };

        Ok(Config {
            logging,
            networks_path: fc.store.and_then(|s| s.networks),
            point,
            proxy,
            dial_timeout,
            send_timeout,
            retry,
        })
    }
}

fn auth_listener(l: FileAuthListener) -> AuthListenerConfig {
    let mut users = HashMap::new();
    if let Some(a) = l.auth {
        if !a.username.trim().is_empty() {
            users.insert(a.username.trim().to_string(), a.password);
        }
    }
    AuthListenerConfig {
        listen: l.listen.trim().to_string(),
        users,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_with_every_section_parses() {
        let text = r#"
[logging]
level = "debug"
format = "json"

[store]
networks = "/var/lib/overlan/networks.json"

[point]
device = "tap0"
connect = "switch.example.net:10002"
mtu = 1400

[proxy.http]
listen = ":3128"
auth = { username = "u", password = "p" }

[proxy.socks]
listen = ":1080"

[[proxy.tcp]]
listen = ":7000"
target = "127.0.0.1:7001"

[timeouts]
dial_timeout_ms = 3000

[retry]
first_ms = 1000
min_ms = 5000
max_ms = 30000
"#;
        let fc: FileConfig = toml::from_str(text).unwrap();
        let cfg = Config::from_file(fc).unwrap();

        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(
            cfg.networks_path.as_deref(),
            Some(Path::new("/var/lib/overlan/networks.json"))
        );

        let point = cfg.point.unwrap();
        assert_eq!(point.device, "tap0");
        assert_eq!(point.mtu, 1400);

        let http = cfg.proxy.http.unwrap();
        assert_eq!(http.listen, ":3128");
        assert_eq!(http.users.get("u").map(String::as_str), Some("p"));
        let socks = cfg.proxy.socks.unwrap();
        assert!(socks.users.is_empty());
        assert_eq!(cfg.proxy.tcp.len(), 1);

        assert_eq!(cfg.dial_timeout, Duration::from_secs(3));
        assert_eq!(cfg.send_timeout, Duration::from_secs(5));
        assert_eq!(cfg.retry.first, Duration::from_secs(1));
        assert_eq!(cfg.retry.max, Duration::from_secs(30));
    }

    #[test]
    fn yaml_parses_too() {
        let text = r#"
point:
  device: tap1
  connect: "10.0.0.1:10002"
"#;
        let fc: FileConfig = serde_yaml::from_str(text).unwrap();
        let cfg = Config::from_file(fc).unwrap();
        assert_eq!(cfg.point.unwrap().connect, "10.0.0.1:10002");
        assert!(cfg.proxy.is_empty());
        assert_eq!(cfg.retry.first, Duration::from_secs(2));
    }

    #[test]
    fn missing_point_fields_are_rejected() {
        let text = r#"
[point]
device = ""
connect = "x:1"
"#;
        let fc: FileConfig = toml::from_str(text).unwrap();
        assert!(Config::from_file(fc).is_err());
    }
}
