use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::ezturp::tunnel::protocol::MAX_FRAME_PAYLOAD;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

const CONFIG_CANDIDATES: [&str; 4] = ["ezturp.json", "ezturp.toml", "ezturp.yaml", "ezturp.yml"];

/// Flag (clap folds `EZTURP_CONFIG` into it) > `ezturp.*` in the working directory > OS default.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        let p = match fs::metadata(&p) {
            Ok(m) if m.is_dir() => discover_config_path(&p)?,
            _ => p,
        };
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in CONFIG_CANDIDATES {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no ezturp.* found in {}", dir.display())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/ezturp/ezturp.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("com", "ezturp", "ezturp")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("ezturp.toml"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "json" => Ok(ConfigFormat::Json),
            "toml" => Ok(ConfigFormat::Toml),
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            _ => anyhow::bail!(
                "config: unsupported config extension {ext:?} (expected .json, .toml or .yaml/.yml)"
            ),
        }
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let format = ConfigFormat::from_path(path)?;
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);
    parse_config(&s, format).with_context(|| format!("parse {}", path.display()))
}

pub fn parse_config(s: &str, format: ConfigFormat) -> anyhow::Result<Config> {
    let doc: FileDocument = match format {
        ConfigFormat::Json => serde_json::from_str(s).context("parse json")?,
        ConfigFormat::Toml => FileDocument::Full(toml::from_str(s).context("parse toml")?),
        ConfigFormat::Yaml => serde_yaml::from_str(s).context("parse yaml")?,
    };
    Config::from_document(doc)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => anyhow::bail!("unsupported protocol {other:?} (expected tcp|udp)"),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Tunables shared by every tunnel instance of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Read deadline on the server side of a TCP internal link.
    pub internal_idle_timeout: Duration,
    /// KEEP_ALIVE period of the TCP client; must stay below `internal_idle_timeout`.
    pub keep_alive_interval: Duration,
    /// MAINTAIN_UDP_CLIENT_ADDR period of the UDP client.
    pub udp_heartbeat_interval: Duration,
    /// A client side UDP session without traffic for this long is torn down.
    pub udp_session_idle: Duration,
    /// Pause after losing the TCP internal link before waiting for the next one.
    pub reaccept_backoff: Duration,
    /// Read size of the TCP session pumps.
    pub buffer_size: usize,
    pub dial_timeout: Duration,
    /// Pause between two runs of a supervised instance.
    pub restart_delay: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            internal_idle_timeout: Duration::from_secs(60),
            keep_alive_interval: Duration::from_secs(30),
            udp_heartbeat_interval: Duration::from_secs(60),
            udp_session_idle: Duration::from_secs(30 * 60),
            reaccept_backoff: Duration::from_millis(200),
            buffer_size: 8 * 1024,
            dial_timeout: Duration::from_secs(5),
            restart_delay: Duration::from_secs(1),
        }
    }
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
            output: "stdout".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub name: String,
    pub protocol: Protocol,
    pub local_address: String,
    pub internal_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub protocol: Protocol,
    pub internal_address: String,
    pub external_address: String,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub settings: Settings,
    pub clients: Vec<ClientConfig>,
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FileDocument {
    /// Legacy format: a bare list of instance records.
    Legacy(Vec<FileInstance>),
    Full(FileConfig),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    logging: Option<FileLogging>,

    timeouts: Option<FileTimeouts>,

    #[serde(default)]
    buffer_size: i64,

    #[serde(default)]
    clients: Vec<FileInstance>,

    #[serde(default)]
    servers: Vec<FileInstance>,
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
struct FileTimeouts {
    internal_idle_timeout_ms: Option<i64>,
    keep_alive_interval_ms: Option<i64>,
    udp_heartbeat_interval_ms: Option<i64>,
    udp_session_idle_ms: Option<i64>,
    reaccept_backoff_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    restart_delay_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileInstance {
    #[serde(default)]
    name: String,
    #[serde(default)]
    protocol: String,
    #[serde(default)]
    local_address: String,
    #[serde(default)]
    internal_address: String,
    #[serde(default)]
    external_address: String,
}

fn positive_ms(v: Option<i64>) -> Option<Duration> {
    v.filter(|ms| *ms > 0).map(|ms| Duration::from_millis(ms as u64))
}

impl FileInstance {
    fn is_client(&self) -> bool {
        !self.local_address.trim().is_empty()
    }

    fn into_client(self, i: usize) -> anyhow::Result<ClientConfig> {
        let protocol = Protocol::parse(&self.protocol).with_context(|| format!("client[{i}]"))?;
        let local_address = self.local_address.trim().to_string();
        let internal_address = self.internal_address.trim().to_string();
        if local_address.is_empty() || internal_address.is_empty() {
            anyhow::bail!("client[{i}]: local_address and internal_address are required");
        }
        Ok(ClientConfig {
            name: self.name.trim().to_string(),
            protocol,
            local_address,
            internal_address,
        })
    }

    fn into_server(self, i: usize) -> anyhow::Result<ServerConfig> {
        let protocol = Protocol::parse(&self.protocol).with_context(|| format!("server[{i}]"))?;
        let internal_address = self.internal_address.trim().to_string();
        let external_address = self.external_address.trim().to_string();
        if internal_address.is_empty() || external_address.is_empty() {
            anyhow::bail!("server[{i}]: internal_address and external_address are required");
        }
        Ok(ServerConfig {
            name: self.name.trim().to_string(),
            protocol,
            internal_address,
            external_address,
        })
    }
}

impl Config {
    fn from_document(doc: FileDocument) -> anyhow::Result<Config> {
        let fc = match doc {
            FileDocument::Full(fc) => fc,
            FileDocument::Legacy(list) => {
                let (clients, servers): (Vec<_>, Vec<_>) =
                    list.into_iter().partition(FileInstance::is_client);
                FileConfig {
                    logging: None,
                    timeouts: None,
                    buffer_size: 0,
                    clients,
                    servers,
                }
            }
        };

        let mut cfg = Config::default();

        // --- Logging ---
        if let Some(l) = &fc.logging {
            if let Some(level) = l.level.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                cfg.logging.level = level.to_ascii_lowercase();
            }
            if let Some(format) = l.format.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                cfg.logging.format = format.to_ascii_lowercase();
            }
            if let Some(out) = l.output.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                cfg.logging.output = out.to_string();
            }
            cfg.logging.add_source = l.add_source;
        }

        // --- Timeouts ---
        if let Some(t) = &fc.timeouts {
            let s = &mut cfg.settings;
            if let Some(d) = positive_ms(t.internal_idle_timeout_ms) {
                s.internal_idle_timeout = d;
                s.keep_alive_interval = d / 2;
            }
            if let Some(d) = positive_ms(t.keep_alive_interval_ms) {
                s.keep_alive_interval = d;
            }
            if let Some(d) = positive_ms(t.udp_heartbeat_interval_ms) {
                s.udp_heartbeat_interval = d;
            }
            if let Some(d) = positive_ms(t.udp_session_idle_ms) {
                s.udp_session_idle = d;
            }
            if let Some(d) = positive_ms(t.reaccept_backoff_ms) {
                s.reaccept_backoff = d;
            }
            if let Some(d) = positive_ms(t.dial_timeout_ms) {
                s.dial_timeout = d;
            }
            if let Some(d) = positive_ms(t.restart_delay_ms) {
                s.restart_delay = d;
            }
            if s.keep_alive_interval >= s.internal_idle_timeout {
                anyhow::bail!(
                    "config: keep_alive_interval ({}) must be shorter than internal_idle_timeout ({})",
                    humantime::format_duration(s.keep_alive_interval),
                    humantime::format_duration(s.internal_idle_timeout)
                );
            }
        }
        if fc.buffer_size > i64::from(MAX_FRAME_PAYLOAD) {
            anyhow::bail!(
                "config: buffer_size ({}) exceeds the maximum frame payload ({MAX_FRAME_PAYLOAD})",
                fc.buffer_size
            );
        }
        if fc.buffer_size > 0 {
            cfg.settings.buffer_size = fc.buffer_size as usize;
        }

        // --- Instances ---
        for (i, c) in fc.clients.into_iter().enumerate() {
            cfg.clients.push(c.into_client(i)?);
        }
        for (i, s) in fc.servers.into_iter().enumerate() {
            cfg.servers.push(s.into_server(i)?);
        }

        Ok(cfg)
    }
}
