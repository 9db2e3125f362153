use anyhow::{Context, Result, bail};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

// =============================================================================
// File config (figment-deserialized from defaults / clarvis.toml / env vars)
// =============================================================================
//
//   clarvis.toml:    [backend]
//                    url = "http://localhost:3100"
//
//   env var:         CLARVIS_BACKEND__URL=http://localhost:3100
//
//   (double underscore = nesting, single underscore stays within field names:
//    CLARVIS_BROWSE__ALLOWED_ROOTS=/home/u,/srv)

pub const DEFAULT_CONFIG_FILE: &str = "clarvis.toml";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub backend: BackendFileConfig,
    #[serde(default)]
    pub browse: BrowseFileConfig,
}

/// Listener settings (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory of built UI assets served for non-API paths.
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            static_dir: None,
        }
    }
}

/// Where the agent-session service listens (lives under `[backend]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendFileConfig {
    #[serde(default = "default_backend_url")]
    pub url: String,
}

impl Default for BackendFileConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
        }
    }
}

/// Directory listing allow-list (lives under `[browse]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BrowseFileConfig {
    /// Comma-separated absolute paths. Unset means the user's home directory.
    #[serde(default)]
    pub allowed_roots: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_backend_url() -> String {
    "http://localhost:3100".to_string()
}

/// Layers struct defaults → `config_file` → `CLARVIS_*` env vars.
pub fn load_config(config_file: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("CLARVIS_").split("__"))
}

// =============================================================================
// Resolved config
// =============================================================================

/// Command-line values that take priority over the file and env layers.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub backend: Url,
    pub static_dir: Option<PathBuf>,
    pub allowed_roots: Vec<PathBuf>,
}

impl ProxyConfig {
    pub fn from_file(fc: &FileConfig, overrides: &Overrides) -> Result<Self> {
        let host = overrides.host.as_deref().unwrap_or(&fc.server.host);
        let port = overrides.port.unwrap_or(fc.server.port);
        let listen = format!("{}:{}", host, port)
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address {}:{}", host, port))?;

        let backend = Url::parse(&fc.backend.url)
            .with_context(|| format!("Invalid backend url {}", fc.backend.url))?;
        if backend.scheme() != "http" {
            bail!("Backend url must use http://, got {}", fc.backend.url);
        }
        if backend.host_str().is_none() {
            bail!("Backend url has no host: {}", fc.backend.url);
        }

        Ok(Self {
            listen,
            backend,
            static_dir: fc.server.static_dir.clone(),
            allowed_roots: parse_allowed_roots(fc.browse.allowed_roots.as_deref()),
        })
    }

    /// `host:port` of the backend, as used for the `Host` header and TCP connects.
    pub fn backend_authority(&self) -> String {
        let host = self.backend.host_str().unwrap_or("localhost");
        match self.backend.port_or_known_default() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }
}

/// Splits a comma-separated root list. Falls back to the home directory (or
/// `/` when there is none) if nothing usable is given.
pub fn parse_allowed_roots(raw: Option<&str>) -> Vec<PathBuf> {
    let roots: Vec<PathBuf> = raw
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect();
    if !roots.is_empty() {
        return roots;
    }
    vec![dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))]
}
