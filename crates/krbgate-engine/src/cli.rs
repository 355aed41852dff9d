/// Command line interface and the persisted settings file.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use krbgate_core::config::{
    ClientTimeouts, Credentials, Kerberos, Mode, ProxyConfig, ServerTimeouts, Timeouts,
    UpstreamTimeouts, DEFAULT_ADDR, DEFAULT_PING_URL, DEFAULT_STATIC_ADDR,
};
use krbgate_core::rules::NoProxy;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "krbgate",
    version,
    about = "Local forward proxy that authenticates against a corporate upstream proxy"
)]
pub struct Cli {
    /// Proxy listen address
    #[arg(short = 'a', long, default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Downstream (corporate) proxy URL, e.g. http://proxy.evil.corp:9090
    #[arg(short = 'd', long = "downstream-proxy-url")]
    pub downstream_proxy_url: Option<String>,

    /// Downstream proxy user
    #[arg(short = 'u', long = "downstream-proxy-user")]
    pub user: Option<String>,

    /// Downstream proxy password
    #[arg(short = 'p', long = "downstream-proxy-password")]
    pub password: Option<String>,

    /// Path to a keytab file for the downstream proxy user
    #[arg(short = 'k', long = "downstream-proxy-keytab")]
    pub keytab: Option<PathBuf>,

    /// Kerberos realm, e.g. EVIL.CORP
    #[arg(long = "kerberos-realm")]
    pub kerberos_realm: Option<String>,

    /// Key Distribution Center address, e.g. kdc.evil.corp:88
    #[arg(long = "kerberos-kdc")]
    pub kerberos_kdc: Option<String>,

    /// Authentication mode: auto, manual or basic
    #[arg(short = 'm', long, default_value = "auto")]
    pub mode: String,

    /// URL used to check credential validity through the upstream proxy
    #[arg(long = "ping-url", default_value = DEFAULT_PING_URL)]
    pub ping_url: String,

    /// Static server address (serves /proxy.pac and /ca.crt)
    #[arg(long = "static-addr", default_value = DEFAULT_STATIC_ADDR)]
    pub static_addr: String,

    /// HTTP server read timeout, seconds (0 disables)
    #[arg(long = "timeouts-server-read", default_value_t = 0)]
    pub server_read_secs: u64,

    /// HTTP server read header timeout, seconds
    #[arg(long = "timeouts-server-read-header", default_value_t = 30)]
    pub server_read_header_secs: u64,

    /// HTTP server write timeout, seconds (0 disables)
    #[arg(long = "timeouts-server-write", default_value_t = 0)]
    pub server_write_secs: u64,

    /// HTTP server idle timeout, seconds
    #[arg(long = "timeouts-server-idle", default_value_t = 60)]
    pub server_idle_secs: u64,

    /// Client read timeout, seconds (0 disables)
    #[arg(long = "timeouts-client-read", default_value_t = 0)]
    pub client_read_secs: u64,

    /// Client write timeout, seconds (0 disables)
    #[arg(long = "timeouts-client-write", default_value_t = 0)]
    pub client_write_secs: u64,

    /// Client keepalive period, seconds
    #[arg(long = "timeouts-client-keepalive", default_value_t = 60)]
    pub client_keepalive_secs: u64,

    /// Downstream proxy dial timeout, seconds
    #[arg(long = "timeouts-downstream-dial", default_value_t = 10)]
    pub downstream_dial_secs: u64,

    /// Downstream proxy read timeout, seconds (0 disables)
    #[arg(long = "timeouts-downstream-read", default_value_t = 0)]
    pub downstream_read_secs: u64,

    /// Downstream proxy write timeout, seconds (0 disables)
    #[arg(long = "timeouts-downstream-write", default_value_t = 0)]
    pub downstream_write_secs: u64,

    /// Downstream proxy keepalive period, seconds
    #[arg(long = "timeouts-downstream-keepalive", default_value_t = 60)]
    pub downstream_keepalive_secs: u64,

    /// Comma-separated host patterns that bypass the upstream proxy
    #[arg(long = "no-proxy")]
    pub no_proxy: Option<String>,

    /// Verbose logs
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Install the system service and persist the configuration
    #[arg(long)]
    pub install: bool,

    /// Uninstall the system service
    #[arg(long)]
    pub uninstall: bool,

    /// Run as a system service (used by the service manager)
    #[arg(long, hide = true)]
    pub service: bool,
}

// ---------------------------------------------------------------------------
// Resolved application configuration
// ---------------------------------------------------------------------------

/// Everything the process needs at runtime; also the settings.json schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub proxy: ProxyConfig,
    #[serde(default = "default_static_addr")]
    pub static_addr: String,
    #[serde(default)]
    pub verbose: bool,
}

fn default_static_addr() -> String {
    DEFAULT_STATIC_ADDR.to_string()
}

impl Cli {
    pub fn into_config(self) -> Result<AppConfig> {
        let upstream = self
            .downstream_proxy_url
            .ok_or_else(|| anyhow!("downstream proxy URL is required"))?;
        let upstream_url = Url::parse(&upstream)
            .map_err(|_| anyhow!("incorrect URL format, you are probably passing it without http://"))?;

        let ping_url = Url::parse(&self.ping_url).context("cannot parse ping URL")?;
        let mode = Mode::from_str(&self.mode)?;

        let kerberos = match (self.kerberos_realm, self.kerberos_kdc) {
            (None, None) => None,
            (realm, kdc) => Some(Kerberos {
                realm: realm.unwrap_or_default(),
                kdc: kdc.unwrap_or_default(),
            }),
        };

        let proxy = ProxyConfig {
            addr: self.addr,
            upstream_url,
            ping_url,
            mode,
            auth: Credentials {
                user: self.user.unwrap_or_default(),
                password: self.password,
                keytab: self.keytab,
            },
            kerberos,
            timeouts: Timeouts {
                server: ServerTimeouts {
                    read_secs: self.server_read_secs,
                    read_header_secs: self.server_read_header_secs,
                    write_secs: self.server_write_secs,
                    idle_secs: self.server_idle_secs,
                },
                client: ClientTimeouts {
                    read_secs: self.client_read_secs,
                    write_secs: self.client_write_secs,
                    keepalive_secs: self.client_keepalive_secs,
                },
                upstream: UpstreamTimeouts {
                    dial_secs: self.downstream_dial_secs,
                    read_secs: self.downstream_read_secs,
                    write_secs: self.downstream_write_secs,
                    keepalive_secs: self.downstream_keepalive_secs,
                },
            },
            no_proxy: self
                .no_proxy
                .as_deref()
                .map(NoProxy::parse)
                .unwrap_or_default(),
        };

        Ok(AppConfig {
            proxy,
            static_addr: self.static_addr,
            verbose: self.verbose,
        })
    }
}

// ---------------------------------------------------------------------------
// Settings file
// ---------------------------------------------------------------------------

/// Platform location of the persisted settings, written at install time.
pub fn settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("krbgate").join("settings.json"))
}

pub fn load_settings(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read settings file '{}'", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("invalid settings file '{}'", path.display()))
}

pub fn save_settings(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create '{}'", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, json)
        .with_context(|| format!("cannot write settings file '{}'", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
