use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_ADDR: &str = "localhost:3128";
pub const DEFAULT_STATIC_ADDR: &str = "localhost:3129";
pub const DEFAULT_PING_URL: &str = "https://www.google.com/";

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// How the `Proxy-Authorization` header for the upstream proxy is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Native negotiate provider with the current user's credentials.
    Auto,
    /// Explicit Kerberos principal resolved against the rendered profile.
    Manual,
    /// Static HTTP Basic credentials.
    Basic,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Manual => "manual",
            Mode::Basic => "basic",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Mode::Auto),
            "manual" => Ok(Mode::Manual),
            "basic" => Ok(Mode::Basic),
            other => Err(anyhow!("unknown mode: {}", other)),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keytab: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Kerberos {
    /// Kerberos realm, e.g. `EVIL.CORP`.
    pub realm: String,
    /// Key Distribution Center endpoint as `host:port`, e.g. `kdc.evil.corp:88`.
    pub kdc: String,
}

impl Kerberos {
    /// Render a minimal krb5.conf for this realm/KDC pair.
    ///
    /// Consumed once at startup when the manual-mode Kerberos profile is
    /// materialized.
    pub fn krb5_conf(&self) -> String {
        format!(
            "[libdefaults]\n  default_realm = {realm}\n[realms]\n  {realm} = {{\n    kdc = {kdc}\n  }}",
            realm = self.realm,
            kdc = self.kdc,
        )
    }
}

/// Front-end HTTP server timeouts, in seconds. Zero disables a timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTimeouts {
    pub read_secs: u64,
    pub read_header_secs: u64,
    pub write_secs: u64,
    pub idle_secs: u64,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        ServerTimeouts {
            read_secs: 0,
            read_header_secs: 30,
            write_secs: 0,
            idle_secs: 60,
        }
    }
}

/// Timeouts applied to the hijacked client connection of a tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTimeouts {
    pub read_secs: u64,
    pub write_secs: u64,
    pub keepalive_secs: u64,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        ClientTimeouts {
            read_secs: 0,
            write_secs: 0,
            keepalive_secs: 60,
        }
    }
}

/// Timeouts applied to connections with the upstream proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamTimeouts {
    pub dial_secs: u64,
    pub read_secs: u64,
    pub write_secs: u64,
    pub keepalive_secs: u64,
}

impl Default for UpstreamTimeouts {
    fn default() -> Self {
        UpstreamTimeouts {
            dial_secs: 10,
            read_secs: 0,
            write_secs: 0,
            keepalive_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default)]
    pub server: ServerTimeouts,
    #[serde(default)]
    pub client: ClientTimeouts,
    #[serde(default)]
    pub upstream: UpstreamTimeouts,
}

/// Convert a seconds value into an optional [`Duration`]; zero means disabled.
pub fn duration(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

// ---------------------------------------------------------------------------
// ProxyConfig
// ---------------------------------------------------------------------------

/// Immutable runtime configuration, fully validated before the proxy starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Local listen endpoint, e.g. `localhost:3128`.
    pub addr: String,

    /// Absolute URL of the upstream (corporate) proxy.
    pub upstream_url: Url,

    /// URL used by the credential probe; must be reachable through the
    /// upstream proxy.
    pub ping_url: Url,

    pub mode: Mode,

    #[serde(default)]
    pub auth: Credentials,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kerberos: Option<Kerberos>,

    #[serde(default)]
    pub timeouts: Timeouts,

    /// Host patterns that bypass the upstream proxy entirely.
    #[serde(default)]
    pub no_proxy: Vec<String>,
}

impl ProxyConfig {
    /// Hostname of the upstream proxy; guaranteed non-empty after
    /// [`ProxyConfig::validate`].
    pub fn upstream_host(&self) -> &str {
        self.upstream_url.host_str().unwrap_or_default()
    }

    /// `host:port` dial target for the upstream proxy.
    pub fn upstream_addr(&self) -> String {
        let port = self.upstream_url.port_or_known_default().unwrap_or(3128);
        format!("{}:{}", self.upstream_host(), port)
    }

    /// Reject configurations that would only fail at request time.
    pub fn validate(&self) -> Result<()> {
        if self.upstream_host().is_empty() {
            bail!("incorrect upstream URL, you are probably passing it without http://");
        }

        if let Some(keytab) = &self.auth.keytab {
            check_keytab_permissions(keytab)?;
        }

        match self.mode {
            Mode::Auto => {}
            Mode::Manual => {
                let krb = self
                    .kerberos
                    .as_ref()
                    .ok_or_else(|| anyhow!("manual mode requires the kerberos realm and kdc"))?;
                if krb.realm.is_empty() || krb.kdc.is_empty() {
                    bail!("manual mode requires the kerberos realm and kdc");
                }
                if self.auth.user.is_empty() {
                    bail!("manual mode requires a user");
                }
                if self.auth.password.is_none() && self.auth.keytab.is_none() {
                    bail!("you should pass a keytab file or at least a password");
                }
            }
            Mode::Basic => {
                if self.auth.user.is_empty() || self.auth.password.is_none() {
                    bail!("basic mode requires a user and a password");
                }
            }
        }

        Ok(())
    }

    /// Load configuration from a JSON file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file '{}'", path.display()))?;
        let config: ProxyConfig = serde_json::from_str(&content)
            .with_context(|| format!("invalid config file '{}'", path.display()))?;
        Ok(config)
    }

    /// Save configuration as indented JSON.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("cannot create config file '{}'", path.display()))?;
        file.write_all(json.as_bytes())
            .context("cannot write config file")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Keytab permission checks
// ---------------------------------------------------------------------------

/// A keytab holds long-term keys; refuse to start if other users can read it.
#[cfg(unix)]
pub fn check_keytab_permissions(keytab: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = keytab
        .parent()
        .ok_or_else(|| anyhow!("keytab path has no parent directory"))?;

    let dir_mode = std::fs::metadata(dir)
        .with_context(|| format!("cannot stat keytab directory '{}'", dir.display()))?
        .permissions()
        .mode()
        & 0o777;
    if dir_mode != 0o700 {
        bail!("keytab directory rights are too permissive");
    }

    let file_mode = std::fs::metadata(keytab)
        .with_context(|| format!("cannot stat keytab file '{}'", keytab.display()))?
        .permissions()
        .mode()
        & 0o777;
    if file_mode != 0o600 {
        bail!("keytab file rights are too permissive");
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn check_keytab_permissions(_keytab: &Path) -> Result<()> {
    // Windows has a different rights management model.
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ProxyConfig {
        ProxyConfig {
            addr: DEFAULT_ADDR.to_string(),
            upstream_url: Url::parse("http://proxy.evil.corp:9090").unwrap(),
            ping_url: Url::parse(DEFAULT_PING_URL).unwrap(),
            mode: Mode::Auto,
            auth: Credentials::default(),
            kerberos: None,
            timeouts: Timeouts::default(),
            no_proxy: Vec::new(),
        }
    }

    #[test]
    fn test_krb5_conf_rendering() {
        let krb = Kerberos {
            realm: "EVIL.CORP".into(),
            kdc: "10.0.0.1:88".into(),
        };
        let expected = "[libdefaults]\n  default_realm = EVIL.CORP\n[realms]\n  EVIL.CORP = {\n    kdc = 10.0.0.1:88\n  }";
        assert_eq!(krb.krb5_conf(), expected);
    }

    #[test]
    fn test_upstream_addr_default_port() {
        let cfg = base_config();
        assert_eq!(cfg.upstream_addr(), "proxy.evil.corp:9090");

        let mut cfg = base_config();
        cfg.upstream_url = Url::parse("http://proxy.evil.corp").unwrap();
        assert_eq!(cfg.upstream_addr(), "proxy.evil.corp:80");
    }

    #[test]
    fn test_validate_auto_needs_nothing() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_validate_basic_requires_credentials() {
        let mut cfg = base_config();
        cfg.mode = Mode::Basic;
        assert!(cfg.validate().is_err());

        cfg.auth.user = "test_user".into();
        assert!(cfg.validate().is_err());

        cfg.auth.password = Some("test_password".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_manual_requires_kerberos() {
        let mut cfg = base_config();
        cfg.mode = Mode::Manual;
        cfg.auth.user = "test_user".into();
        cfg.auth.password = Some("test_password".into());
        assert!(cfg.validate().is_err());

        cfg.kerberos = Some(Kerberos {
            realm: "EVIL.CORP".into(),
            kdc: "10.0.0.1:88".into(),
        });
        assert!(cfg.validate().is_ok());

        cfg.auth.password = None;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("keytab"));
    }

    #[test]
    fn test_json_roundtrip() {
        let mut cfg = base_config();
        cfg.mode = Mode::Basic;
        cfg.auth.user = "test_user".into();
        cfg.auth.password = Some("test_password".into());
        cfg.no_proxy = vec!["*.corp.local".into()];

        let json = serde_json::to_string_pretty(&cfg).unwrap();
        let parsed: ProxyConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.addr, cfg.addr);
        assert_eq!(parsed.mode, Mode::Basic);
        assert_eq!(parsed.upstream_url, cfg.upstream_url);
        assert_eq!(parsed.no_proxy, cfg.no_proxy);
        assert_eq!(parsed.timeouts.upstream.dial_secs, 10);
    }

    #[test]
    fn test_duration_zero_disables() {
        assert_eq!(duration(0), None);
        assert_eq!(duration(5), Some(Duration::from_secs(5)));
    }

    #[cfg(unix)]
    #[test]
    fn test_keytab_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("krbgate-keytab-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let keytab = dir.join("user.keytab");
        std::fs::write(&keytab, b"keytab").unwrap();

        // World-readable: rejected.
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).unwrap();
        std::fs::set_permissions(&keytab, std::fs::Permissions::from_mode(0o644)).unwrap();
        let err = check_keytab_permissions(&keytab).unwrap_err();
        assert!(err.to_string().contains("too permissive"));

        // Owner-only: accepted.
        std::fs::set_permissions(&keytab, std::fs::Permissions::from_mode(0o600)).unwrap();
        assert!(check_keytab_permissions(&keytab).is_ok());

        // Permissive directory: rejected even with a tight file.
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();
        let err = check_keytab_permissions(&keytab).unwrap_err();
        assert!(err.to_string().contains("too permissive"));

        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
