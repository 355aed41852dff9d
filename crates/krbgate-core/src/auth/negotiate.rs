/// SPNEGO token minting for the `Negotiate` proxy-auth scheme.
///
/// Auto mode talks to the host's native negotiate provider (SSPI on Windows,
/// GSSAPI elsewhere) with the current user's credentials. Manual mode pins an
/// explicit client principal resolved against the Kerberos profile rendered
/// at startup.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{Kerberos, ProxyConfig};

/// Source of raw SPNEGO tokens. Split out as a seam so tests can stub token
/// minting without a reachable KDC.
pub trait TokenSource: Send + Sync {
    fn mint(&self, service_principal: &str) -> Result<Vec<u8>>;
}

/// Platform-backed token source. The mechanism is selected at compile time
/// inside cross-krb5.
struct NativeTokenSource {
    /// `user@REALM` for manual mode; `None` uses the default credentials.
    principal: Option<String>,
}

impl TokenSource for NativeTokenSource {
    fn mint(&self, service_principal: &str) -> Result<Vec<u8>> {
        use cross_krb5::{ClientCtx, InitiateFlags};

        let (_pending, token) = ClientCtx::new(
            InitiateFlags::empty(),
            self.principal.as_deref(),
            service_principal,
            None,
        )
        .context("cannot initiate security context")?;

        Ok(token.to_vec())
    }
}

/// Per-mode Negotiate state: the target SPN plus a token source. A fresh
/// token is produced for every request.
pub struct Negotiate {
    spn: String,
    source: Arc<dyn TokenSource>,
}

impl Negotiate {
    /// Current-user credentials against `HTTP/<upstream-host>`.
    pub fn current_user(upstream_host: &str) -> Self {
        Negotiate {
            spn: format!("HTTP/{}", upstream_host),
            source: Arc::new(NativeTokenSource { principal: None }),
        }
    }

    /// Explicit principal resolved against the rendered Kerberos profile.
    ///
    /// Materializes krb5.conf and exports it through the standard environment
    /// variables before the first security context is created.
    pub fn with_profile(config: &ProxyConfig) -> Result<Self> {
        let krb = config
            .kerberos
            .as_ref()
            .ok_or_else(|| anyhow!("kerberos realm and kdc are required for manual mode"))?;

        materialize_profile(krb, config.auth.keytab.as_deref())?;

        Ok(Negotiate {
            spn: format!("HTTP/{}", config.upstream_host()),
            source: Arc::new(NativeTokenSource {
                principal: Some(format!("{}@{}", config.auth.user, krb.realm)),
            }),
        })
    }

    /// Custom token source; used by tests.
    pub fn with_source(upstream_host: &str, source: Arc<dyn TokenSource>) -> Self {
        Negotiate {
            spn: format!("HTTP/{}", upstream_host),
            source,
        }
    }

    /// Mint a token and format the full header value. The value begins with
    /// `Negotiate ` and is set on the request verbatim.
    pub fn header_value(&self) -> Result<String> {
        let token = self.source.mint(&self.spn)?;
        Ok(format!("Negotiate {}", STANDARD.encode(token)))
    }

    pub fn service_principal(&self) -> &str {
        &self.spn
    }
}

/// Write the rendered krb5.conf under a private runtime directory and point
/// the MIT environment variables at it. A configured keytab becomes the
/// client keytab, so initial credentials are acquired from it on demand.
fn materialize_profile(krb: &Kerberos, keytab: Option<&Path>) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join("krbgate");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("cannot create runtime directory '{}'", dir.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
            .context("cannot restrict runtime directory permissions")?;
    }

    let path = dir.join("krb5.conf");
    std::fs::write(&path, krb.krb5_conf())
        .with_context(|| format!("cannot write '{}'", path.display()))?;

    std::env::set_var("KRB5_CONFIG", &path);
    if let Some(keytab) = keytab {
        std::env::set_var("KRB5_CLIENT_KTNAME", keytab);
    }

    Ok(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct StubSource;

    impl TokenSource for StubSource {
        fn mint(&self, service_principal: &str) -> Result<Vec<u8>> {
            assert_eq!(service_principal, "HTTP/proxy.evil.corp");
            Ok(b"kerberos_test_token".to_vec())
        }
    }

    #[test]
    fn test_header_value_is_negotiate_b64() {
        let negotiate = Negotiate::with_source("proxy.evil.corp", Arc::new(StubSource));
        assert_eq!(
            negotiate.header_value().unwrap(),
            "Negotiate a2VyYmVyb3NfdGVzdF90b2tlbg=="
        );
    }

    #[test]
    fn test_spn_shape() {
        let negotiate = Negotiate::current_user("proxy.evil.corp");
        assert_eq!(negotiate.service_principal(), "HTTP/proxy.evil.corp");
    }

    #[test]
    fn test_materialize_profile_writes_conf() {
        let krb = Kerberos {
            realm: "EVIL.CORP".into(),
            kdc: "10.0.0.1:88".into(),
        };
        let path = materialize_profile(&krb, None).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("default_realm = EVIL.CORP"));
        assert!(content.contains("kdc = 10.0.0.1:88"));
    }
}
