pub mod basic;
pub mod negotiate;

use anyhow::{Context, Result};

use crate::config::{Mode, ProxyConfig};
use crate::proxy::http1::Headers;

pub const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";

/// Produces the `Proxy-Authorization` value for the upstream proxy.
///
/// Tokens are minted fresh on every call; nothing is cached at this layer.
pub enum AuthProvider {
    /// Native negotiate provider with the current user's credentials.
    Auto(negotiate::Negotiate),
    /// Explicit Kerberos principal against the rendered profile.
    Manual(negotiate::Negotiate),
    /// Static Basic credentials; no network I/O.
    Basic { user: String, password: String },
}

impl AuthProvider {
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        match config.mode {
            Mode::Auto => Ok(AuthProvider::Auto(negotiate::Negotiate::current_user(
                config.upstream_host(),
            ))),
            Mode::Manual => Ok(AuthProvider::Manual(
                negotiate::Negotiate::with_profile(config)
                    .context("cannot initialize Kerberos client")?,
            )),
            Mode::Basic => Ok(AuthProvider::Basic {
                user: config.auth.user.clone(),
                password: config.auth.password.clone().unwrap_or_default(),
            }),
        }
    }

    /// Set `Proxy-Authorization` on `headers`, replacing any value the client
    /// supplied. The upstream must see exactly one copy of the header.
    pub fn attach(&self, headers: &mut Headers) -> Result<()> {
        let value = self.header_value()?;
        headers.set(PROXY_AUTHORIZATION, &value);
        Ok(())
    }

    pub fn header_value(&self) -> Result<String> {
        match self {
            AuthProvider::Auto(negotiate) => negotiate
                .header_value()
                .context("cannot mint Negotiate token (auto mode)"),
            AuthProvider::Manual(negotiate) => negotiate
                .header_value()
                .context("cannot mint Negotiate token (manual mode)"),
            AuthProvider::Basic { user, password } => Ok(basic::header_value(user, password)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct StubSource(Vec<u8>);

    impl negotiate::TokenSource for StubSource {
        fn mint(&self, _service_principal: &str) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_basic_header_value() {
        let provider = AuthProvider::Basic {
            user: "test_user".into(),
            password: "test_password".into(),
        };
        assert_eq!(
            provider.header_value().unwrap(),
            "Basic dGVzdF91c2VyOnRlc3RfcGFzc3dvcmQ="
        );
    }

    #[test]
    fn test_attach_replaces_client_header() {
        let provider = AuthProvider::Basic {
            user: "test_user".into(),
            password: "test_password".into(),
        };
        let mut headers = Headers::new();
        headers.append("Proxy-Authorization", "Basic c3B5OnNweQ==");
        headers.append("Host", "example.com");

        provider.attach(&mut headers).unwrap();

        let values: Vec<&str> = headers.get_all(PROXY_AUTHORIZATION).collect();
        assert_eq!(values, vec!["Basic dGVzdF91c2VyOnRlc3RfcGFzc3dvcmQ="]);
    }

    #[test]
    fn test_negotiate_header_value() {
        let negotiate = negotiate::Negotiate::with_source(
            "proxy.evil.corp",
            Arc::new(StubSource(b"kerberos_test_token".to_vec())),
        );
        let provider = AuthProvider::Manual(negotiate);
        assert_eq!(
            provider.header_value().unwrap(),
            "Negotiate a2VyYmVyb3NfdGVzdF90b2tlbg=="
        );
    }
}
