/// Startup credential probe.
///
/// Issues the configured ping request through the proxy itself, the same way
/// a client would. The upstream usually intercepts TLS with an enterprise CA,
/// so certificate verification is disabled here. That configuration lives
/// only in this module; the forwarding path never builds a TLS client.

use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use url::Url;

use crate::proxy::http1::{
    read_response_head, write_request_head, Headers, RequestHead,
};

/// Overall deadline for one probe attempt.
const PROBE_DEADLINE: Duration = Duration::from_secs(60);

/// Check credential validity against the ping URL, going through the local
/// proxy at `proxy_addr`.
///
/// `Ok(true)` means the upstream accepted the credentials, `Ok(false)` means
/// it rejected them, `Err` means the probe could not tell.
pub async fn check_credentials(proxy_addr: &str, ping_url: &Url) -> Result<bool> {
    tokio::time::timeout(PROBE_DEADLINE, probe(proxy_addr, ping_url))
        .await
        .map_err(|_| anyhow!("credential probe timed out"))?
}

async fn probe(proxy_addr: &str, ping_url: &Url) -> Result<bool> {
    let stream = TcpStream::connect(proxy_addr)
        .await
        .with_context(|| format!("cannot connect to local proxy at {}", proxy_addr))?;

    let host = ping_url
        .host_str()
        .ok_or_else(|| anyhow!("ping URL has no host"))?
        .to_string();

    match ping_url.scheme() {
        "http" => {
            // Plain HTTP goes through the forwarder: absolute-form request,
            // the proxy attaches the credentials itself.
            let status = send_get(stream, ping_url.as_str(), &host).await?;
            Ok(status == 200)
        }
        "https" => {
            let port = ping_url.port_or_known_default().unwrap_or(443);
            let authority = format!("{}:{}", host, port);

            let (stream, status) = connect_through_proxy(stream, &authority).await?;
            if status != 200 {
                return Ok(false);
            }

            let tls = tls_connector()?
                .connect(server_name(&host)?, stream)
                .await
                .context("TLS handshake through proxy failed")?;

            let target = origin_form(ping_url);
            let status = send_get(tls, &target, &host).await?;
            Ok(status == 200)
        }
        other => bail!("unsupported ping URL scheme: {}", other),
    }
}

/// Fetch the root of the certificate chain the upstream presents, by opening
/// a tunnel through the local proxy and recording the peer certificates.
/// Returns the DER bytes of the last (root-most) certificate.
pub async fn fetch_root_ca(proxy_addr: &str, host: &str) -> Result<Vec<u8>> {
    let stream = TcpStream::connect(proxy_addr)
        .await
        .with_context(|| format!("cannot connect to local proxy at {}", proxy_addr))?;

    let authority = format!("{}:443", host);
    let (stream, status) = connect_through_proxy(stream, &authority).await?;
    if status != 200 {
        bail!("proxy refused CONNECT to {}: status {}", authority, status);
    }

    let tls = tls_connector()?
        .connect(server_name(host)?, stream)
        .await
        .context("TLS handshake through proxy failed")?;

    let (_, connection) = tls.get_ref();
    let chain = connection
        .peer_certificates()
        .ok_or_else(|| anyhow!("no peer certificates presented"))?;
    let root = chain
        .last()
        .ok_or_else(|| anyhow!("empty certificate chain"))?;

    Ok(root.as_ref().to_vec())
}

// ---------------------------------------------------------------------------
// Plumbing
// ---------------------------------------------------------------------------

/// Issue `CONNECT authority` on `stream` and return it with the status code.
async fn connect_through_proxy(stream: TcpStream, authority: &str) -> Result<(TcpStream, u16)> {
    let mut stream = BufReader::new(stream);

    let mut headers = Headers::new();
    headers.append("Host", authority);
    let head = RequestHead {
        method: "CONNECT".to_string(),
        target: authority.to_string(),
        version: "HTTP/1.1".to_string(),
        headers,
    };
    write_request_head(&mut stream, &head)
        .await
        .context("cannot send CONNECT to local proxy")?;

    let response = read_response_head(&mut stream)
        .await
        .context("cannot read CONNECT response from local proxy")?;

    // The server side of the tunnel only talks after our ClientHello, so the
    // read buffer is empty here.
    Ok((stream.into_inner(), response.status))
}

/// Send a GET for `target` and return the response status.
async fn send_get<S>(stream: S, target: &str, host: &str) -> Result<u16>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);

    let mut headers = Headers::new();
    headers.append("Host", host);
    headers.append("Connection", "close");
    let head = RequestHead {
        method: "GET".to_string(),
        target: target.to_string(),
        version: "HTTP/1.1".to_string(),
        headers,
    };
    write_request_head(&mut stream, &head)
        .await
        .context("cannot send probe request")?;

    let response = read_response_head(&mut stream)
        .await
        .context("cannot read probe response")?;
    Ok(response.status)
}

fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn server_name(host: &str) -> Result<rustls::pki_types::ServerName<'static>> {
    rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| anyhow!("invalid TLS server name: {}", host))
}

fn tls_connector() -> Result<TlsConnector> {
    Ok(TlsConnector::from(insecure_tls_config()?))
}

/// TLS client configuration that accepts any certificate. Only the probe and
/// the CA fetcher use it.
pub(crate) fn insecure_tls_config() -> Result<Arc<rustls::ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .context("cannot assemble TLS configuration")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification { provider }))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct NoVerification {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_unreachable_proxy() {
        let ping = Url::parse("http://checkip.amazonaws.com/").unwrap();
        // Nothing listens here.
        let result = check_credentials("127.0.0.1:19999", &ping).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_insecure_config_builds() {
        assert!(insecure_tls_config().is_ok());
    }

    #[test]
    fn test_origin_form_keeps_query() {
        let url = Url::parse("https://example.com/check?x=1").unwrap();
        assert_eq!(origin_form(&url), "/check?x=1");
    }
}
