/// Auxiliary static server: proxy auto-config and the upstream's root CA.
///
/// Serves `/proxy.pac` so clients can discover the proxy, and `/ca.crt` so
/// they can trust the enterprise MITM chain the upstream presents. Not part
/// of the forwarding path.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::checker::fetch_root_ca;
use crate::proxy::http1::{
    read_request_head, write_response_head, write_simple_response, Headers, ResponseHead,
};

const PAC_TEMPLATE: &str = r#"function FindProxyForURL(url, host) {
    if (isInNet(host, "127.0.0.0", "255.0.0.0")) return "DIRECT";
    else if (isInNet(host, "10.0.0.0", "255.0.0.0")) return "DIRECT";
    else if (isInNet(host, "172.16.0.0", "255.240.0.0")) return "DIRECT";
    else if (isInNet(host, "192.168.0.0", "255.255.0.0")) return "DIRECT";

    return "PROXY {proxy}; DIRECT";
}"#;

const CA_FETCH_DEADLINE: Duration = Duration::from_secs(10);
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

pub struct StaticServer {
    addr: String,
    proxy_addr: String,
    /// Host whose certificate chain is sampled for `/ca.crt`.
    ca_probe_host: String,
    shutdown_tx: watch::Sender<bool>,
}

impl StaticServer {
    pub fn new(addr: &str, proxy_addr: &str, ca_probe_host: &str) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        StaticServer {
            addr: addr.to_string(),
            proxy_addr: proxy_addr.to_string(),
            ca_probe_host: ca_probe_host.to_string(),
            shutdown_tx,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        info!(address = %self.addr, "static server listening");
        TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("cannot listen on {}", self.addr))
    }

    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(self);
                        tasks.spawn(async move {
                            if let Err(e) = server.handle_connection(stream).await {
                                debug!(peer = %peer, error = %format!("{:#}", e), "static request failed");
                            }
                        });
                        while tasks.try_join_next().is_some() {}
                    }
                    Err(e) => error!(error = %e, "static server accept error"),
                },
                _ = shutdown.changed() => break,
            }
        }

        drop(listener);
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(DRAIN_DEADLINE, drain).await.is_err() {
            warn!("static server drain deadline exceeded");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        info!("static server stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let mut client = BufReader::new(stream);

        let head = match read_request_head(&mut client).await? {
            Some(head) => head,
            None => return Ok(()),
        };

        match (head.method.as_str(), head.target.as_str()) {
            ("GET", "/proxy.pac") => {
                let body = self.pac_file();
                respond(&mut client, 200, "OK", "application/x-ns-proxy-autoconfig", &body).await
            }
            ("GET", "/ca.crt") => match self.root_ca_pem().await {
                Ok(pem) => {
                    respond(&mut client, 200, "OK", "application/x-x509-ca-cert", &pem).await
                }
                Err(e) => {
                    error!(error = %format!("{:#}", e), "cannot fetch root CA");
                    write_simple_response(
                        &mut client,
                        503,
                        "Service Unavailable",
                        Some("cannot fetch root CA through the proxy"),
                    )
                    .await
                }
            },
            _ => write_simple_response(&mut client, 404, "Not Found", Some("Not Found")).await,
        }
    }

    /// PAC file with this proxy as the only non-direct route.
    pub fn pac_file(&self) -> String {
        PAC_TEMPLATE.replace("{proxy}", &self.proxy_addr)
    }

    async fn root_ca_pem(&self) -> Result<String> {
        let der = tokio::time::timeout(
            CA_FETCH_DEADLINE,
            fetch_root_ca(&self.proxy_addr, &self.ca_probe_host),
        )
        .await
        .map_err(|_| anyhow::anyhow!("timed out fetching root CA"))??;
        Ok(pem_encode_certificate(&der))
    }
}

async fn respond(
    client: &mut BufReader<TcpStream>,
    status: u16,
    reason: &str,
    content_type: &str,
    body: &str,
) -> Result<()> {
    let mut headers = Headers::new();
    headers.set("Content-Type", content_type);
    headers.set("Content-Length", &body.len().to_string());
    headers.set("Connection", "close");
    let head = ResponseHead {
        version: "HTTP/1.1".to_string(),
        status,
        reason: reason.to_string(),
        headers,
    };
    write_response_head(client, &head).await?;
    use tokio::io::AsyncWriteExt;
    client.write_all(body.as_bytes()).await?;
    client.flush().await?;
    Ok(())
}

fn pem_encode_certificate(der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut out = String::with_capacity(encoded.len() + 64);
    out.push_str("-----BEGIN CERTIFICATE-----\n");
    let bytes = encoded.as_bytes();
    for chunk in bytes.chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push('\n');
    }
    out.push_str("-----END CERTIFICATE-----\n");
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pac_file_substitutes_proxy() {
        let server = StaticServer::new("localhost:3129", "localhost:3128", "www.google.com");
        let pac = server.pac_file();
        assert!(pac.contains("PROXY localhost:3128; DIRECT"));
        assert!(pac.contains("FindProxyForURL"));
        assert!(!pac.contains("{proxy}"));
    }

    #[test]
    fn test_pem_encoding_wraps_lines() {
        let der = vec![0u8; 100];
        let pem = pem_encode_certificate(&der);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));
        for line in pem.lines() {
            assert!(line.len() <= 64 || line.starts_with("-----"));
        }
    }
}
