/// CONNECT tunnel establishment against the authenticating upstream.
///
/// The handshake is two-phase by design: the client's CONNECT is first sent
/// without credentials, and the `Proxy-Authorization` header is only attached
/// once the upstream answers 407. Some proxies drop the TCP connection right
/// after the 407; the engine then redials exactly once and replays the
/// already-authenticated request.

use anyhow::{anyhow, Context, Result};
use std::io;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::auth::PROXY_AUTHORIZATION;
use crate::config::duration;

use super::http1::{
    copy_body, discard_body, read_response_head, response_body_framing, write_request_head,
    write_response_head, write_simple_response, BodyFraming, RequestHead, ResponseHead,
};
use super::{tune_socket, tunnel, Proxy};

type Client = BufReader<TcpStream>;
type Upstream = BufReader<TcpStream>;

/// Entry point for everything that is not plain-HTTP forwarding. Owns the
/// client connection; it is closed when this returns.
pub(crate) async fn handle(proxy: &Proxy, conn_id: &str, mut client: Client, mut head: RequestHead) {
    if head.method != "CONNECT" {
        debug!(method = %head.method, "rejecting non-CONNECT request");
        let _ = write_simple_response(
            &mut client,
            405,
            "Method Not Allowed",
            Some("Method Not Allowed"),
        )
        .await;
        return;
    }

    // The upstream sees exactly one Proxy-Authorization header, and it is
    // the one this proxy mints.
    head.headers.remove(PROXY_AUTHORIZATION);

    let target = head.target.clone();
    let host = target.rsplit_once(':').map(|(h, _)| h).unwrap_or(&target);

    proxy.stats.record_target(conn_id, &target);

    if proxy.no_proxy.matches(host) {
        direct_tunnel(proxy, conn_id, client, &target).await;
        return;
    }

    establish(proxy, conn_id, client, head).await;
}

// ---------------------------------------------------------------------------
// Authenticated handshake with the upstream proxy
// ---------------------------------------------------------------------------

async fn establish(proxy: &Proxy, conn_id: &str, mut client: Client, mut head: RequestHead) {
    let timeouts = &proxy.config.timeouts.upstream;
    let read_limit = duration(timeouts.read_secs);
    let write_limit = duration(timeouts.write_secs);

    let mut authenticated = false;
    let mut reconnected = false;

    let (upstream, response) = loop {
        let mut upstream = match dial_upstream(proxy).await {
            Ok(stream) => BufReader::new(stream),
            Err(e) => {
                return fail(&mut client, e.context("cannot connect to upstream proxy")).await;
            }
        };

        // On a reconnect the header is already attached, so this write is the
        // replay of the authenticated request.
        if let Err(e) = write_head(&mut upstream, &head, write_limit).await {
            return fail(&mut client, e.context("cannot write request to upstream proxy")).await;
        }

        let response = match read_response(&mut upstream, read_limit).await {
            Ok(response) => response,
            Err(e) => {
                if authenticated && !reconnected && is_retryable(&e) {
                    // The upstream dropped the connection after its 407.
                    debug!(error = %e, "upstream closed after challenge, reconnecting once");
                    reconnected = true;
                    continue;
                }
                return fail(&mut client, e.context("cannot read response from upstream proxy"))
                    .await;
            }
        };

        if authenticated {
            break (upstream, response);
        }

        match response.status {
            200 => break (upstream, response),
            407 => {
                // The challenge body is an HTML warning page; drop it. A
                // close-delimited body means the upstream is done with this
                // connection, which the next read will surface.
                let framing = response_body_framing(&head.method, &response)
                    .unwrap_or(BodyFraming::Close);
                if framing.is_delimited() {
                    if let Err(e) = discard_body(&mut upstream, framing).await {
                        debug!(error = %e, "cannot discard challenge body");
                    }
                }

                if let Err(e) = proxy.auth.attach(&mut head.headers) {
                    return fail(&mut client, e.context("cannot set authorization header")).await;
                }
                authenticated = true;

                if let Err(e) = write_head(&mut upstream, &head, write_limit).await {
                    if !reconnected && is_retryable(&e) {
                        debug!(error = %e, "upstream closed after challenge, reconnecting once");
                        reconnected = true;
                        continue;
                    }
                    return fail(&mut client, e.context("cannot write request to upstream proxy"))
                        .await;
                }

                let response = match read_response(&mut upstream, read_limit).await {
                    Ok(response) => response,
                    Err(e) => {
                        if !reconnected && is_retryable(&e) {
                            debug!(error = %e, "upstream closed after challenge, reconnecting once");
                            reconnected = true;
                            continue;
                        }
                        return fail(
                            &mut client,
                            e.context("cannot read response from upstream proxy"),
                        )
                        .await;
                    }
                };
                break (upstream, response);
            }
            status => {
                // Anything the upstream says other than 200/407 is terminal:
                // relay it and close the client connection.
                warn!(proxy_resp_code = status, "upstream rejected CONNECT");
                relay_terminal(&mut client, upstream, &head, response).await;
                return;
            }
        }
    };

    match response.status {
        200 => open_tunnel(proxy, conn_id, client, upstream, response).await,
        status => {
            warn!(proxy_resp_code = status, "upstream did not return 200 Connection Established");
            fail(
                &mut client,
                anyhow!("upstream answered {} to authenticated CONNECT", status),
            )
            .await;
        }
    }
}

async fn dial_upstream(proxy: &Proxy) -> Result<TcpStream> {
    let addr = proxy.config.upstream_addr();
    let dial_limit = duration(proxy.config.timeouts.upstream.dial_secs)
        .unwrap_or(Duration::from_secs(10));

    let stream = tokio::time::timeout(dial_limit, TcpStream::connect(&addr))
        .await
        .map_err(|_| anyhow!("dial timeout connecting to {}", addr))?
        .with_context(|| format!("cannot connect to {}", addr))?;

    if let Err(e) = tune_socket(
        &stream,
        duration(proxy.config.timeouts.upstream.keepalive_secs),
    ) {
        debug!(error = %e, "cannot tune upstream socket");
    }

    Ok(stream)
}

async fn write_head(upstream: &mut Upstream, head: &RequestHead, limit: Option<Duration>) -> Result<()> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, write_request_head(upstream, head)).await {
            Ok(result) => result,
            Err(_) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "upstream write timeout").into())
            }
        },
        None => write_request_head(upstream, head).await,
    }
}

async fn read_response(upstream: &mut Upstream, limit: Option<Duration>) -> Result<ResponseHead> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, read_response_head(upstream)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "upstream read timeout").into()),
        },
        None => read_response_head(upstream).await,
    }
}

/// Read failures that warrant the one-shot reconnect: the upstream tore the
/// connection down rather than answering.
fn is_retryable(e: &anyhow::Error) -> bool {
    match e.downcast_ref::<io::Error>() {
        Some(io_err) => matches!(
            io_err.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::TimedOut
        ),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Relay a terminal upstream response (head and body) to the client, then let
/// the connection close.
async fn relay_terminal(
    client: &mut Client,
    mut upstream: Upstream,
    request: &RequestHead,
    mut response: ResponseHead,
) {
    response.headers.set("Connection", "close");
    if let Err(e) = write_response_head(client, &response).await {
        debug!(error = %e, "cannot relay upstream response to client");
        return;
    }
    let framing = response_body_framing(&request.method, &response).unwrap_or(BodyFraming::Close);
    if let Err(e) = copy_body(&mut upstream, client, framing).await {
        debug!(error = %e, "cannot relay upstream response body to client");
    }
}

/// S6: answer the client with the upstream's 200 and start pumping bytes.
async fn open_tunnel(
    proxy: &Proxy,
    conn_id: &str,
    mut client: Client,
    upstream: Upstream,
    response: ResponseHead,
) {
    // A 200 to CONNECT carries no body; relay the head as-is.
    if let Err(e) = write_response_head(&mut client, &response).await {
        debug!(error = %e, "cannot write CONNECT response to client");
        return;
    }

    let upstream_residue = upstream.buffer().to_vec();
    let upstream_stream = upstream.into_inner();
    let client_residue = client.buffer().to_vec();
    let client_stream = client.into_inner();

    debug!("CONNECT tunnel opened");

    let outcome = tunnel::run(
        client_stream,
        upstream_stream,
        client_residue,
        upstream_residue,
        duration(proxy.config.timeouts.client.read_secs),
        duration(proxy.config.timeouts.upstream.read_secs),
    )
    .await;

    proxy
        .stats
        .record_transfer(conn_id, outcome.upstream_to_client, outcome.client_to_upstream);

    match outcome.error {
        None => debug!(
            bytes_out = outcome.client_to_upstream,
            bytes_in = outcome.upstream_to_client,
            "CONNECT tunnel closed"
        ),
        Some(e) => debug!(
            bytes_out = outcome.client_to_upstream,
            bytes_in = outcome.upstream_to_client,
            error = %e,
            "CONNECT tunnel closed with error"
        ),
    }
}

/// Direct tunnel for `no-proxy` targets: no upstream, no credentials.
async fn direct_tunnel(proxy: &Proxy, conn_id: &str, mut client: Client, target: &str) {
    let dial_limit = duration(proxy.config.timeouts.upstream.dial_secs)
        .unwrap_or(Duration::from_secs(10));

    let origin = match tokio::time::timeout(dial_limit, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return fail(
                &mut client,
                anyhow!(e).context(format!("cannot connect to {}", target)),
            )
            .await;
        }
        Err(_) => {
            return fail(&mut client, anyhow!("dial timeout connecting to {}", target)).await;
        }
    };

    let established = ResponseHead {
        version: "HTTP/1.1".to_string(),
        status: 200,
        reason: "Connection Established".to_string(),
        headers: Default::default(),
    };
    if let Err(e) = write_response_head(&mut client, &established).await {
        debug!(error = %e, "cannot write CONNECT response to client");
        return;
    }

    let client_residue = client.buffer().to_vec();
    let client_stream = client.into_inner();

    debug!(target = %target, "direct tunnel opened");

    let outcome = tunnel::run(
        client_stream,
        origin,
        client_residue,
        Vec::new(),
        duration(proxy.config.timeouts.client.read_secs),
        duration(proxy.config.timeouts.upstream.read_secs),
    )
    .await;

    proxy
        .stats
        .record_transfer(conn_id, outcome.upstream_to_client, outcome.client_to_upstream);

    debug!(target = %target, "direct tunnel closed");
}

/// S7: anything that goes wrong before the tunnel is a synthetic 502 written
/// through the client's buffered writer.
async fn fail(client: &mut Client, err: anyhow::Error) {
    error!(error = %format!("{:#}", err), "CONNECT failed");
    if let Err(e) = write_simple_response(client, 502, "Bad Gateway", None).await {
        debug!(error = %e, "cannot write 502 to client");
    }
}
