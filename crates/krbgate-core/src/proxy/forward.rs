/// Plain-HTTP request forwarding through the upstream proxy.
///
/// Requests arrive in absolute form. A fresh upstream connection is dialed
/// per request; bodies are streamed in both directions with their original
/// framing, never buffered whole. `no-proxy` targets are dialed directly and
/// get the origin-form request without credentials.

use anyhow::{Context, Result};
use std::io;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{debug, error};
use url::Url;

use crate::auth::PROXY_AUTHORIZATION;
use crate::config::duration;

use super::http1::{
    copy_body, read_response_head, request_body_framing, response_body_framing,
    strip_hop_by_hop, wants_close, write_request_head, write_response_head,
    write_simple_response, RequestHead,
};
use super::{is_disconnect, tune_socket, Proxy};

type Client = BufReader<TcpStream>;

/// What the connection loop should do after this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopAction {
    KeepAlive,
    Close,
}

pub(crate) async fn handle(proxy: &Proxy, client: &mut Client, head: RequestHead) -> LoopAction {
    debug!("request started");
    let action = forward(proxy, client, head).await;
    debug!("request completed");
    action
}

async fn forward(proxy: &Proxy, client: &mut Client, mut head: RequestHead) -> LoopAction {
    let url = match Url::parse(&head.target) {
        Ok(url) => url,
        Err(e) => {
            debug!(error = %e, "unparsable request target");
            let _ = write_simple_response(client, 400, "Bad Request", None).await;
            return LoopAction::Close;
        }
    };
    let host = url.host_str().unwrap_or_default().to_string();
    if host.is_empty() {
        let _ = write_simple_response(client, 400, "Bad Request", None).await;
        return LoopAction::Close;
    }

    let request_framing = match request_body_framing(&head) {
        Ok(framing) => framing,
        Err(e) => {
            debug!(error = %e, "unparsable request framing");
            let _ = write_simple_response(client, 400, "Bad Request", None).await;
            return LoopAction::Close;
        }
    };
    let client_wants_close = wants_close(&head.headers, &head.version);

    strip_hop_by_hop(&mut head.headers);

    // Route: upstream proxy by default, direct dial for no-proxy targets.
    let direct = proxy.no_proxy.matches(&host);
    let dial_addr = if direct {
        head.target = origin_form(&url);
        head.headers.remove(PROXY_AUTHORIZATION);
        format!("{}:{}", host, url.port_or_known_default().unwrap_or(80))
    } else {
        if let Err(e) = proxy.auth.attach(&mut head.headers) {
            error!(error = %format!("{:#}", e), "cannot set authorization header");
            let _ = write_simple_response(client, 502, "Bad Gateway", None).await;
            return LoopAction::Close;
        }
        proxy.config.upstream_addr()
    };

    if !head.headers.contains("Host") {
        head.headers.append("Host", &authority(&url, &host));
    }

    // -----------------------------------------------------------------------
    // Dial and send
    // -----------------------------------------------------------------------

    let dial_limit = duration(proxy.config.timeouts.upstream.dial_secs)
        .unwrap_or(Duration::from_secs(10));
    let upstream = match tokio::time::timeout(dial_limit, TcpStream::connect(&dial_addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            error!(error = %e, addr = %dial_addr, "cannot connect for forwarding");
            let _ = write_simple_response(client, 502, "Bad Gateway", None).await;
            return LoopAction::Close;
        }
        Err(_) => {
            error!(addr = %dial_addr, "dial timeout while forwarding");
            let _ = write_simple_response(client, 502, "Bad Gateway", None).await;
            return LoopAction::Close;
        }
    };
    if let Err(e) = tune_socket(
        &upstream,
        duration(proxy.config.timeouts.upstream.keepalive_secs),
    ) {
        debug!(error = %e, "cannot tune upstream socket");
    }
    let mut upstream = BufReader::new(upstream);

    if let Err(e) = send_request(client, &mut upstream, &head, request_framing).await {
        return handle_send_error(client, e).await;
    }

    // -----------------------------------------------------------------------
    // Relay the response
    // -----------------------------------------------------------------------

    let read_limit = duration(proxy.config.timeouts.upstream.read_secs);
    let mut response = match read_with_limit(&mut upstream, read_limit).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %format!("{:#}", e), "cannot read response while forwarding");
            let _ = write_simple_response(client, 502, "Bad Gateway", None).await;
            return LoopAction::Close;
        }
    };

    let response_framing = match response_body_framing(&head.method, &response) {
        Ok(framing) => framing,
        Err(e) => {
            error!(error = %e, "unparsable response framing");
            let _ = write_simple_response(client, 502, "Bad Gateway", None).await;
            return LoopAction::Close;
        }
    };

    let upstream_wants_close = wants_close(&response.headers, &response.version);
    let keep_alive = !client_wants_close
        && !upstream_wants_close
        && request_framing.is_delimited()
        && response_framing.is_delimited();

    strip_hop_by_hop(&mut response.headers);
    response
        .headers
        .set("Connection", if keep_alive { "keep-alive" } else { "close" });

    if let Err(e) = write_response_head(client, &response).await {
        log_client_error(&e);
        return LoopAction::Close;
    }
    if let Err(e) = copy_body(&mut upstream, client, response_framing).await {
        // Mid-body there is nothing left to answer; classify and drop.
        match e.downcast_ref::<io::Error>() {
            Some(io_err) if is_disconnect(io_err) => {
                debug!(error = %e, "proxy client disconnected")
            }
            _ => error!(error = %format!("{:#}", e), "response relay failed"),
        }
        return LoopAction::Close;
    }

    if keep_alive {
        LoopAction::KeepAlive
    } else {
        LoopAction::Close
    }
}

/// Write the rewritten head and stream the request body upstream.
async fn send_request(
    client: &mut Client,
    upstream: &mut BufReader<TcpStream>,
    head: &RequestHead,
    framing: super::http1::BodyFraming,
) -> Result<()> {
    write_request_head(upstream, head)
        .await
        .context("cannot write request to upstream")?;
    copy_body(client, upstream, framing)
        .await
        .context("cannot relay request body")?;
    Ok(())
}

async fn handle_send_error(client: &mut Client, e: anyhow::Error) -> LoopAction {
    match e.downcast_ref::<io::Error>() {
        Some(io_err) if is_disconnect(io_err) => {
            debug!(error = %e, "proxy client disconnected");
        }
        _ => {
            error!(error = %format!("{:#}", e), "cannot forward request");
            let _ = write_simple_response(client, 502, "Bad Gateway", None).await;
        }
    }
    LoopAction::Close
}

async fn read_with_limit(
    upstream: &mut BufReader<TcpStream>,
    limit: Option<Duration>,
) -> Result<super::http1::ResponseHead> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, read_response_head(upstream)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "upstream read timeout").into()),
        },
        None => read_response_head(upstream).await,
    }
}

fn log_client_error(e: &anyhow::Error) {
    match e.downcast_ref::<io::Error>() {
        Some(io_err) if is_disconnect(io_err) => debug!(error = %e, "proxy client disconnected"),
        _ => error!(error = %format!("{:#}", e), "cannot write response to client"),
    }
}

/// Origin-form target (`/path?query`) for direct dialing.
fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// `host[:port]` with the port only when it is explicit in the URL.
fn authority(url: &Url, host: &str) -> String {
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_form() {
        let url = Url::parse("http://example.com/a/b?x=1").unwrap();
        assert_eq!(origin_form(&url), "/a/b?x=1");

        let url = Url::parse("http://example.com").unwrap();
        assert_eq!(origin_form(&url), "/");
    }

    #[test]
    fn test_authority_keeps_explicit_port() {
        let url = Url::parse("http://example.com:8080/").unwrap();
        assert_eq!(authority(&url, "example.com"), "example.com:8080");

        let url = Url::parse("http://example.com/").unwrap();
        assert_eq!(authority(&url, "example.com"), "example.com");
    }
}
