pub mod connect;
pub mod forward;
pub mod http1;
pub mod tunnel;

use anyhow::{Context, Result};
use futures::FutureExt;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::auth::AuthProvider;
use crate::config::{duration, ProxyConfig};
use crate::rules::NoProxy;
use crate::stats::ConnectionRegistry;

use self::forward::LoopAction;
use self::http1::{read_request_head, write_simple_response, RequestHead};

/// How long in-flight requests may take to finish after shutdown is requested.
const DRAIN_DEADLINE: Duration = Duration::from_secs(60);

static CONN_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_conn_id() -> String {
    format!("conn-{}", CONN_COUNTER.fetch_add(1, Ordering::Relaxed))
}

// ---------------------------------------------------------------------------
// Proxy front-end
// ---------------------------------------------------------------------------

/// The local authenticating proxy: listener, dispatcher and lifecycle.
pub struct Proxy {
    pub(crate) config: Arc<ProxyConfig>,
    pub(crate) auth: Arc<AuthProvider>,
    pub(crate) no_proxy: NoProxy,
    pub(crate) stats: Arc<ConnectionRegistry>,
    shutdown_tx: watch::Sender<bool>,
}

impl Proxy {
    pub fn new(config: Arc<ProxyConfig>, auth: Arc<AuthProvider>) -> Result<Self> {
        let no_proxy = NoProxy::new(&config.no_proxy).context("cannot compile no-proxy patterns")?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Proxy {
            config,
            auth,
            no_proxy,
            stats: ConnectionRegistry::new(),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.stats)
    }

    /// Bind the listening socket.
    pub async fn bind(&self) -> Result<TcpListener> {
        info!(address = %self.config.addr, "listening socket");
        TcpListener::bind(&self.config.addr)
            .await
            .with_context(|| format!("cannot listen on {}", self.config.addr))
    }

    /// Accept and serve connections until [`Proxy::shutdown`] is called, then
    /// drain in-flight requests within the drain deadline.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(address = %self.config.addr, "serving HTTP requests");

        let mut shutdown = self.shutdown_tx.subscribe();
        let mut tasks: JoinSet<()> = JoinSet::new();

        while !*shutdown.borrow_and_update() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        // Registered before the task starts, so the drain
                        // below sees every spawned connection.
                        let conn_id = next_conn_id();
                        self.stats.register(&conn_id, &peer.to_string());
                        let proxy = Arc::clone(self);
                        tasks.spawn(async move { proxy.handle_connection(conn_id, stream, peer).await });
                        // Reap tasks that already finished.
                        while let Some(result) = tasks.try_join_next() {
                            if let Err(e) = result {
                                if e.is_panic() {
                                    error!(error = %e, "connection task panicked");
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "accept error");
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        drop(listener);
        info!(in_flight = self.stats.active(), "draining in-flight requests");

        if tokio::time::timeout(DRAIN_DEADLINE, self.stats.wait_idle())
            .await
            .is_err()
        {
            warn!(
                abandoned = self.stats.active(),
                "drain deadline exceeded, aborting remaining requests"
            );
        }
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        info!("proxy stopped");
        Ok(())
    }

    /// Request shutdown. Idempotent and callable from any thread.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    // -----------------------------------------------------------------------
    // Per-connection handling
    // -----------------------------------------------------------------------

    async fn handle_connection(self: Arc<Self>, conn_id: String, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = tune_socket(&stream, duration(self.config.timeouts.client.keepalive_secs)) {
            debug!(peer = %peer, error = %e, "cannot tune client socket");
        }

        debug!(peer = %peer, conn_id = %conn_id, "connection accepted");

        let mut reader = BufReader::new(stream);
        let mut first_request = true;
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let limit = if first_request {
                duration(self.config.timeouts.server.read_header_secs)
            } else {
                duration(self.config.timeouts.server.idle_secs)
            };
            first_request = false;

            // Idle connections do not hold up the shutdown drain.
            let read = tokio::select! {
                read = read_request_with_limit(&mut reader, limit) => read,
                _ = shutdown.changed() => break,
            };

            let head = match read {
                Ok(Some(head)) => head,
                Ok(None) => break,
                Err(e) => {
                    match e.downcast_ref::<io::Error>() {
                        Some(io_err)
                            if io_err.kind() == io::ErrorKind::TimedOut
                                || io_err.kind() == io::ErrorKind::UnexpectedEof
                                || is_disconnect(io_err) =>
                        {
                            debug!(peer = %peer, error = %e, "client connection ended");
                        }
                        _ => {
                            debug!(peer = %peer, error = %e, "malformed request");
                            let _ =
                                write_simple_response(&mut reader, 400, "Bad Request", None).await;
                        }
                    }
                    break;
                }
            };

            let span = info_span!(
                "request",
                http_method = %head.method,
                uri = %head.target,
                http_proto = %head.version,
                user_agent = %head.headers.get("User-Agent").unwrap_or(""),
            );

            if head.method != "CONNECT" && head.target.starts_with("http://") {
                // Plain-HTTP forwarding keeps the connection loop alive.
                let handled = AssertUnwindSafe(
                    forward::handle(self.as_ref(), &mut reader, head).instrument(span),
                )
                .catch_unwind()
                .await;

                match handled {
                    Ok(LoopAction::KeepAlive) => continue,
                    Ok(LoopAction::Close) => break,
                    Err(_) => {
                        error!(peer = %peer, "panic recovered while forwarding request");
                        let _ = write_simple_response(
                            &mut reader,
                            500,
                            "Internal Server Error",
                            None,
                        )
                        .await;
                        break;
                    }
                }
            } else {
                // Everything else goes to the tunnel engine, which itself
                // rejects non-CONNECT methods. It consumes the connection.
                let handled = AssertUnwindSafe(
                    connect::handle(self.as_ref(), &conn_id, reader, head).instrument(span),
                )
                .catch_unwind()
                .await;
                if handled.is_err() {
                    error!(peer = %peer, "panic recovered while handling CONNECT");
                }
                self.stats.deregister(&conn_id);
                return;
            }
        }

        if let Some(entry) = self.stats.deregister(&conn_id) {
            debug!(
                peer = %peer,
                conn_id = %conn_id,
                bytes_in = entry.bytes_in,
                bytes_out = entry.bytes_out,
                "connection closed"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers shared by the request paths
// ---------------------------------------------------------------------------

async fn read_request_with_limit(
    reader: &mut BufReader<TcpStream>,
    limit: Option<Duration>,
) -> Result<Option<RequestHead>> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, read_request_head(reader)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out reading request head",
            )
            .into()),
        },
        None => read_request_head(reader).await,
    }
}

/// Enable TCP keep-alive with the configured period on a socket.
pub(crate) fn tune_socket(stream: &TcpStream, keepalive: Option<Duration>) -> io::Result<()> {
    if let Some(period) = keepalive {
        let keepalive = socket2::TcpKeepalive::new().with_time(period);
        socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}

/// Errors that mean the peer went away rather than something being broken.
pub(crate) fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_ids_are_unique() {
        let a = next_conn_id();
        let b = next_conn_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_is_disconnect_kinds() {
        assert!(is_disconnect(&io::Error::new(io::ErrorKind::BrokenPipe, "x")));
        assert!(is_disconnect(&io::Error::new(
            io::ErrorKind::ConnectionReset,
            "x"
        )));
        assert!(!is_disconnect(&io::Error::new(io::ErrorKind::TimedOut, "x")));
    }
}
