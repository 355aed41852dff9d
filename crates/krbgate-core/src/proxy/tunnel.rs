/// Bidirectional byte-pump for established CONNECT tunnels.
///
/// Two concurrent one-way copies with TCP half-close discipline: when one
/// direction reaches EOF or fails, the destination's write side is shut down
/// so the peer observes end-of-stream, then the source's read side is closed.
/// Both directions report on a single-slot channel; the caller waits for both.

use socket2::SockRef;
use std::io;
use std::net::Shutdown;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error};

const COPY_BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "client->upstream",
            Direction::UpstreamToClient => "upstream->client",
        }
    }
}

/// Final tally of one tunnel.
#[derive(Debug)]
pub struct TunnelOutcome {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    /// First error reported by either direction, if any.
    pub error: Option<io::Error>,
}

/// Copy traffic between `client` and `upstream` until both directions finish.
///
/// `client_residue` and `upstream_residue` are bytes already consumed from
/// the sockets by head parsing; they are relayed before raw copying starts.
/// `client_idle`/`upstream_idle` bound how long a read on the respective
/// source may sit idle. Both sockets are fully closed when this returns.
pub async fn run(
    client: TcpStream,
    upstream: TcpStream,
    client_residue: Vec<u8>,
    upstream_residue: Vec<u8>,
    client_idle: Option<Duration>,
    upstream_idle: Option<Duration>,
) -> TunnelOutcome {
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let (tx, mut rx) = mpsc::channel::<(Direction, u64, io::Result<()>)>(1);

    // The guards tie the pump tasks to this future: if the owning request is
    // cancelled, both tasks die with it and the sockets close.
    let _client_pump = AbortOnDrop(tokio::spawn(pump(
        client_read,
        upstream_write,
        client_residue,
        client_idle,
        Direction::ClientToUpstream,
        tx.clone(),
    )));
    let _upstream_pump = AbortOnDrop(tokio::spawn(pump(
        upstream_read,
        client_write,
        upstream_residue,
        upstream_idle,
        Direction::UpstreamToClient,
        tx,
    )));

    let mut outcome = TunnelOutcome {
        client_to_upstream: 0,
        upstream_to_client: 0,
        error: None,
    };

    for _ in 0..2 {
        match rx.recv().await {
            Some((direction, bytes, result)) => {
                match direction {
                    Direction::ClientToUpstream => outcome.client_to_upstream = bytes,
                    Direction::UpstreamToClient => outcome.upstream_to_client = bytes,
                }
                if let Err(e) = result {
                    debug!(direction = direction.as_str(), error = %e, "tunnel copy finished with error");
                    if outcome.error.is_none() {
                        outcome.error = Some(e);
                    }
                }
            }
            None => break,
        }
    }

    outcome
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One copy direction. Owns its halves; when the copy ends the destination's
/// write side and the source's read side are closed, whatever the result.
async fn pump(
    mut src: OwnedReadHalf,
    mut dst: OwnedWriteHalf,
    residue: Vec<u8>,
    idle: Option<Duration>,
    direction: Direction,
    tx: mpsc::Sender<(Direction, u64, io::Result<()>)>,
) {
    let (bytes, result) = copy_half(&mut src, &mut dst, residue, idle).await;

    if let Err(e) = dst.shutdown().await {
        if e.kind() == io::ErrorKind::NotConnected {
            debug!(direction = direction.as_str(), error = %e, "cannot close write side");
        } else {
            error!(direction = direction.as_str(), error = %e, "cannot close write side");
        }
    }
    if let Err(e) = SockRef::from(src.as_ref()).shutdown(Shutdown::Read) {
        if e.kind() == io::ErrorKind::NotConnected {
            debug!(direction = direction.as_str(), error = %e, "cannot close read side");
        } else {
            error!(direction = direction.as_str(), error = %e, "cannot close read side");
        }
    }

    let _ = tx.send((direction, bytes, result)).await;
}

async fn copy_half(
    src: &mut OwnedReadHalf,
    dst: &mut OwnedWriteHalf,
    residue: Vec<u8>,
    idle: Option<Duration>,
) -> (u64, io::Result<()>) {
    let mut total = 0u64;

    if !residue.is_empty() {
        if let Err(e) = dst.write_all(&residue).await {
            return (total, Err(e));
        }
        total += residue.len() as u64;
    }

    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let read = match idle {
            Some(limit) => match tokio::time::timeout(limit, src.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    return (
                        total,
                        Err(io::Error::new(io::ErrorKind::TimedOut, "tunnel idle timeout")),
                    )
                }
            },
            None => src.read(&mut buf).await,
        };

        match read {
            Ok(0) => return (total, Ok(())),
            Ok(n) => {
                if let Err(e) = dst.write_all(&buf[..n]).await {
                    return (total, Err(e));
                }
                total += n as u64;
            }
            Err(e) => return (total, Err(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        (connect.await.unwrap(), accepted)
    }

    #[tokio::test]
    async fn test_tunnel_relays_and_half_closes() {
        let (client_far, client_near) = socket_pair().await;
        let (upstream_near, upstream_far) = socket_pair().await;

        let tunnel = tokio::spawn(run(
            client_near,
            upstream_near,
            Vec::new(),
            Vec::new(),
            None,
            None,
        ));

        // Client writes, then closes its write side.
        let (mut client_read, mut client_write) = client_far.into_split();
        client_write.write_all(b"ping").await.unwrap();
        client_write.shutdown().await.unwrap();

        // Far upstream end sees the bytes, then EOF within one roundtrip.
        let (mut upstream_read, mut upstream_write) = upstream_far.into_split();
        let mut received = Vec::new();
        upstream_read.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");

        // Upstream answers and closes; the client side sees EOF too.
        upstream_write.write_all(b"pong-pong").await.unwrap();
        upstream_write.shutdown().await.unwrap();

        let mut answered = Vec::new();
        client_read.read_to_end(&mut answered).await.unwrap();
        assert_eq!(answered, b"pong-pong");

        let outcome = tunnel.await.unwrap();
        assert!(outcome.error.is_none());
        assert_eq!(outcome.client_to_upstream, 4);
        assert_eq!(outcome.upstream_to_client, 9);
    }

    #[tokio::test]
    async fn test_tunnel_flushes_residue_first() {
        let (client_far, client_near) = socket_pair().await;
        let (upstream_near, upstream_far) = socket_pair().await;

        let tunnel = tokio::spawn(run(
            client_near,
            upstream_near,
            b"early-hello".to_vec(),
            Vec::new(),
            None,
            None,
        ));

        drop(client_far);

        let (mut upstream_read, upstream_write) = upstream_far.into_split();
        let mut received = Vec::new();
        upstream_read.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"early-hello");

        // Close the far upstream end so the answering direction ends too.
        drop(upstream_write);

        let outcome = tunnel.await.unwrap();
        assert_eq!(outcome.client_to_upstream, 11);
    }

    #[tokio::test]
    async fn test_tunnel_idle_timeout() {
        let (_client_far, client_near) = socket_pair().await;
        let (upstream_near, _upstream_far) = socket_pair().await;

        let outcome = run(
            client_near,
            upstream_near,
            Vec::new(),
            Vec::new(),
            Some(Duration::from_millis(50)),
            Some(Duration::from_millis(50)),
        )
        .await;

        let err = outcome.error.expect("idle tunnel must time out");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
