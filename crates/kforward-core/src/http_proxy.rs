use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kforward_commons::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::traits::HttpLogInterceptor;

/// The Worker's own user-facing reverse proxy for an `http_log`-enabled Forward: the Kubernetes
/// tunnel is shifted onto an internal port, and this listens on the Forward's original
/// `local_port`, relaying each accepted connection into the internal one while reporting
/// connection boundaries to the interceptor.
pub async fn run_reverse_proxy(
    forward_id: String,
    user_port: u16,
    internal_port: u16,
    interceptor: Arc<dyn HttpLogInterceptor>,
    stop: CancellationToken,
) -> Result<(), Error> {
    let addr: SocketAddr = ([127, 0, 0, 1], user_port).into();
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Connect(format!("http-log proxy: binding 127.0.0.1:{user_port}: {e}")))?;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (client_stream, peer) = accepted
                    .map_err(|e| Error::Connect(format!("http-log proxy: accepting connection: {e}")))?;
                let forward_id = forward_id.clone();
                let interceptor = Arc::clone(&interceptor);
                let child = stop.child_token();
                tokio::spawn(async move {
                    relay_one(forward_id, internal_port, client_stream, peer, interceptor, child).await;
                });
            }
        }
    }
}

async fn relay_one(
    forward_id: String,
    internal_port: u16,
    mut client_stream: TcpStream,
    peer: SocketAddr,
    interceptor: Arc<dyn HttpLogInterceptor>,
    stop: CancellationToken,
) {
    let upstream = match TcpStream::connect(("127.0.0.1", internal_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("worker {forward_id}: http-log proxy could not reach internal port {internal_port}: {e}");
            return;
        }
    };

    interceptor.on_connection_opened(&forward_id, peer);

    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);
    let mut upstream = upstream;
    let result = tokio::select! {
        _ = stop.cancelled() => Ok((0, 0)),
        result = tokio::io::copy_bidirectional(&mut client_stream, &mut upstream) => result,
    };

    match result {
        Ok((from_client, from_upstream)) => {
            sent.store(from_client, Ordering::SeqCst);
            received.store(from_upstream, Ordering::SeqCst);
        }
        Err(e) => {
            log::warn!("worker {forward_id}: http-log proxy relay to peer {peer} ended: {e}");
        }
    }

    interceptor.on_connection_closed(
        &forward_id,
        sent.load(Ordering::SeqCst),
        received.load(Ordering::SeqCst),
    );
}

/// Best-effort check that a local port is free, used by Worker before shifting the Kubernetes
/// tunnel onto `local_port + 10000` for an `http_log`-enabled Forward.
pub fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct CountingInterceptor {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    impl HttpLogInterceptor for CountingInterceptor {
        fn on_connection_opened(&self, _forward_id: &str, _peer: SocketAddr) {
            self.opened.fetch_add(1, Ordering::SeqCst);
        }

        fn on_connection_closed(&self, _forward_id: &str, _bytes_sent: u64, _bytes_received: u64) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn relays_bytes_and_reports_connection_boundary() {
        let internal_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let internal_port = internal_listener.local_addr().unwrap().port();

        let echo_task = tokio::spawn(async move {
            let (mut stream, _) = internal_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let user_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let user_port = user_listener.local_addr().unwrap().port();
        drop(user_listener);

        let interceptor = Arc::new(CountingInterceptor {
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        });
        let stop = CancellationToken::new();
        let proxy_stop = stop.clone();
        let proxy_interceptor = Arc::clone(&interceptor);
        let proxy_task = tokio::spawn(async move {
            run_reverse_proxy("test".to_string(), user_port, internal_port, proxy_interceptor, proxy_stop).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut client = TcpStream::connect(("127.0.0.1", user_port)).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        echo_task.await.unwrap();
        drop(client);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        stop.cancel();
        let _ = proxy_task.await;

        assert_eq!(interceptor.opened.load(Ordering::SeqCst), 1);
        assert_eq!(interceptor.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn port_is_free_detects_bound_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!port_is_free(port));
        drop(listener);
        assert!(port_is_free(port));
    }
}
