// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TCP round-robin load balancer in front of the control plane.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::future::try_join_all;
use slog::{debug, info, warn, Logger};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Upstreams of a single listening port.
#[derive(Debug)]
pub struct Route {
    upstreams: Vec<SocketAddr>,
    next: AtomicUsize,
}

impl Route {
    pub fn new(upstreams: Vec<SocketAddr>) -> Self {
        Self { upstreams, next: AtomicUsize::new(0) }
    }

    /// Upstreams in the order the next connection should try them: the
    /// round-robin pick first, then the others as fallback.
    pub fn candidates(&self) -> Vec<SocketAddr> {
        let n = self.upstreams.len();
        if n == 0 {
            return Vec::new();
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % n;
        (0..n).map(|i| self.upstreams[(start + i) % n]).collect()
    }

    async fn dial(&self, log: &Logger) -> Result<TcpStream> {
        for upstream in self.candidates() {
            match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(upstream))
                .await
            {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    debug!(log, "upstream unreachable"; "upstream" => %upstream, "error" => %e)
                }
                Err(_) => {
                    debug!(log, "upstream dial timed out"; "upstream" => %upstream)
                }
            }
        }
        bail!("no upstream reachable")
    }
}

/// One listener per port, each balancing over `upstreams` on the same port.
pub async fn serve(
    log: Logger,
    bind: IpAddr,
    upstreams: &[IpAddr],
    ports: &[u16],
    cancel: CancellationToken,
) -> Result<()> {
    let listeners = ports.iter().map(|port| {
        let route = Arc::new(Route::new(
            upstreams.iter().map(|ip| SocketAddr::new(*ip, *port)).collect(),
        ));
        let addr = SocketAddr::new(bind, *port);
        let log = log.new(slog::o!("port" => *port));
        let cancel = cancel.clone();
        async move {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to listen on {addr}"))?;
            info!(log, "load balancer listening"; "addr" => %addr);
            serve_route(log, listener, route, cancel).await
        }
    });
    try_join_all(listeners).await.map(drop)
}

pub(crate) async fn serve_route(
    log: Logger,
    listener: TcpListener,
    route: Arc<Route>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let (mut client, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(log, "accept failed"; "error" => %e);
                    continue;
                }
            },
        };
        let route = route.clone();
        let log = log.clone();
        tokio::spawn(async move {
            let mut upstream = match route.dial(&log).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(log, "dropping connection"; "peer" => %peer, "error" => %e);
                    return;
                }
            };
            match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                Ok((up, down)) => {
                    debug!(log, "connection closed";
                        "peer" => %peer, "sent" => up, "received" => down)
                }
                Err(e) => debug!(log, "connection error"; "peer" => %peer, "error" => %e),
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn candidates_rotate() {
        let a: SocketAddr = "10.5.0.2:6443".parse().unwrap();
        let b: SocketAddr = "10.5.0.3:6443".parse().unwrap();
        let c: SocketAddr = "10.5.0.4:6443".parse().unwrap();
        let route = Route::new(vec![a, b, c]);
        assert_eq!(route.candidates(), vec![a, b, c]);
        assert_eq!(route.candidates(), vec![b, c, a]);
        assert_eq!(route.candidates(), vec![c, a, b]);
        assert_eq!(route.candidates(), vec![a, b, c]);
        assert!(Route::new(vec![]).candidates().is_empty());
    }

    async fn echo_server(tag: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut s, _) = listener.accept().await.unwrap();
                s.write_all(tag).await.unwrap();
            }
        });
        addr
    }

    async fn fetch(addr: SocketAddr) -> Vec<u8> {
        let mut s = TcpStream::connect(addr).await.unwrap();
        let mut buf = vec![0u8; 1];
        s.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn balances_and_skips_dead_upstreams() {
        let a = echo_server(b"a").await;
        let b = echo_server(b"b").await;
        // Bound then dropped, so nothing listens there.
        let dead = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve_route(
            crate::test_logger(),
            listener,
            Arc::new(Route::new(vec![a, dead, b])),
            cancel.clone(),
        ));

        assert_eq!(fetch(addr).await, b"a");
        // The dead upstream's turn falls through to the next one.
        assert_eq!(fetch(addr).await, b"b");
        assert_eq!(fetch(addr).await, b"b");
        assert_eq!(fetch(addr).await, b"a");

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
