// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Forwarding DNS resolver for cluster nodes.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hickory_proto::op::{Message, MessageType, ResponseCode};
use slog::{debug, info, warn, Logger};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

const DNS_PORT: u16 = 53;
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// `nameserver` entries of a resolv.conf.
pub fn parse_resolv_conf(contents: &str) -> Vec<IpAddr> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.split(['#', ';']).next()?.trim();
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("nameserver"), Some(addr)) => {
                    // Drop any zone suffix of link-local addresses.
                    addr.split('%').next()?.parse().ok()
                }
                _ => None,
            }
        })
        .collect()
}

pub fn load_upstreams(resolv_conf: &Path) -> Result<Vec<SocketAddr>> {
    let contents = std::fs::read_to_string(resolv_conf)
        .with_context(|| format!("failed to read {}", resolv_conf.display()))?;
    let upstreams: Vec<_> = parse_resolv_conf(&contents)
        .into_iter()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .collect();
    if upstreams.is_empty() {
        bail!("no nameservers in {}", resolv_conf.display());
    }
    Ok(upstreams)
}

/// How a query reached the forwarder, and how it is sent upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// Something that can answer one query against one upstream.
#[async_trait::async_trait]
pub trait Exchange: Send + Sync {
    async fn exchange(
        &self,
        transport: Transport,
        upstream: SocketAddr,
        query: &[u8],
    ) -> Result<Vec<u8>>;
}

/// Exchanges a query over a fresh UDP socket or TCP connection per query.
pub struct NetExchange;

impl NetExchange {
    async fn udp(upstream: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
        let bind: SocketAddr = match upstream {
            SocketAddr::V4(_) => "0.0.0.0:0".parse()?,
            SocketAddr::V6(_) => "[::]:0".parse()?,
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(upstream).await?;
        socket.send(query).await?;
        let mut buf = vec![0u8; 4096];
        let n = socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn tcp(upstream: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
        let mut stream = TcpStream::connect(upstream).await?;
        let len = u16::try_from(query.len()).context("query too large")?;
        stream.write_u16(len).await?;
        stream.write_all(query).await?;
        let len = stream.read_u16().await? as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

#[async_trait::async_trait]
impl Exchange for NetExchange {
    async fn exchange(
        &self,
        transport: Transport,
        upstream: SocketAddr,
        query: &[u8],
    ) -> Result<Vec<u8>> {
        let answer = match transport {
            Transport::Udp => {
                tokio::time::timeout(UPSTREAM_TIMEOUT, Self::udp(upstream, query)).await
            }
            Transport::Tcp => {
                tokio::time::timeout(UPSTREAM_TIMEOUT, Self::tcp(upstream, query)).await
            }
        };
        answer.context("upstream timed out")?
    }
}

pub struct Forwarder {
    upstreams: Vec<SocketAddr>,
    exchange: Box<dyn Exchange>,
    log: Logger,
}

fn servfail(query: &Message) -> Message {
    let mut resp = Message::new();
    resp.set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::ServFail);
    resp.add_queries(query.queries().to_vec());
    resp
}

impl Forwarder {
    pub fn new(log: Logger, upstreams: Vec<SocketAddr>, exchange: Box<dyn Exchange>) -> Self {
        Self { upstreams, exchange, log }
    }

    /// Ask `upstream` over UDP. A truncated answer to a query that came in
    /// over TCP is fetched again over TCP, since the client cannot retry.
    async fn ask(
        &self,
        upstream: SocketAddr,
        query: &[u8],
        client: Transport,
    ) -> Result<Vec<u8>> {
        let answer = self.exchange.exchange(Transport::Udp, upstream, query).await?;
        let truncated = Message::from_vec(&answer).map(|m| m.truncated()).unwrap_or(false);
        if client == Transport::Tcp && truncated {
            debug!(self.log, "truncated answer, retrying over TCP"; "upstream" => %upstream);
            return self.exchange.exchange(Transport::Tcp, upstream, query).await;
        }
        Ok(answer)
    }

    /// Try each upstream in order, skipping SERVFAIL and REFUSED answers.
    /// When none answers usefully the client gets SERVFAIL.
    pub async fn resolve(&self, query: &[u8], client: Transport) -> Result<Vec<u8>> {
        let parsed = Message::from_vec(query).context("malformed query")?;
        for upstream in &self.upstreams {
            let answer = match self.ask(*upstream, query, client).await {
                Ok(a) => a,
                Err(e) => {
                    debug!(self.log, "upstream failed"; "upstream" => %upstream, "error" => %e);
                    continue;
                }
            };
            match Message::from_vec(&answer) {
                Ok(msg)
                    if matches!(
                        msg.response_code(),
                        ResponseCode::ServFail | ResponseCode::Refused
                    ) =>
                {
                    debug!(self.log, "retrying after upstream error";
                        "upstream" => %upstream, "rcode" => %msg.response_code());
                }
                Ok(_) => return Ok(answer),
                Err(e) => {
                    debug!(self.log, "malformed upstream answer";
                        "upstream" => %upstream, "error" => %e);
                }
            }
        }
        Ok(servfail(&parsed).to_vec()?)
    }
}

pub async fn serve_udp(
    forwarder: Arc<Forwarder>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let socket = Arc::new(
        UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind UDP {addr}"))?,
    );
    info!(forwarder.log, "DNS listening"; "proto" => "udp", "addr" => %addr);
    let mut buf = vec![0u8; 4096];
    loop {
        let (n, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = socket.recv_from(&mut buf) => res?,
        };
        let query = buf[..n].to_vec();
        let socket = socket.clone();
        let forwarder = forwarder.clone();
        tokio::spawn(async move {
            match forwarder.resolve(&query, Transport::Udp).await {
                Ok(answer) => {
                    if let Err(e) = socket.send_to(&answer, peer).await {
                        debug!(forwarder.log, "send failed"; "peer" => %peer, "error" => %e);
                    }
                }
                Err(e) => debug!(forwarder.log, "dropping query"; "peer" => %peer, "error" => %e),
            }
        });
    }
}

async fn handle_tcp(forwarder: &Forwarder, mut stream: TcpStream) -> Result<()> {
    loop {
        let len = match stream.read_u16().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(())
            }
            Err(e) => return Err(e.into()),
        };
        let mut query = vec![0u8; len];
        stream.read_exact(&mut query).await?;
        let answer = forwarder.resolve(&query, Transport::Tcp).await?;
        let len = u16::try_from(answer.len()).context("answer too large")?;
        stream.write_u16(len).await?;
        stream.write_all(&answer).await?;
    }
}

pub async fn serve_tcp(
    forwarder: Arc<Forwarder>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind TCP {addr}"))?;
    info!(forwarder.log, "DNS listening"; "proto" => "tcp", "addr" => %addr);
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(forwarder.log, "accept failed"; "error" => %e);
                    continue;
                }
            },
        };
        let forwarder = forwarder.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_tcp(&forwarder, stream).await {
                debug!(forwarder.log, "TCP session failed"; "peer" => %peer, "error" => %e);
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[test]
    fn resolv_conf_nameservers() {
        let conf = "# generated\nsearch example.com\nnameserver 1.1.1.1\n\
                    nameserver fe80::1%eth0 # link-local\nnameserver bogus\n";
        assert_eq!(
            parse_resolv_conf(conf),
            vec!["1.1.1.1".parse::<IpAddr>().unwrap(), "fe80::1".parse().unwrap()]
        );
    }

    struct Canned {
        answers: HashMap<SocketAddr, ResponseCode>,
        /// UDP answers from these upstreams carry the TC bit.
        truncating: Vec<SocketAddr>,
        asked: Mutex<Vec<(Transport, SocketAddr)>>,
    }

    impl Canned {
        fn new(answers: HashMap<SocketAddr, ResponseCode>) -> Self {
            Self { answers, truncating: vec![], asked: Mutex::new(vec![]) }
        }
    }

    #[async_trait::async_trait]
    impl Exchange for Arc<Canned> {
        async fn exchange(
            &self,
            transport: Transport,
            upstream: SocketAddr,
            query: &[u8],
        ) -> Result<Vec<u8>> {
            self.asked.lock().unwrap().push((transport, upstream));
            let Some(code) = self.answers.get(&upstream) else {
                bail!("unreachable");
            };
            let q = Message::from_vec(query)?;
            let mut resp = servfail(&q);
            resp.set_response_code(*code);
            if transport == Transport::Udp && self.truncating.contains(&upstream) {
                resp.set_truncated(true);
            }
            Ok(resp.to_vec()?)
        }
    }

    fn query() -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(42).set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_ascii("example.com.").unwrap(), RecordType::A));
        msg.to_vec().unwrap()
    }

    #[tokio::test]
    async fn skips_failing_upstreams() {
        let a: SocketAddr = "192.0.2.1:53".parse().unwrap();
        let b: SocketAddr = "192.0.2.2:53".parse().unwrap();
        let c: SocketAddr = "192.0.2.3:53".parse().unwrap();
        let d: SocketAddr = "192.0.2.4:53".parse().unwrap();
        let canned = Arc::new(Canned::new(HashMap::from([
            (b, ResponseCode::ServFail),
            (c, ResponseCode::Refused),
            (d, ResponseCode::NXDomain),
        ])));
        let fwd = Forwarder::new(crate::test_logger(), vec![a, b, c, d], Box::new(canned));
        let answer =
            Message::from_vec(&fwd.resolve(&query(), Transport::Udp).await.unwrap()).unwrap();
        assert_eq!(answer.id(), 42);
        assert_eq!(answer.response_code(), ResponseCode::NXDomain);
    }

    #[tokio::test]
    async fn all_failing_is_servfail() {
        let a: SocketAddr = "192.0.2.1:53".parse().unwrap();
        let canned = Arc::new(Canned::new(HashMap::from([(a, ResponseCode::Refused)])));
        let fwd = Forwarder::new(crate::test_logger(), vec![a], Box::new(canned));
        let answer =
            Message::from_vec(&fwd.resolve(&query(), Transport::Udp).await.unwrap()).unwrap();
        assert_eq!(answer.response_code(), ResponseCode::ServFail);
        assert_eq!(answer.queries().len(), 1);
    }

    #[tokio::test]
    async fn truncated_answers_are_refetched_for_tcp_clients() {
        let a: SocketAddr = "192.0.2.1:53".parse().unwrap();
        let mut canned = Canned::new(HashMap::from([(a, ResponseCode::NoError)]));
        canned.truncating.push(a);
        let canned = Arc::new(canned);
        let fwd =
            Forwarder::new(crate::test_logger(), vec![a], Box::new(canned.clone()));

        let answer =
            Message::from_vec(&fwd.resolve(&query(), Transport::Tcp).await.unwrap()).unwrap();
        assert!(!answer.truncated());
        assert_eq!(
            *canned.asked.lock().unwrap(),
            [(Transport::Udp, a), (Transport::Tcp, a)]
        );

        // UDP clients get the truncated answer and retry on their own.
        canned.asked.lock().unwrap().clear();
        let answer =
            Message::from_vec(&fwd.resolve(&query(), Transport::Udp).await.unwrap()).unwrap();
        assert!(answer.truncated());
        assert_eq!(*canned.asked.lock().unwrap(), [(Transport::Udp, a)]);
    }

    #[tokio::test]
    async fn tcp_exchange_uses_length_framing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let len = stream.read_u16().await.unwrap() as usize;
            let mut q = vec![0u8; len];
            stream.read_exact(&mut q).await.unwrap();
            let mut resp = servfail(&Message::from_vec(&q).unwrap());
            resp.set_response_code(ResponseCode::NXDomain);
            let resp = resp.to_vec().unwrap();
            stream.write_u16(resp.len() as u16).await.unwrap();
            stream.write_all(&resp).await.unwrap();
        });

        let answer =
            NetExchange.exchange(Transport::Tcp, upstream, &query()).await.unwrap();
        let answer = Message::from_vec(&answer).unwrap();
        assert_eq!(answer.id(), 42);
        assert_eq!(answer.response_code(), ResponseCode::NXDomain);
    }
}
