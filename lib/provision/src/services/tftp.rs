// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-only TFTP server for iPXE firmware images (RFC 1350, 512 byte
//! blocks, no option negotiation).

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use slog::{debug, info, warn, Logger};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::ipxe;

pub const PORT: u16 = 69;
pub const BLOCK_SIZE: usize = 512;
const RETRIES: usize = 5;
const ACK_TIMEOUT: Duration = Duration::from_secs(1);

const OP_RRQ: u16 = 1;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;

const ERR_NOT_FOUND: u16 = 1;
const ERR_ILLEGAL: u16 = 4;

#[derive(Debug, PartialEq, Eq)]
pub enum Packet {
    ReadRequest { filename: String, mode: String },
    Data { block: u16, data: Vec<u8> },
    Ack { block: u16 },
    Error { code: u16, message: String },
    Other(u16),
}

impl Packet {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            bail!("short packet");
        }
        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let rest = &buf[2..];
        let block = u16::from_be_bytes([rest[0], rest[1]]);
        Ok(match opcode {
            OP_RRQ => {
                let mut fields = rest.split(|b| *b == 0);
                let mut next = || {
                    fields
                        .next()
                        .map(|f| String::from_utf8_lossy(f).into_owned())
                };
                let (Some(filename), Some(mode)) = (next(), next()) else {
                    bail!("malformed read request");
                };
                Packet::ReadRequest { filename, mode }
            }
            OP_DATA => Packet::Data { block, data: rest[2..].to_vec() },
            OP_ACK => Packet::Ack { block },
            OP_ERROR => {
                let msg = rest[2..].split(|b| *b == 0).next().unwrap_or(&[]);
                Packet::Error {
                    code: block,
                    message: String::from_utf8_lossy(msg).into_owned(),
                }
            }
            op => Packet::Other(op),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Packet::ReadRequest { filename, mode } => {
                out.extend_from_slice(&OP_RRQ.to_be_bytes());
                out.extend_from_slice(filename.as_bytes());
                out.push(0);
                out.extend_from_slice(mode.as_bytes());
                out.push(0);
            }
            Packet::Data { block, data } => {
                out.extend_from_slice(&OP_DATA.to_be_bytes());
                out.extend_from_slice(&block.to_be_bytes());
                out.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                out.extend_from_slice(&OP_ACK.to_be_bytes());
                out.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                out.extend_from_slice(&OP_ERROR.to_be_bytes());
                out.extend_from_slice(&code.to_be_bytes());
                out.extend_from_slice(message.as_bytes());
                out.push(0);
            }
            Packet::Other(op) => out.extend_from_slice(&op.to_be_bytes()),
        }
        out
    }
}

/// Serves firmware images from a directory, patching each with a chain
/// script to the next-stage URL on every read.
pub struct FirmwareStore {
    root: PathBuf,
    script: String,
}

impl FirmwareStore {
    pub fn new(root: PathBuf, next_handler: &str) -> Self {
        Self { root, script: ipxe::chain_script(next_handler) }
    }

    /// Contents served for `filename`, or `None` when it does not exist.
    pub fn read(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        let rel = Path::new(filename.trim_start_matches('/'));
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            bail!("illegal path {filename:?}");
        }
        let path = self.root.join(rel);
        let image = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", path.display()))
            }
        };
        ipxe::patch(&image, &self.script).map(Some)
    }
}

pub async fn serve(
    log: Logger,
    addr: SocketAddr,
    store: Arc<FirmwareStore>,
    cancel: CancellationToken,
) -> Result<()> {
    let socket = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("failed to bind TFTP on {addr}"))?;
    info!(log, "TFTP server listening"; "addr" => %addr);
    serve_on(log, socket, store, cancel).await
}

pub(crate) async fn serve_on(
    log: Logger,
    socket: UdpSocket,
    store: Arc<FirmwareStore>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut buf = [0u8; 1500];
    loop {
        let (n, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = socket.recv_from(&mut buf) => res.context("TFTP receive")?,
        };
        let filename = match Packet::parse(&buf[..n]) {
            Ok(Packet::ReadRequest { filename, .. }) => filename,
            Ok(other) => {
                debug!(log, "ignoring packet"; "peer" => %peer, "packet" => ?other);
                continue;
            }
            Err(e) => {
                debug!(log, "bad packet"; "peer" => %peer, "error" => %e);
                continue;
            }
        };
        let log = log.new(slog::o!("peer" => peer.to_string(), "file" => filename.clone()));
        let store = store.clone();
        let local_ip = socket.local_addr()?.ip();
        tokio::spawn(async move {
            if let Err(e) = transfer(&log, local_ip, peer, &store, &filename).await {
                warn!(log, "transfer failed"; "error" => %e);
            }
        });
    }
}

async fn transfer(
    log: &Logger,
    local_ip: std::net::IpAddr,
    peer: SocketAddr,
    store: &FirmwareStore,
    filename: &str,
) -> Result<()> {
    // Each transfer runs from its own port (the transfer identifier).
    let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
    socket.connect(peer).await?;

    let contents = match store.read(filename) {
        Ok(Some(c)) => c,
        Ok(None) => {
            info!(log, "file not found");
            let err = Packet::Error {
                code: ERR_NOT_FOUND,
                message: "file not found".to_string(),
            };
            socket.send(&err.encode()).await?;
            return Ok(());
        }
        Err(e) => {
            let err = Packet::Error { code: ERR_ILLEGAL, message: e.to_string() };
            socket.send(&err.encode()).await?;
            return Err(e);
        }
    };

    info!(log, "sending file"; "size" => contents.len());
    // A file that is an exact multiple of the block size ends with an
    // empty block.
    let blocks = contents.len() / BLOCK_SIZE + 1;
    let mut buf = [0u8; 1500];
    for index in 0..blocks {
        let block = ((index + 1) % 0x1_0000) as u16;
        let start = index * BLOCK_SIZE;
        let end = (start + BLOCK_SIZE).min(contents.len());
        let packet =
            Packet::Data { block, data: contents[start..end].to_vec() }.encode();

        let mut acked = false;
        for _ in 0..RETRIES {
            socket.send(&packet).await?;
            let deadline = tokio::time::Instant::now() + ACK_TIMEOUT;
            while let Ok(res) =
                tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await
            {
                match Packet::parse(&buf[..res?]) {
                    Ok(Packet::Ack { block: b }) if b == block => {
                        acked = true;
                        break;
                    }
                    Ok(Packet::Error { code, message }) => {
                        bail!("client aborted ({code}): {message}")
                    }
                    // Duplicate acks of earlier blocks.
                    _ => {}
                }
            }
            if acked {
                break;
            }
        }
        if !acked {
            bail!("no ack for block {block}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packet_codec() {
        let rrq = Packet::ReadRequest {
            filename: "undionly.kpxe".to_string(),
            mode: "octet".to_string(),
        };
        assert_eq!(Packet::parse(&rrq.encode()).unwrap(), rrq);
        assert_eq!(
            Packet::parse(&[0, 4, 0x01, 0x02]).unwrap(),
            Packet::Ack { block: 0x0102 }
        );
        assert!(Packet::parse(&[0, 1]).is_err());
    }

    #[test]
    fn store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FirmwareStore::new(dir.path().to_path_buf(), "http://x/");
        assert!(store.read("../etc/passwd").is_err());
        assert!(store.read("missing.efi").unwrap().is_none());
    }

    #[tokio::test]
    async fn serves_patched_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = ipxe::test::image(2048);
        std::fs::write(dir.path().join("undionly.kpxe"), &image).unwrap();
        let next = "http://10.5.0.1:8081/ipxe";
        let store =
            Arc::new(FirmwareStore::new(dir.path().to_path_buf(), next));

        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve_on(
            crate::test_logger(),
            server,
            store,
            cancel.clone(),
        ));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rrq = Packet::ReadRequest {
            filename: "undionly.kpxe".to_string(),
            mode: "octet".to_string(),
        };
        client.send_to(&rrq.encode(), server_addr).await.unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 1500];
        loop {
            let (n, from) = client.recv_from(&mut buf).await.unwrap();
            let Packet::Data { block, data } = Packet::parse(&buf[..n]).unwrap()
            else {
                panic!("expected data");
            };
            received.extend_from_slice(&data);
            client
                .send_to(&Packet::Ack { block }.encode(), from)
                .await
                .unwrap();
            if data.len() < BLOCK_SIZE {
                break;
            }
        }

        assert_eq!(received.len(), image.len());
        assert_eq!(received, ipxe::patch(&image, &ipxe::chain_script(next)).unwrap());
        assert!(String::from_utf8_lossy(&received).contains(next));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
