// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Key management service for disk encryption keys of cluster nodes.
//!
//! Payloads are sealed with AES-256-GCM. The node UUID is bound as
//! additional authenticated data, so a payload sealed for one node does not
//! unseal for another. Sealed blobs are `nonce || ciphertext || tag`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use slog::{info, warn, Logger};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::httpd::{not_implemented, respond, serve_connections, Body};

/// Upper bound of a request body; keys are small.
const MAX_BODY: usize = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct SealRequest {
    pub node_uuid: String,
    /// Base64 payload.
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SealResponse {
    pub data: String,
}

pub struct Kms {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl Kms {
    /// `key` is the base64 encoding of a 32 byte AES key.
    pub fn new(key: &str) -> Result<Self> {
        let raw = STANDARD.decode(key.trim()).context("key is not base64")?;
        let unbound = UnboundKey::new(&AES_256_GCM, &raw).map_err(|_| {
            anyhow!("key must be 32 bytes, got {}", raw.len())
        })?;
        Ok(Self { key: LessSafeKey::new(unbound), rng: SystemRandom::new() })
    }

    pub fn seal(&self, node_uuid: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| anyhow!("failed to generate nonce"))?;
        let mut buf = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(node_uuid.as_bytes()),
                &mut buf,
            )
            .map_err(|_| anyhow!("seal failed"))?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&buf);
        Ok(out)
    }

    pub fn unseal(&self, node_uuid: &str, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            bail!("sealed data too short");
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| anyhow!("bad nonce"))?;
        let mut buf = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(node_uuid.as_bytes()), &mut buf)
            .map_err(|_| anyhow!("unseal failed"))?;
        Ok(plaintext.to_vec())
    }

    async fn handle(&self, log: &Logger, req: Request<Incoming>) -> Response<Body> {
        let path = req.uri().path().to_string();
        let op: fn(&Self, &str, &[u8]) -> Result<Vec<u8>> = match path.as_str() {
            "/seal" => Self::seal,
            "/unseal" => Self::unseal,
            _ => return respond(StatusCode::NOT_FOUND, "not found\n"),
        };
        if req.method() != Method::POST {
            return not_implemented();
        }
        let body = match collect(req).await {
            Ok(b) => b,
            Err(e) => return respond(StatusCode::BAD_REQUEST, format!("{e:#}")),
        };
        let result = serde_json::from_slice::<SealRequest>(&body)
            .context("malformed request")
            .and_then(|r| {
                let data = STANDARD.decode(&r.data).context("data is not base64")?;
                op(self, &r.node_uuid, &data).map(|out| (r.node_uuid, out))
            });
        match result {
            Ok((node, out)) => {
                info!(log, "request served"; "op" => &path, "node" => node);
                let resp = SealResponse { data: STANDARD.encode(out) };
                match serde_json::to_vec(&resp) {
                    Ok(json) => respond(StatusCode::OK, json),
                    Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                }
            }
            Err(e) => {
                warn!(log, "request rejected"; "op" => &path, "error" => %e);
                respond(StatusCode::BAD_REQUEST, format!("{e:#}"))
            }
        }
    }
}

async fn collect(req: Request<Incoming>) -> Result<Bytes> {
    let body = http_body_util::Limited::new(req.into_body(), MAX_BODY);
    Ok(body.collect().await.map_err(|e| anyhow!("{e}"))?.to_bytes())
}

pub async fn serve(
    log: Logger,
    addr: SocketAddr,
    kms: Kms,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;
    serve_on(log, listener, Arc::new(kms), cancel).await;
    Ok(())
}

pub(crate) async fn serve_on(
    log: Logger,
    listener: TcpListener,
    kms: Arc<Kms>,
    cancel: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(log, "KMS listening"; "addr" => %addr);
    }
    let handler_log = log.clone();
    serve_connections(log, listener, cancel, move |req| {
        let kms = kms.clone();
        let log = handler_log.clone();
        async move { kms.handle(&log, req).await }
    })
    .await
}

#[cfg(test)]
mod test {
    use super::*;

    fn key() -> String {
        STANDARD.encode([7u8; 32])
    }

    #[test]
    fn seal_unseal() {
        let kms = Kms::new(&key()).unwrap();
        let sealed = kms.seal("node-a", b"disk key").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 8 + AES_256_GCM.tag_len());
        assert_eq!(kms.unseal("node-a", &sealed).unwrap(), b"disk key");
        assert!(kms.unseal("node-b", &sealed).is_err());
        assert!(kms.unseal("node-a", &sealed[..4]).is_err());
    }

    #[test]
    fn key_must_be_aes256() {
        assert!(Kms::new(&STANDARD.encode([0u8; 16])).is_err());
        assert!(Kms::new("not base64!").is_err());
    }

    #[tokio::test]
    async fn http_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let kms = Arc::new(Kms::new(&key()).unwrap());
        let task = tokio::spawn(serve_on(
            crate::test_logger(),
            listener,
            kms,
            cancel.clone(),
        ));

        let client = reqwest::Client::new();
        let sealed: SealResponse = client
            .post(format!("http://{addr}/seal"))
            .json(&SealRequest {
                node_uuid: "n1".to_string(),
                data: STANDARD.encode(b"secret"),
            })
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let opened: SealResponse = client
            .post(format!("http://{addr}/unseal"))
            .json(&SealRequest { node_uuid: "n1".to_string(), data: sealed.data })
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(STANDARD.decode(opened.data).unwrap(), b"secret");

        let resp = client.get(format!("http://{addr}/seal")).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_IMPLEMENTED);

        cancel.cancel();
        task.await.unwrap();
    }
}
