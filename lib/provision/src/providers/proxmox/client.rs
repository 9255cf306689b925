// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Proxmox VE JSON API client.
//!
//! Every response is wrapped as `{"data": ...}`. Non-success statuses are
//! turned into [`Error::External`] carrying a hint about what to check.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder};
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use slog::{debug, warn, Logger};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::Error;

const API_PATH: &str = "/api2/json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Consecutive failed status polls before a task wait gives up.
const MAX_TASK_ERRORS: u32 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    Token { id: String, secret: String },
    Password { username: String, password: String },
}

/// Authentication attached to every request.
#[derive(Clone, Debug)]
enum Auth {
    Header(String),
    Ticket { cookie: String, csrf: String },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct Ticket {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct StorageInfo {
    pub storage: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Comma separated content types, e.g. `images,iso`.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub total: u64,
}

impl StorageInfo {
    pub fn supports(&self, content: &str) -> bool {
        self.content.split(',').any(|c| c.trim() == content)
    }

    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct StorageContent {
    pub volid: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub format: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct VmInfo {
    #[serde(deserialize_with = "vmid")]
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct VmStatus {
    pub status: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TaskStatus {
    pub status: String,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NodeEntry {
    pub node: String,
}

/// LXC listings report ids as strings, QEMU listings as numbers.
fn vmid<'d, D: Deserializer<'d>>(d: D) -> Result<u32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u32),
        Str(String),
    }
    match Raw::deserialize(d)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(de::Error::custom),
    }
}

/// `https://host:8006/` and `https://host:8006/api2/json` name the same
/// API root.
pub fn normalize_base_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.ends_with(API_PATH) {
        url.to_string()
    } else {
        format!("{url}{API_PATH}")
    }
}

/// What to look at when the API answers with `status`.
pub fn guidance(status: u16) -> &'static str {
    match status {
        401 => "authentication failed, check PROXMOX_USERNAME and PROXMOX_PASSWORD",
        403 => "access forbidden, check user permissions in Proxmox",
        404 => "API endpoint not found, check PROXMOX_URL and node name",
        500 => "Proxmox server error, check Proxmox logs",
        596 => "connection failed, likely TLS or network issue (try PROXMOX_INSECURE=true)",
        _ => "check Proxmox API documentation for this status code",
    }
}

pub struct Client {
    log: Logger,
    http: reqwest::Client,
    base_url: String,
    auth: Auth,
    poll_interval: Duration,
}

impl Client {
    /// Build a client for `url`. Password credentials are exchanged for a
    /// ticket right away.
    pub async fn connect(
        log: Logger,
        url: &str,
        credentials: &Credentials,
        insecure: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(insecure)
            .build()
            .context("failed to build HTTP client")?;
        let base_url = normalize_base_url(url);

        let auth = match credentials {
            Credentials::Token { id, secret } => {
                Auth::Header(format!("PVEAPIToken={id}={secret}"))
            }
            Credentials::Password { username, password } => {
                let rb = http
                    .post(format!("{base_url}/access/ticket"))
                    .form(&[("username", username), ("password", password)]);
                let data = send(&log, rb, &Method::POST, "/access/ticket").await?;
                let ticket: Ticket = serde_json::from_value(data)
                    .context("malformed ticket response")?;
                Auth::Ticket {
                    cookie: format!("PVEAuthCookie={}", ticket.ticket),
                    csrf: ticket.csrf,
                }
            }
        };

        Ok(Self { log, http, base_url, auth, poll_interval: TASK_POLL_INTERVAL })
    }

    #[cfg(test)]
    pub(crate) fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let rb = self.http.request(method, format!("{}{path}", self.base_url));
        match &self.auth {
            Auth::Header(value) => rb.header("Authorization", value),
            Auth::Ticket { cookie, csrf } => {
                rb.header("Cookie", cookie).header("CSRFPreventionToken", csrf)
            }
        }
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(String, String)]>,
    ) -> Result<Value> {
        let mut rb = self.request(method.clone(), path);
        if let Some(form) = form {
            rb = rb.form(form);
        }
        send(&self.log, rb, &method, path).await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let data = self.call(Method::GET, path, None).await?;
        serde_json::from_value(data)
            .with_context(|| format!("unexpected response to GET {path}"))
    }

    pub async fn post(&self, path: &str, form: &[(String, String)]) -> Result<Value> {
        self.call(Method::POST, path, Some(form)).await
    }

    pub async fn put(&self, path: &str, form: &[(String, String)]) -> Result<Value> {
        self.call(Method::PUT, path, Some(form)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.call(Method::DELETE, path, None).await
    }

    /// Poll `upid` on `node` until it stops. Success requires an exit
    /// status of `OK` or `WARNINGS`.
    pub async fn wait_for_task(
        &self,
        node: &str,
        upid: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let path = format!("/nodes/{node}/tasks/{upid}/status");
        let deadline = tokio::time::Instant::now() + timeout;
        let mut tick = tokio::time::interval(self.poll_interval);
        let mut failures = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Stopped.into()),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::External(format!(
                        "timed out after {timeout:?} waiting for task {upid}"
                    ))
                    .into());
                }
                _ = tick.tick() => {}
            }

            let status = match self.get::<TaskStatus>(&path).await {
                Ok(s) => s,
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_TASK_ERRORS {
                        return Err(e.context(format!(
                            "giving up on task {upid} after {failures} failed polls"
                        )));
                    }
                    debug!(self.log, "task status poll failed";
                        "upid" => upid, "error" => %e);
                    continue;
                }
            };
            failures = 0;

            if status.status != "stopped" {
                continue;
            }
            return match status.exitstatus.as_deref() {
                Some("OK") => Ok(()),
                Some(s) if s.starts_with("WARNINGS") => {
                    warn!(self.log, "task finished with warnings";
                        "upid" => upid, "status" => s);
                    Ok(())
                }
                other => Err(Error::External(format!(
                    "task {upid} failed: {}",
                    other.unwrap_or("no exit status")
                ))
                .into()),
            };
        }
    }

    /// Stream `path` into ISO storage; returns the upload task's UPID.
    pub async fn upload_iso(
        &self,
        node: &str,
        storage: &str,
        path: &Path,
    ) -> Result<String> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let len = file
            .metadata()
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, len).file_name(name.clone());
        let form = Form::new().text("content", "iso").part("filename", part);

        let api_path = format!("/nodes/{node}/storage/{storage}/upload");
        let rb = self
            .request(Method::POST, &api_path)
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT);
        let data = send(&self.log, rb, &Method::POST, &api_path).await?;
        upid(&data).ok_or_else(|| {
            Error::External(format!("upload of {name} returned no task id")).into()
        })
    }

    pub async fn storage_content(
        &self,
        node: &str,
        storage: &str,
    ) -> Result<Vec<StorageContent>> {
        self.get(&format!("/nodes/{node}/storage/{storage}/content")).await
    }

    /// Size of `<storage>:iso/<file>`, or `None` when it is not there.
    pub async fn iso_size(
        &self,
        node: &str,
        storage: &str,
        file: &str,
    ) -> Result<Option<u64>> {
        let volid = format!("{storage}:iso/{file}");
        Ok(self
            .storage_content(node, storage)
            .await?
            .into_iter()
            .find(|c| c.volid == volid)
            .map(|c| c.size))
    }
}

/// Task id returned by asynchronous endpoints.
pub fn upid(data: &Value) -> Option<String> {
    data.as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

async fn send(
    log: &Logger,
    rb: RequestBuilder,
    method: &Method,
    path: &str,
) -> Result<Value> {
    let resp = rb.send().await.map_err(|e| {
        let hint = if e.is_connect() || e.is_timeout() { guidance(596) } else { "" };
        Error::External(format!("{method} {path} failed: {e}; {hint}"))
    })?;
    let status = resp.status();
    let body = resp
        .text()
        .await
        .with_context(|| format!("failed to read response to {method} {path}"))?;
    debug!(log, "API call"; "method" => %method, "path" => path,
        "status" => status.as_u16());

    if !status.is_success() {
        let detail: String = body.trim().chars().take(512).collect();
        return Err(Error::External(format!(
            "{method} {path} returned {status}: {detail}; {}",
            guidance(status.as_u16())
        ))
        .into());
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    let env: Envelope = serde_json::from_str(&body)
        .with_context(|| format!("malformed response to {method} {path}"))?;
    Ok(env.data)
}

#[cfg(test)]
mod test {
    use super::*;
    use http::StatusCode;
    use serde_json::json;

    use crate::providers::proxmox::mock::MockServer;

    #[test]
    fn base_url_normalization() {
        assert_eq!(
            normalize_base_url("https://pve:8006/"),
            "https://pve:8006/api2/json"
        );
        assert_eq!(
            normalize_base_url("https://pve:8006/api2/json/"),
            "https://pve:8006/api2/json"
        );
    }

    #[test]
    fn lxc_ids_are_strings() {
        let vms: Vec<VmInfo> = serde_json::from_value(json!([
            {"vmid": 100, "name": "a", "status": "running"},
            {"vmid": "101", "status": "stopped"},
        ]))
        .unwrap();
        assert_eq!(vms[0].vmid, 100);
        assert_eq!(vms[1].vmid, 101);
        assert_eq!(vms[1].name, None);
    }

    #[tokio::test]
    async fn token_header_is_sent() {
        let server = MockServer::start(|_, _| (StatusCode::OK, json!([{"node": "pve1"}])))
            .await;
        let nodes: Vec<NodeEntry> = server.client().await.get("/nodes").await.unwrap();
        assert_eq!(nodes[0].node, "pve1");

        let seen = server.seen();
        assert_eq!(seen[0].path, "/api2/json/nodes");
        assert_eq!(
            seen[0].authorization.as_deref(),
            Some("PVEAPIToken=root@pam!ci=s3cret")
        );
    }

    #[tokio::test]
    async fn ticket_login_sets_cookie_and_csrf() {
        let server = MockServer::start(|_, path| match path {
            "/access/ticket" => (
                StatusCode::OK,
                json!({"ticket": "PVE:t1", "CSRFPreventionToken": "csrf1"}),
            ),
            _ => (StatusCode::OK, Value::Null),
        })
        .await;
        let client = Client::connect(
            crate::test_logger(),
            &server.url,
            &Credentials::Password {
                username: "root@pam".to_string(),
                password: "pw".to_string(),
            },
            false,
        )
        .await
        .unwrap();
        client.put("/nodes/pve1/qemu/100/config", &[]).await.unwrap();

        let seen = server.seen();
        assert_eq!(seen[0].body, "username=root%40pam&password=pw");
        assert_eq!(seen[1].cookie.as_deref(), Some("PVEAuthCookie=PVE:t1"));
        assert_eq!(seen[1].csrf.as_deref(), Some("csrf1"));
    }

    #[tokio::test]
    async fn errors_carry_guidance() {
        let server =
            MockServer::start(|_, _| (StatusCode::UNAUTHORIZED, Value::Null)).await;
        let err = server.client().await.get::<Value>("/nodes").await.unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::External(_))));
        assert!(err.to_string().contains("PROXMOX_PASSWORD"), "{err}");
    }

    #[tokio::test]
    async fn task_wait_outcomes() {
        let server = MockServer::start(|_, path| {
            let status = if path.contains("UPID:ok") {
                json!({"status": "stopped", "exitstatus": "OK"})
            } else if path.contains("UPID:warn") {
                json!({"status": "stopped", "exitstatus": "WARNINGS: 1"})
            } else if path.contains("UPID:bad") {
                json!({"status": "stopped", "exitstatus": "unable to create VM"})
            } else if path.contains("UPID:slow") {
                json!({"status": "running"})
            } else {
                return (StatusCode::INTERNAL_SERVER_ERROR, Value::Null);
            };
            (StatusCode::OK, status)
        })
        .await;
        let client =
            server.client().await.with_poll_interval(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let long = Duration::from_secs(10);

        client.wait_for_task("pve1", "UPID:ok", long, &cancel).await.unwrap();
        client.wait_for_task("pve1", "UPID:warn", long, &cancel).await.unwrap();
        let err =
            client.wait_for_task("pve1", "UPID:bad", long, &cancel).await.unwrap_err();
        assert!(err.to_string().contains("unable to create VM"));
        let err = client
            .wait_for_task("pve1", "UPID:slow", Duration::from_millis(100), &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));

        let err =
            client.wait_for_task("pve1", "UPID:gone", long, &cancel).await.unwrap_err();
        assert!(err.to_string().contains("5 failed polls"), "{err:#}");
        let polls = server.seen().iter().filter(|s| s.path.contains("UPID:gone")).count();
        assert_eq!(polls, 5);

        cancel.cancel();
        let err =
            client.wait_for_task("pve1", "UPID:slow", long, &cancel).await.unwrap_err();
        assert!(crate::is_stopped(&err));
    }

    #[tokio::test]
    async fn iso_lookup_and_upload() {
        let server = MockServer::start(|method, path| match (method.as_str(), path) {
            ("GET", "/nodes/pve1/storage/local/content") => (
                StatusCode::OK,
                json!([
                    {"volid": "local:iso/talos.iso", "size": 104857600, "format": "iso"},
                    {"volid": "local:vztmpl/debian.tar.zst", "size": 1},
                ]),
            ),
            ("POST", "/nodes/pve1/storage/local/upload") => {
                (StatusCode::OK, json!("UPID:pve1:upload"))
            }
            _ => (StatusCode::NOT_FOUND, Value::Null),
        })
        .await;
        let client = server.client().await;
        assert_eq!(
            client.iso_size("pve1", "local", "talos.iso").await.unwrap(),
            Some(100 << 20)
        );
        assert_eq!(client.iso_size("pve1", "local", "other.iso").await.unwrap(), None);

        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("metal.iso");
        std::fs::write(&iso, b"iso bytes").unwrap();
        let upid = client.upload_iso("pve1", "local", &iso).await.unwrap();
        assert_eq!(upid, "UPID:pve1:upload");

        let upload = server.seen().into_iter().last().unwrap();
        assert!(upload.body.contains("name=\"content\""));
        assert!(upload.body.contains("filename=\"metal.iso\""));
        assert!(upload.body.contains("iso bytes"));
    }

    #[tokio::test]
    async fn upload_without_task_names_the_file() {
        let server = MockServer::start(|_, _| (StatusCode::OK, Value::Null)).await;
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("metal.iso");
        std::fs::write(&iso, b"iso bytes").unwrap();

        let err = server
            .client()
            .await
            .upload_iso("pve1", "local", &iso)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::External(_))));
        assert!(err.to_string().contains("metal.iso"), "{err}");
        let upload = server.seen().into_iter().last().unwrap();
        assert!(upload.body.contains("filename=\"metal.iso\""));
    }
}
