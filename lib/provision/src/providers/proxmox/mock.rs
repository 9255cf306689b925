// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process stand-in for the Proxmox API.

use std::sync::{Arc, Mutex};

use http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::client::{Client, Credentials};
use crate::services::httpd::{respond, serve_connections};

type Route = dyn Fn(&Method, &str) -> (StatusCode, Value) + Send + Sync;

#[derive(Clone, Debug)]
pub(crate) struct Seen {
    pub method: Method,
    pub path: String,
    pub authorization: Option<String>,
    pub cookie: Option<String>,
    pub csrf: Option<String>,
    pub body: String,
}

pub(crate) struct MockServer {
    pub url: String,
    seen: Arc<Mutex<Vec<Seen>>>,
    cancel: CancellationToken,
}

fn header(req: &Request<Incoming>, name: &str) -> Option<String> {
    req.headers().get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

impl MockServer {
    /// Serve `route(method, path)` as `{"data": ...}`, with `path` relative
    /// to the API root.
    pub async fn start<F>(route: F) -> Self
    where
        F: Fn(&Method, &str) -> (StatusCode, Value) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let route: Arc<Route> = Arc::new(route);

        let recorder = seen.clone();
        tokio::spawn(serve_connections(
            crate::test_logger(),
            listener,
            cancel.clone(),
            move |req: Request<Incoming>| {
                let route = route.clone();
                let recorder = recorder.clone();
                async move {
                    let method = req.method().clone();
                    let path = req.uri().path().to_string();
                    let authorization = header(&req, "authorization");
                    let cookie = header(&req, "cookie");
                    let csrf = header(&req, "csrfpreventiontoken");
                    let body = req.into_body().collect().await.unwrap().to_bytes();
                    recorder.lock().unwrap().push(Seen {
                        method: method.clone(),
                        path: path.clone(),
                        authorization,
                        cookie,
                        csrf,
                        body: String::from_utf8_lossy(&body).into_owned(),
                    });
                    let rel = path.strip_prefix("/api2/json").unwrap_or(&path);
                    let (status, data) = route(&method, rel);
                    respond(status, json!({ "data": data }).to_string())
                }
            },
        ));
        Self { url, seen, cancel }
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    /// Token-authenticated client pointed at this server.
    pub async fn client(&self) -> Client {
        Client::connect(
            crate::test_logger(),
            &self.url,
            &Credentials::Token {
                id: "root@pam!ci".to_string(),
                secret: "s3cret".to_string(),
            },
            false,
        )
        .await
        .unwrap()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
