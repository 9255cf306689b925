// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory HTTP server delivering node configs and accepting power
//! control callbacks.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use slog::{debug, info, warn, Logger};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::controller::Controller;

pub const CONFIG_PATH: &str = "/config.yaml";

pub(crate) type Body = Full<Bytes>;

pub(crate) fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Body> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp
}

pub(crate) fn not_implemented() -> Response<Body> {
    respond(StatusCode::NOT_IMPLEMENTED, "method not implemented\n")
}

/// Routes of the launcher's HTTP endpoint.
pub struct Router {
    files: HashMap<String, Bytes>,
    controller: Option<Arc<Controller>>,
    log: Logger,
}

impl Router {
    pub fn new(log: Logger) -> Self {
        Self { files: HashMap::new(), controller: None, log }
    }

    /// Serve `contents` at `path` for GET and HEAD.
    pub fn with_file(mut self, path: &str, contents: impl Into<Bytes>) -> Self {
        self.files.insert(path.to_string(), contents.into());
        self
    }

    /// Expose the power endpoints backed by `controller`.
    pub fn with_controller(mut self, controller: Arc<Controller>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub async fn handle<B>(&self, req: &Request<B>) -> Response<Body> {
        let method = req.method();
        let path = req.uri().path();
        debug!(self.log, "request"; "method" => %method, "path" => path);

        if let Some(contents) = self.files.get(path) {
            return match *method {
                Method::GET => respond(StatusCode::OK, contents.clone()),
                Method::HEAD => {
                    let mut resp = respond(StatusCode::OK, Bytes::new());
                    resp.headers_mut().insert(
                        header::CONTENT_LENGTH,
                        header::HeaderValue::from(contents.len()),
                    );
                    resp
                }
                _ => not_implemented(),
            };
        }

        let Some(ctl) = &self.controller else {
            return respond(StatusCode::NOT_FOUND, "not found\n");
        };

        if path == "/status" {
            if method != Method::GET {
                return not_implemented();
            }
            return match serde_json::to_vec(&ctl.status()) {
                Ok(body) => {
                    let mut resp = respond(StatusCode::OK, body);
                    resp.headers_mut().insert(
                        header::CONTENT_TYPE,
                        header::HeaderValue::from_static("application/json"),
                    );
                    resp
                }
                Err(e) => {
                    respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                }
            };
        }

        let result = match path {
            "/poweron" | "/poweroff" | "/reboot" | "/pxeboot"
                if method != Method::POST =>
            {
                return not_implemented()
            }
            "/poweron" => ctl.power_on().await,
            "/poweroff" => ctl.power_off().await,
            "/reboot" => ctl.reboot().await,
            "/pxeboot" => {
                ctl.pxe_boot_once();
                Ok(())
            }
            _ => return respond(StatusCode::NOT_FOUND, "not found\n"),
        };
        match result {
            Ok(()) => {
                info!(self.log, "power command accepted"; "path" => path);
                respond(StatusCode::OK, Bytes::new())
            }
            Err(e) => {
                warn!(self.log, "power command failed"; "path" => path, "error" => %e);
                respond(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
            }
        }
    }
}

/// A bound listener; [`HttpServer::run`] serves until cancelled.
pub struct HttpServer {
    listener: TcpListener,
    router: Arc<Router>,
}

impl HttpServer {
    pub async fn bind(addr: SocketAddr, router: Router) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to listen on {addr}"))?;
        Ok(Self { listener, router: Arc::new(router) })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, cancel: CancellationToken) {
        let log = self.router.log.clone();
        let router = self.router;
        serve_connections(log, self.listener, cancel, move |req| {
            let router = router.clone();
            // Every route is answered from the request head alone.
            let req = req.map(drop);
            async move { router.handle(&req).await }
        })
        .await
    }
}

/// Accept HTTP/1 connections on `listener` until cancelled, answering
/// every request with `handler`.
pub(crate) async fn serve_connections<F, Fut>(
    log: Logger,
    listener: TcpListener,
    cancel: CancellationToken,
    handler: F,
) where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return,
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(log, "accept failed"; "error" => %e);
                    continue;
                }
            },
        };
        let handler = handler.clone();
        let log = log.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let fut = handler(req);
                async move { Ok::<_, std::convert::Infallible>(fut.await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(log, "connection error"; "peer" => %peer, "error" => %e);
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::controller::VmCommand;

    fn request(method: Method, path: &str) -> Request<()> {
        Request::builder().method(method).uri(path).body(()).unwrap()
    }

    async fn body(resp: Response<Body>) -> Bytes {
        use http_body_util::BodyExt;
        resp.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn serves_files_for_get_and_head() {
        let router = Router::new(crate::test_logger())
            .with_file(CONFIG_PATH, "machine: {}\n");

        let resp = router.handle(&request(Method::GET, CONFIG_PATH)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body(resp).await, "machine: {}\n");

        let resp = router.handle(&request(Method::HEAD, CONFIG_PATH)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "12");
        assert!(body(resp).await.is_empty());

        let resp = router.handle(&request(Method::PUT, CONFIG_PATH)).await;
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
        let resp = router.handle(&request(Method::GET, "/other")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn power_endpoints_drive_controller() {
        let (ctl, mut commands) = Controller::new();
        let ctl = Arc::new(ctl);
        let router = Arc::new(
            Router::new(crate::test_logger()).with_controller(ctl.clone()),
        );

        let resp = router.handle(&request(Method::GET, "/poweroff")).await;
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);

        let off = tokio::spawn({
            let router = router.clone();
            async move {
                router.handle(&request(Method::POST, "/poweroff")).await.status()
            }
        });
        assert_eq!(commands.recv().await, Some(VmCommand::Stop));
        assert_eq!(off.await.unwrap(), StatusCode::OK);

        let resp = router.handle(&request(Method::GET, "/status")).await;
        assert_eq!(body(resp).await, r#"{"PoweredOn":false}"#);

        let resp = router.handle(&request(Method::POST, "/pxeboot")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(ctl.take_force_pxe_boot());
    }

    #[tokio::test]
    async fn failed_command_is_500() {
        let (ctl, commands) = Controller::new();
        drop(commands);
        let router =
            Router::new(crate::test_logger()).with_controller(Arc::new(ctl));
        let resp = router.handle(&request(Method::POST, "/poweroff")).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body(resp).await.is_empty());
    }

    #[tokio::test]
    async fn serves_over_tcp() {
        let router = Router::new(crate::test_logger())
            .with_file(CONFIG_PATH, "machine: {}\n");
        let server =
            HttpServer::bind("127.0.0.1:0".parse().unwrap(), router).await.unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.run(cancel.clone()));

        let url = format!("http://{addr}{CONFIG_PATH}");
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(resp.text().await.unwrap(), "machine: {}\n");

        cancel.cancel();
        task.await.unwrap();
    }
}
