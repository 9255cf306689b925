// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sink for JSON log lines streamed by nodes over TCP.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use slog::{info, warn, Logger};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub async fn serve(log: Logger, addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;
    info!(log, "JSON log sink listening"; "addr" => %addr);
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(log, "accept failed"; "error" => %e);
                    continue;
                }
            },
        };
        let log = log.new(slog::o!("peer" => peer.to_string()));
        tokio::spawn(async move {
            if let Err(e) = forward_lines(&log, stream).await {
                warn!(log, "log stream failed"; "error" => %e);
            }
        });
    }
}

/// Log every line of `reader` until EOF. Returns the number of lines.
pub(crate) async fn forward_lines<R>(log: &Logger, reader: R) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut count = 0;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(msg) => info!(log, "{}", msg),
            Err(_) => warn!(log, "non-JSON line"; "line" => line),
        }
        count += 1;
    }
    Ok(count)
}
