// SPDX-License-Identifier: MIT
//! WebSocket transport for the progress bus.
//!
//! Long-lived push channel at `/stream?requestId=...&token=...&channels=a,b`.
//! The handshake rejects bad paths and tokens before the upgrade; every
//! accepted connection becomes a bus subscriber whose outbound queue this
//! module drains onto the socket.
//!
//! Outbound frames above 1 KiB are deflate-compressed and travel as
//! binary messages; smaller frames stay as UTF-8 text. Inbound messages
//! are capped at 2 MiB by the WebSocket config.

pub mod commands;

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{accept_hdr_async_with_config, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Frame, Subscriber, HEARTBEAT_INTERVAL};
use crate::error::SwarmError;
use crate::AppContext;
use commands::{dispatch_command, dispatch_query, ClientFrame};

/// Payloads above this many bytes are deflate-compressed.
const COMPRESSION_THRESHOLD: usize = 1024;
/// Hard cap on a single message in either direction.
const MAX_PAYLOAD: usize = 2 * 1024 * 1024;
/// How long the final drain after shutdown may take per frame.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(1);

// ─── Auth ─────────────────────────────────────────────────────────────────────

/// Constant-time token comparison to prevent timing-based token oracles.
fn tokens_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// ─── Handshake ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct StreamParams {
    request_id: String,
    channels: Vec<String>,
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|kv| !kv.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (kv.to_string(), String::new()),
        })
        .collect()
}

/// Validate path, required `requestId`, and the shared token (when one is
/// configured). Runs inside the upgrade callback so rejects are plain
/// HTTP responses, not WebSocket closes.
fn check_request(req: &Request, expected_token: &str) -> Result<StreamParams, (u16, &'static str)> {
    let uri = req.uri();
    if uri.path() != crate::orchestrator::STREAM_PATH {
        return Err((404, "not found"));
    }
    let params = parse_query(uri.query().unwrap_or(""));
    let get = |key: &str| {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };

    let request_id = get("requestId").unwrap_or("").to_string();
    if request_id.is_empty() {
        return Err((400, "missing requestId"));
    }
    if !expected_token.is_empty() {
        let provided = get("token").unwrap_or("");
        if !tokens_equal(provided, expected_token) {
            return Err((401, "invalid token"));
        }
    }
    let channels = get("channels")
        .map(|c| {
            c.split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(StreamParams {
        request_id,
        channels,
    })
}

fn reject(status: u16, body: &'static str) -> ErrorResponse {
    use tokio_tungstenite::tungstenite::http::StatusCode;
    let mut resp = ErrorResponse::new(Some(body.to_string()));
    *resp.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST);
    resp
}

// ─── Server ───────────────────────────────────────────────────────────────────

pub async fn run(ctx: Arc<AppContext>, cancel: CancellationToken) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.stream.host, ctx.config.stream.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "stream server listening");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new stream connection");
                let ctx = ctx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx, cancel).await {
                        debug!(peer = %peer, err = %e, "stream connection closed with error");
                    }
                });
            }
        }
    }

    info!("stream server stopped");
    Ok(())
}

/// Compress-or-not framing for one outbound JSON payload.
async fn send_json<S>(sink: &mut S, text: &str) -> Result<()>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    if text.len() > MAX_PAYLOAD {
        warn!(bytes = text.len(), "outbound frame exceeds max payload — dropped");
        return Ok(());
    }
    if text.len() > COMPRESSION_THRESHOLD {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes())?;
        sink.send(Message::Binary(encoder.finish()?)).await?;
    } else {
        sink.send(Message::Text(text.to_string())).await?;
    }
    Ok(())
}

fn error_frame(err: &SwarmError, correlation_id: &Value) -> String {
    json!({
        "type": "error",
        "kind": err.kind,
        "message": err.message,
        "correlationId": correlation_id,
    })
    .to_string()
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    ctx: Arc<AppContext>,
    cancel: CancellationToken,
) -> Result<()> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(MAX_PAYLOAD),
        max_frame_size: Some(MAX_PAYLOAD),
        ..Default::default()
    };

    let expected_token = ctx.config.stream.token.clone();
    let mut params: Option<StreamParams> = None;
    let ws = accept_hdr_async_with_config(
        stream,
        |req: &Request, resp: Response| match check_request(req, &expected_token) {
            Ok(p) => {
                params = Some(p);
                Ok(resp)
            }
            Err((status, body)) => Err(reject(status, body)),
        },
        Some(ws_config),
    )
    .await?;
    let params = params.expect("params set on successful handshake");
    let (mut sink, mut inbound) = ws.split();

    let client_id = uuid::Uuid::new_v4().to_string();
    let (subscriber, mut rx) = ctx.bus.attach(&client_id, &params.channels).await;
    info!(client_id = %client_id, request_id = %params.request_id, "stream client connected");

    // Handshake frame, sent before any event can reach this subscriber.
    let init = json!({
        "type": "init",
        "data": {
            "clientId": client_id,
            "serverTime": chrono::Utc::now(),
            "channels": subscriber.subscribed_channels(),
        }
    });
    send_json(&mut sink, &init.to_string()).await?;

    let mut ping = tokio::time::interval(HEARTBEAT_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // consume the immediate first tick

    let mut invalid_logged = false;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                // Drain what the bus already queued (including the final
                // shutdown event), then close.
                while let Ok(Some(frame)) =
                    tokio::time::timeout(SHUTDOWN_DRAIN, rx.recv()).await
                {
                    let _ = send_json(&mut sink, &frame.json).await;
                    subscriber.on_drained(frame.bytes);
                }
                break;
            }

            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        let Frame { json, bytes } = frame;
                        if send_json(&mut sink, &json).await.is_err() {
                            break;
                        }
                        subscriber.on_drained(bytes);
                    }
                    // Bus detached us: idle timeout or shutdown.
                    None => break,
                }
            }

            msg = inbound.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        subscriber.touch();
                        handle_client_frame(
                            &ctx,
                            &subscriber,
                            &text,
                            &mut sink,
                            &mut invalid_logged,
                        )
                        .await?;
                    }
                    Some(Ok(Message::Pong(_))) => subscriber.touch(),
                    Some(Ok(Message::Ping(data))) => {
                        subscriber.touch();
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(client_id = %client_id, err = %e, "stream read error");
                        break;
                    }
                    _ => {}
                }
            }

            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    ctx.bus.detach(&client_id).await;
    Ok(())
}

async fn handle_client_frame<S>(
    ctx: &AppContext,
    subscriber: &Subscriber,
    text: &str,
    sink: &mut S,
    invalid_logged: &mut bool,
) -> Result<()>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            // Invalid frames are dropped; logged once per client.
            if !*invalid_logged {
                warn!(client_id = %subscriber.client_id, err = %e, "invalid client frame — dropping");
                *invalid_logged = true;
            }
            return Ok(());
        }
    };

    match frame {
        ClientFrame::Subscribe { channels } => {
            subscriber.subscribe(&channels);
            debug!(client_id = %subscriber.client_id, ?channels, "subscribed");
        }
        ClientFrame::Unsubscribe { channels } => {
            subscriber.unsubscribe(&channels);
            debug!(client_id = %subscriber.client_id, ?channels, "unsubscribed");
        }
        ClientFrame::Query { data } => {
            let response = match dispatch_query(ctx, subscriber, &data.kind, &data.args).await {
                Ok(result) => json!({
                    "type": "query_result",
                    "id": data.id,
                    "kind": data.kind,
                    "result": result,
                })
                .to_string(),
                Err(err) => error_frame(&err, &data.id),
            };
            send_json(sink, &response).await?;
        }
        ClientFrame::Command { data } => {
            let response = match dispatch_command(ctx, &data.action, &data.args).await {
                Ok(result) => json!({
                    "type": "command_result",
                    "id": data.id,
                    "action": data.action,
                    "result": result,
                })
                .to_string(),
                Err(err) => error_frame(&err, &data.id),
            };
            send_json(sink, &response).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_comparison_is_exact() {
        assert!(tokens_equal("abc", "abc"));
        assert!(!tokens_equal("abc", "abd"));
        assert!(!tokens_equal("abc", "abcd"));
        assert!(tokens_equal("", ""));
    }

    #[test]
    fn query_parsing_tolerates_odd_input() {
        let kv = parse_query("requestId=r1&token=t&channels=a,b&flag");
        assert_eq!(kv[0], ("requestId".to_string(), "r1".to_string()));
        assert_eq!(kv[3], ("flag".to_string(), String::new()));
    }

    #[test]
    fn check_request_enforces_path_and_token() {
        let req = Request::builder()
            .uri("/stream?requestId=r1&token=secret")
            .body(())
            .unwrap();
        assert!(check_request(&req, "secret").is_ok());
        assert_eq!(check_request(&req, "other").unwrap_err().0, 401);

        let bad_path = Request::builder()
            .uri("/other?requestId=r1")
            .body(())
            .unwrap();
        assert_eq!(check_request(&bad_path, "").unwrap_err().0, 404);

        let no_request_id = Request::builder().uri("/stream").body(()).unwrap();
        assert_eq!(check_request(&no_request_id, "").unwrap_err().0, 400);
    }

    #[test]
    fn channels_split_on_comma() {
        let req = Request::builder()
            .uri("/stream?requestId=r1&channels=step_started,task_completed")
            .body(())
            .unwrap();
        let params = check_request(&req, "").unwrap();
        assert_eq!(params.channels, vec!["step_started", "task_completed"]);
    }
}
