//! Consumer connections on the client port.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use popcorn_core::ids::ClientId;
use popcorn_protocol::frame::{CLOSE_NORMAL, DEFAULT_MAX_PAYLOAD};
use popcorn_protocol::{handshake, Frame, FrameCodec};
use popcorn_telemetry::MetricsRecorder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::app_server::AppServer;
use crate::broker::Broker;
use crate::error::BrokerError;

const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// How long a closing connection waits for its writer to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything a consumer connection needs.
#[derive(Clone)]
pub struct ConsumerContext {
    pub broker: Arc<Broker>,
    pub apps: Arc<AppServer>,
    pub heartbeat_interval: Duration,
    pub max_frame_payload: usize,
    pub metrics: Option<Arc<MetricsRecorder>>,
}

impl ConsumerContext {
    pub fn new(broker: Arc<Broker>, apps: Arc<AppServer>) -> Self {
        Self {
            broker,
            apps,
            heartbeat_interval: Duration::from_secs(30),
            max_frame_payload: DEFAULT_MAX_PAYLOAD,
            metrics: None,
        }
    }

    fn update_gauge(&self) {
        if let Some(m) = &self.metrics {
            m.gauge_set("consumers.connected", &[], self.broker.clients().count() as i64);
        }
    }
}

/// Run one consumer text command. Returns the error line to send back,
/// if any.
pub fn dispatch_text(ctx: &ConsumerContext, id: &ClientId, text: &str) -> Option<String> {
    let first = text.lines().next().unwrap_or_default();
    let mut tokens = first.split_whitespace();
    let result = match (tokens.next(), tokens.next(), tokens.next()) {
        (Some("subscribe"), Some(machine), None) => ctx
            .broker
            .subscribe(id, machine)
            .map_err(|e| e.to_string()),
        (Some("command"), Some(machine), None) => ctx
            .apps
            .send_command(machine, text, id)
            .map_err(|e| e.to_string()),
        _ => Err(BrokerError::BadCommand(first.trim().to_string()).to_string()),
    };
    match result {
        Ok(()) => None,
        Err(e) => {
            tracing::debug!(client_id = %id, error = %e, "consumer command failed");
            Some(format!("error: {e}"))
        }
    }
}

fn reply(ctx: &ConsumerContext, id: &ClientId, line: Option<String>) {
    if let Some(line) = line {
        if let Err(e) = ctx.broker.clients().send_to(id, line) {
            tracing::debug!(client_id = %id, error = %e, "error reply dropped");
        }
    }
}

/// Serve one consumer connection: handshake, optional URL subscription,
/// then the reader/writer pair until either side closes.
pub async fn handle_consumer<S>(stream: S, ctx: ConsumerContext, cancel: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let codec = FrameCodec::server().with_max_payload(ctx.max_frame_payload);
    let (request, framed) = match handshake::accept(stream, codec).await {
        Ok(accepted) => accepted,
        Err(e) => {
            tracing::warn!(error = %e, "consumer handshake failed");
            return;
        }
    };

    let (client_id, mut rx) = ctx.broker.clients().register();
    ctx.update_gauge();
    tracing::info!(client_id = %client_id, path = %request.path, "consumer connected");

    if let Some(machine) = request.path_machine() {
        let line = ctx
            .broker
            .subscribe(&client_id, machine)
            .err()
            .map(|e| format!("error: {e}"));
        reply(&ctx, &client_id, line);
    }

    let (mut sink, mut frames) = framed.split();
    let (ctrl_tx, mut ctrl_rx) = mpsc::channel::<Frame>(8);

    // Writer: queued text, control replies and periodic pings.
    let writer_cid = client_id.clone();
    let heartbeat = ctx.heartbeat_interval;
    let writer_cancel = cancel.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => {
                    sink.send(Frame::close(CLOSE_GOING_AWAY, "server shutting down")).await.ok();
                    break;
                }
                // The reader dropping its sender means the transport is gone.
                frame = ctrl_rx.recv() => match frame {
                    Some(frame) => {
                        let closing = matches!(frame, Frame::Close { .. });
                        if sink.send(frame).await.is_err() || closing {
                            break;
                        }
                    }
                    None => break,
                },
                msg = rx.recv() => match msg {
                    Some(text) => {
                        if sink.send(Frame::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        sink.send(Frame::close(CLOSE_NORMAL, "")).await.ok();
                        break;
                    }
                },
                _ = ping_interval.tick() => {
                    if sink.send(Frame::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                    tracing::trace!(client_id = %writer_cid, "sent ping");
                }
            }
        }
    });

    // Reader: commands in, pongs recorded, close echoed.
    let reader_ctx = ctx.clone();
    let reader_cid = client_id.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(item) = frames.next().await {
            match item {
                Ok(Frame::Text(text)) => {
                    let line = dispatch_text(&reader_ctx, &reader_cid, &text);
                    reply(&reader_ctx, &reader_cid, line);
                }
                Ok(Frame::Ping(data)) => {
                    if ctrl_tx.send(Frame::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Ok(Frame::Pong(_)) => reader_ctx.broker.clients().record_pong(&reader_cid),
                Ok(Frame::Close { code, .. }) => {
                    tracing::debug!(client_id = %reader_cid, ?code, "consumer sent close");
                    ctrl_tx
                        .send(Frame::Close {
                            code,
                            reason: String::new(),
                        })
                        .await
                        .ok();
                    break;
                }
                Err(e) => {
                    tracing::warn!(client_id = %reader_cid, error = %e, "consumer protocol error");
                    ctrl_tx
                        .send(Frame::close(CLOSE_PROTOCOL_ERROR, e.to_string()))
                        .await
                        .ok();
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => {
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
            }
        }
    }

    ctx.broker.remove_client(&client_id);
    ctx.update_gauge();
    tracing::info!(client_id = %client_id, "consumer disconnected");
}
