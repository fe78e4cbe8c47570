//! Producer connections on the app port.
//!
//! The first event decides what the connection is:
//!
//! | first event      | behaviour                                             |
//! |------------------|-------------------------------------------------------|
//! | `appConnect`     | long-lived app; each `message` event is a transaction |
//! | `oneShotCommand` | one transaction, `replySuccess`/`replyError`, close   |
//! | `fireAndForget`  | one transaction, no reply, close                      |
//!
//! Anything else closes the connection.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use popcorn_protocol::event::MESSAGE;
use popcorn_protocol::{Event, EventCodec, ProtocolError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::app_server::{AppServer, Requester};

pub const APP_CONNECT: &str = "appConnect";
pub const ONE_SHOT_COMMAND: &str = "oneShotCommand";
pub const FIRE_AND_FORGET: &str = "fireAndForget";
pub const REPLY_SUCCESS: &str = "replySuccess";
pub const REPLY_ERROR: &str = "replyError";

/// Acknowledgement text for a committed transaction.
pub const OK: &str = "ok";

type EventStream<S> = Framed<S, EventCodec>;

/// Serve one producer connection until it closes or `cancel` fires.
pub async fn handle_producer<S>(
    stream: S,
    codec: EventCodec,
    apps: Arc<AppServer>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, codec);
    let first = tokio::select! {
        _ = cancel.cancelled() => return,
        first = framed.next() => first,
    };
    let result = match first {
        None => Ok(()),
        Some(Err(e)) => Err(e),
        Some(Ok(event)) => match event.event_type.as_str() {
            APP_CONNECT => run_app(framed, &event.data, &apps, cancel).await,
            ONE_SHOT_COMMAND => one_shot(framed, &event.data, &apps).await,
            FIRE_AND_FORGET => {
                if let Err(e) = apps.execute(&Requester::OneShot, &event.data) {
                    tracing::debug!(error = %e, "fire-and-forget transaction failed");
                }
                Ok(())
            }
            other => {
                tracing::warn!(event_type = %other, "unexpected first event, closing");
                Ok(())
            }
        },
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, kind = e.error_kind(), "producer connection error");
    }
}

async fn one_shot<S>(mut framed: EventStream<S>, payload: &str, apps: &AppServer) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reply = match apps.execute(&Requester::OneShot, payload) {
        Ok(()) => Event::new(REPLY_SUCCESS, OK),
        Err(e) => Event::new(REPLY_ERROR, format!("error: {e}")),
    };
    framed.send(reply).await?;
    SinkExt::<Event>::close(&mut framed).await
}

async fn run_app<S>(
    mut framed: EventStream<S>,
    payload: &str,
    apps: &AppServer,
    cancel: CancellationToken,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(name) = payload.split_whitespace().next() else {
        framed
            .send(Event::message("error: appConnect: missing app name"))
            .await?;
        return SinkExt::<Event>::close(&mut framed).await;
    };
    let (conn, mut commands) = apps.connect_app(name);
    let requester = Requester::App {
        conn: conn.clone(),
        name: name.to_string(),
    };

    let result = async {
        framed.send(Event::message(OK)).await?;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => framed.send(command).await?,
                incoming = framed.next() => {
                    let Some(event) = incoming.transpose()? else { break };
                    if event.event_type != MESSAGE {
                        tracing::debug!(app = %name, event_type = %event.event_type, "ignoring event");
                        continue;
                    }
                    let reply = match apps.execute(&requester, &event.data) {
                        Ok(()) => OK.to_string(),
                        Err(e) => format!("error: {e}"),
                    };
                    framed.send(Event::message(reply)).await?;
                }
            }
        }
        Ok::<(), ProtocolError>(())
    }
    .await;

    apps.disconnect(&conn);
    result
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    use super::*;
    use crate::app_server::AppEvent;

    struct Harness {
        apps: Arc<AppServer>,
        events: mpsc::UnboundedReceiver<AppEvent>,
        cancel: CancellationToken,
    }

    impl Harness {
        fn new() -> Self {
            let (tx, events) = mpsc::unbounded_channel();
            Self {
                apps: Arc::new(AppServer::new(tx, None)),
                events,
                cancel: CancellationToken::new(),
            }
        }

        fn connect(&self) -> (Framed<DuplexStream, EventCodec>, tokio::task::JoinHandle<()>) {
            let (client, server) = tokio::io::duplex(4096);
            let handle = tokio::spawn(handle_producer(
                server,
                EventCodec::new(),
                self.apps.clone(),
                self.cancel.clone(),
            ));
            (Framed::new(client, EventCodec::new()), handle)
        }
    }

    async fn next(framed: &mut Framed<DuplexStream, EventCodec>) -> Option<Event> {
        tokio::time::timeout(Duration::from_secs(1), framed.next())
            .await
            .ok()
            .flatten()
            .map(|r| r.unwrap())
    }

    #[tokio::test]
    async fn app_connect_then_transactions() {
        let mut h = Harness::new();
        let (mut app, _handle) = h.connect();

        app.send(Event::new(APP_CONNECT, "demoapp")).await.unwrap();
        assert_eq!(next(&mut app).await, Some(Event::message(OK)));

        app.send(Event::message("provide demo\nP .hinge/open\nP .hinge/closed"))
            .await
            .unwrap();
        assert_eq!(next(&mut app).await, Some(Event::message(OK)));
        assert!(matches!(h.events.recv().await, Some(AppEvent::Provide { .. })));

        app.send(Event::message("update demo\nC .hinge ajar")).await.unwrap();
        let reply = next(&mut app).await.unwrap();
        assert!(reply.data.starts_with("error: "), "{reply:?}");

        app.send(Event::message("update demo\nC .hinge closed")).await.unwrap();
        assert_eq!(next(&mut app).await, Some(Event::message(OK)));
    }

    #[tokio::test]
    async fn disconnect_abandons() {
        let mut h = Harness::new();
        let (mut app, handle) = h.connect();
        app.send(Event::new(APP_CONNECT, "demoapp")).await.unwrap();
        next(&mut app).await.unwrap();
        app.send(Event::message("provide demo\nP .a")).await.unwrap();
        next(&mut app).await.unwrap();

        drop(app);
        handle.await.unwrap();
        assert!(matches!(h.events.recv().await, Some(AppEvent::Provide { .. })));
        assert!(matches!(
            h.events.recv().await,
            Some(AppEvent::Abandon { machine, .. }) if machine == "demo"
        ));
        assert!(!h.apps.is_live("demo"));
    }

    #[tokio::test]
    async fn commands_are_forwarded_to_app() {
        let h = Harness::new();
        let (mut app, _handle) = h.connect();
        app.send(Event::new(APP_CONNECT, "demoapp")).await.unwrap();
        next(&mut app).await.unwrap();
        app.send(Event::message("provide demo\nP .a")).await.unwrap();
        next(&mut app).await.unwrap();

        h.apps
            .send_command("demo", "command demo\ntoggle", &popcorn_core::ids::ClientId::from_raw("c9"))
            .unwrap();
        let ev = next(&mut app).await.unwrap();
        assert_eq!(ev.event_type, "command");
        assert_eq!(ev.data, "command demo\ntoggle");
        assert_eq!(ev.id.as_deref(), Some("c9"));
    }

    #[tokio::test]
    async fn one_shot_replies_and_closes() {
        let h = Harness::new();
        let (mut sender, handle) = h.connect();
        sender
            .send(Event::new(ONE_SHOT_COMMAND, "provide bar\nP .a\nP .b"))
            .await
            .unwrap();
        assert_eq!(next(&mut sender).await, Some(Event::new(REPLY_SUCCESS, OK)));
        assert_eq!(next(&mut sender).await, None);
        handle.await.unwrap();
        assert!(h.apps.is_live("bar"));

        let (mut sender, _handle) = h.connect();
        sender
            .send(Event::new(ONE_SHOT_COMMAND, "badcommand\nP .a"))
            .await
            .unwrap();
        let reply = next(&mut sender).await.unwrap();
        assert_eq!(reply.event_type, REPLY_ERROR);
        assert!(reply.data.starts_with("error: bad transaction"));
    }

    #[tokio::test]
    async fn fire_and_forget_applies_without_reply() {
        let h = Harness::new();
        let (mut sender, handle) = h.connect();
        sender
            .send(Event::new(FIRE_AND_FORGET, "provide baz\nP .a"))
            .await
            .unwrap();
        assert_eq!(next(&mut sender).await, None);
        handle.await.unwrap();
        assert!(h.apps.is_live("baz"));
    }

    #[tokio::test]
    async fn unknown_first_event_closes() {
        let h = Harness::new();
        let (mut sender, handle) = h.connect();
        sender.send(Event::message("provide x\nP .a")).await.unwrap();
        assert_eq!(next(&mut sender).await, None);
        handle.await.unwrap();
        assert!(!h.apps.is_live("x"));
    }

    #[tokio::test]
    async fn cancel_ends_app_connection() {
        let h = Harness::new();
        let (mut app, handle) = h.connect();
        app.send(Event::new(APP_CONNECT, "demoapp")).await.unwrap();
        next(&mut app).await.unwrap();
        h.cancel.cancel();
        handle.await.unwrap();
        assert_eq!(h.apps.app_count(), 0);
    }
}
