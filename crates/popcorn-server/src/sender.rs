//! Sending side of the app port: one-shot transactions and long-lived
//! app connections.

use std::collections::VecDeque;

use futures::{SinkExt, StreamExt};
use popcorn_protocol::event::MESSAGE;
use popcorn_protocol::{Event, EventCodec};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::app_server::COMMAND_EVENT;
use crate::error::SenderError;
use crate::producer::{APP_CONNECT, FIRE_AND_FORGET, OK, ONE_SHOT_COMMAND, REPLY_SUCCESS};

async fn dial(addr: &str) -> Result<TcpStream, SenderError> {
    TcpStream::connect(addr)
        .await
        .map_err(|source| SenderError::Connect {
            addr: addr.to_string(),
            source,
        })
}

fn rejection(data: &str) -> SenderError {
    SenderError::Rejected(data.strip_prefix("error: ").unwrap_or(data).to_string())
}

/// Send one transaction and wait for the server's verdict.
pub async fn send_one_shot(addr: &str, payload: &str) -> Result<(), SenderError> {
    one_shot_over(dial(addr).await?, payload).await
}

pub async fn one_shot_over<S>(stream: S, payload: &str) -> Result<(), SenderError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, EventCodec::new());
    framed.send(Event::new(ONE_SHOT_COMMAND, payload)).await?;
    match framed.next().await.transpose()? {
        Some(reply) if reply.event_type == REPLY_SUCCESS => Ok(()),
        Some(reply) => Err(rejection(&reply.data)),
        None => Err(SenderError::NoReply),
    }
}

/// Send one transaction without waiting for any reply.
pub async fn fire_and_forget(addr: &str, payload: &str) -> Result<(), SenderError> {
    let mut framed = Framed::new(dial(addr).await?, EventCodec::new());
    framed.send(Event::new(FIRE_AND_FORGET, payload)).await?;
    SinkExt::<Event>::close(&mut framed).await?;
    Ok(())
}

/// A connected producer app.
pub struct AppConnection<S = TcpStream> {
    framed: Framed<S, EventCodec>,
    commands: VecDeque<Event>,
}

impl AppConnection<TcpStream> {
    pub async fn connect(addr: &str, app: &str) -> Result<Self, SenderError> {
        Self::handshake(dial(addr).await?, app).await
    }
}

impl<S> AppConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Announce the app over an open stream and wait for `ok`.
    pub async fn handshake(stream: S, app: &str) -> Result<Self, SenderError> {
        let mut conn = Self {
            framed: Framed::new(stream, EventCodec::new()),
            commands: VecDeque::new(),
        };
        conn.framed.send(Event::new(APP_CONNECT, app)).await?;
        conn.await_reply().await?;
        Ok(conn)
    }

    /// Run a transaction (`provide`, `update` or `abandon`).
    pub async fn transact(&mut self, payload: &str) -> Result<(), SenderError> {
        self.framed.send(Event::message(payload)).await?;
        self.await_reply().await
    }

    /// Next consumer command forwarded by the server. `None` once the
    /// server closes the connection.
    pub async fn next_command(&mut self) -> Result<Option<Event>, SenderError> {
        if let Some(cmd) = self.commands.pop_front() {
            return Ok(Some(cmd));
        }
        while let Some(event) = self.framed.next().await.transpose()? {
            if event.event_type == COMMAND_EVENT {
                return Ok(Some(event));
            }
            tracing::debug!(event_type = %event.event_type, "unexpected event from server");
        }
        Ok(None)
    }

    // Replies come back in order; commands that arrive first are queued.
    async fn await_reply(&mut self) -> Result<(), SenderError> {
        while let Some(event) = self.framed.next().await.transpose()? {
            match event.event_type.as_str() {
                COMMAND_EVENT => self.commands.push_back(event),
                MESSAGE if event.data == OK => return Ok(()),
                MESSAGE => return Err(rejection(&event.data)),
                other => tracing::debug!(event_type = %other, "ignoring event while awaiting reply"),
            }
        }
        Err(SenderError::NoReply)
    }
}
