//! HTTP/1.1 upgrade to WebSocket, both ends.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Framed, FramedParts};

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameCodec};

pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the request/response head.
pub const MAX_HEAD_LENGTH: usize = 8 * 1024;

/// `base64(SHA1(key + GUID))`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Random 16-byte nonce for the client `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    STANDARD.encode(rand::random::<[u8; 16]>())
}

/// The parts of an upgrade request the server cares about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
}

impl UpgradeRequest {
    /// Machine name taken from a `/<name>` request path, if any.
    pub fn path_machine(&self) -> Option<&str> {
        let name = self.path.split('?').next()?.trim_start_matches('/');
        (!name.is_empty() && !name.contains('/')).then_some(name)
    }
}

fn header<'a>(lines: &[&'a str], name: &str) -> Option<&'a str> {
    lines.iter().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

pub fn parse_upgrade_request(head: &str) -> Result<UpgradeRequest, ProtocolError> {
    let lines: Vec<&str> = head.split("\r\n").collect();
    let mut request_line = lines.first().copied().unwrap_or_default().split_whitespace();
    let (Some("GET"), Some(path)) = (request_line.next(), request_line.next()) else {
        return Err(ProtocolError::Handshake("expected GET request".into()));
    };
    let upgrade = header(&lines[1..], "upgrade").unwrap_or_default();
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(ProtocolError::Handshake("missing Upgrade: websocket".into()));
    }
    let key = header(&lines[1..], "sec-websocket-key")
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ProtocolError::Handshake("missing Sec-WebSocket-Key".into()))?;
    Ok(UpgradeRequest {
        path: path.to_string(),
        key: key.to_string(),
    })
}

pub fn upgrade_response(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    )
}

pub fn client_request(host: &str, path: &str, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}

/// Read up to and including the blank line that ends an HTTP head.
/// Returns the head and whatever bytes followed it.
async fn read_head<S>(stream: &mut S) -> Result<(String, BytesMut), ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = buf.split_to(end + 4);
            let head = std::str::from_utf8(&head[..end])
                .map_err(|_| ProtocolError::InvalidUtf8("http head"))?
                .to_string();
            return Ok((head, buf));
        }
        if buf.len() > MAX_HEAD_LENGTH {
            return Err(ProtocolError::Handshake("head too large".into()));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(ProtocolError::Handshake("eof before end of head".into()));
        }
    }
}

fn framed<S>(stream: S, codec: FrameCodec, leftover: BytesMut) -> Framed<S, FrameCodec>
where
    S: AsyncRead + AsyncWrite,
{
    let mut parts = FramedParts::new::<Frame>(stream, codec);
    parts.read_buf = leftover;
    Framed::from_parts(parts)
}

/// Server side: answer the upgrade and hand back a framed connection.
/// Malformed requests get a `400` before the error is returned.
pub async fn accept<S>(
    mut stream: S,
    codec: FrameCodec,
) -> Result<(UpgradeRequest, Framed<S, FrameCodec>), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (head, leftover) = read_head(&mut stream).await?;
    let request = match parse_upgrade_request(&head) {
        Ok(request) => request,
        Err(e) => {
            let body = e.to_string();
            let resp = format!(
                "HTTP/1.1 400 Bad Request\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(resp.as_bytes()).await.ok();
            return Err(e);
        }
    };
    stream
        .write_all(upgrade_response(&request.key).as_bytes())
        .await?;
    tracing::debug!(path = %request.path, "websocket upgrade accepted");
    Ok((request, framed(stream, codec, leftover)))
}

/// Client side: send the upgrade request and verify the accept key.
pub async fn connect<S>(
    mut stream: S,
    host: &str,
    path: &str,
) -> Result<Framed<S, FrameCodec>, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    stream
        .write_all(client_request(host, path, &key).as_bytes())
        .await?;
    let (head, leftover) = read_head(&mut stream).await?;
    let lines: Vec<&str> = head.split("\r\n").collect();
    let status = lines.first().copied().unwrap_or_default();
    if status.split_whitespace().nth(1) != Some("101") {
        return Err(ProtocolError::Handshake(format!("unexpected status: {status}")));
    }
    if header(&lines[1..], "sec-websocket-accept") != Some(accept_key(&key).as_str()) {
        return Err(ProtocolError::Handshake("bad Sec-WebSocket-Accept".into()));
    }
    Ok(framed(stream, FrameCodec::client(), leftover))
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};

    use super::*;

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn parses_upgrade_request() {
        let head = client_request("localhost:8000", "/demo", "abc==")
            .trim_end()
            .to_string();
        let req = parse_upgrade_request(&head).unwrap();
        assert_eq!(req.path, "/demo");
        assert_eq!(req.key, "abc==");
        assert_eq!(req.path_machine(), Some("demo"));
    }

    #[test]
    fn path_machine_only_for_single_segment() {
        let req = |path: &str| UpgradeRequest {
            path: path.into(),
            key: "k".into(),
        };
        assert_eq!(req("/").path_machine(), None);
        assert_eq!(req("/a/b").path_machine(), None);
        assert_eq!(req("/demo?x=1").path_machine(), Some("demo"));
    }

    #[test]
    fn rejects_plain_http() {
        let err = parse_upgrade_request("GET / HTTP/1.1\r\nHost: x").unwrap_err();
        assert!(err.to_string().contains("Upgrade"));
        let err =
            parse_upgrade_request("GET / HTTP/1.1\r\nUpgrade: WebSocket").unwrap_err();
        assert!(err.to_string().contains("Sec-WebSocket-Key"));
        assert!(parse_upgrade_request("POST / HTTP/1.1").is_err());
    }

    #[tokio::test]
    async fn client_and_server_complete_handshake() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            let (req, mut framed) = accept(server_io, FrameCodec::server()).await.unwrap();
            let frame = framed.next().await.unwrap().unwrap();
            framed.send(Frame::text(format!("{}:{frame:?}", req.path))).await.unwrap();
        });

        let mut client = connect(client_io, "test", "/demo").await.unwrap();
        client.send(Frame::text("subscribe demo")).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply, Frame::text("/demo:Text(\"subscribe demo\")"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn bytes_after_head_reach_the_codec() {
        let (mut client_io, server_io) = tokio::io::duplex(4096);
        let mut raw = client_request("test", "/", "k==").into_bytes();
        raw.extend_from_slice(&[0x81, 0x80, 0, 0, 0, 0]);
        client_io.write_all(&raw).await.unwrap();

        let (_, mut framed) = accept(server_io, FrameCodec::server()).await.unwrap();
        assert_eq!(framed.next().await.unwrap().unwrap(), Frame::text(""));
    }

    #[tokio::test]
    async fn bad_request_gets_400() {
        let (mut client_io, server_io) = tokio::io::duplex(4096);
        client_io.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        assert!(accept(server_io, FrameCodec::server()).await.is_err());
        let mut resp = String::new();
        client_io.read_to_string(&mut resp).await.unwrap();
        assert!(resp.starts_with("HTTP/1.1 400"));
    }
}
