//! WebSocket plumbing.
//!
//! Thin wrapper around `tokio-tungstenite` that splits a socket into a
//! [`WsWriter`] and a [`WsReader`] speaking in [`Payload`]s. The hub-facing
//! transport lives in [`super::websocket`]; this module only knows frames.

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::protocol::Payload;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A frame read from the socket.
#[derive(Debug)]
pub enum WsFrame {
    /// Text or binary application data.
    Data(Payload),
    /// Ping that must be answered with the same payload.
    Ping(Vec<u8>),
    /// Close frame.
    Close {
        /// Close code (1005 when the peer sent none).
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a payload as a text or binary frame matching its kind.
    pub async fn send(&mut self, payload: Payload) -> Result<()> {
        let message = match payload {
            Payload::Text(text) => tungstenite::Message::Text(text.into()),
            Payload::Binary(data) => tungstenite::Message::Binary(data.to_vec().into()),
        };
        self.sink
            .send(message)
            .await
            .context("WebSocket send failed")
    }

    /// Answer a ping.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data.into()))
            .await
            .context("WebSocket send_pong failed")
    }

    /// Send a close frame and flush.
    pub async fn close(&mut self) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Close(None))
            .await
            .context("WebSocket send_close failed")?;
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Next frame, or `None` when the stream ended without a close frame.
    ///
    /// Pongs and raw frames are skipped.
    pub async fn recv(&mut self) -> Option<Result<WsFrame>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => {
                    WsFrame::Data(Payload::Text(text.to_string()))
                }
                Ok(tungstenite::Message::Binary(data)) => {
                    WsFrame::Data(Payload::Binary(Bytes::from(data.to_vec())))
                }
                Ok(tungstenite::Message::Ping(data)) => WsFrame::Ping(data.to_vec()),
                Ok(tungstenite::Message::Close(close_frame)) => {
                    let (code, reason) = close_frame.map_or((1005, String::new()), |cf| {
                        (cf.code.into(), cf.reason.to_string())
                    });
                    WsFrame::Close { code, reason }
                }
                Ok(tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_)) => continue,
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            };
            return Some(Ok(frame));
        }
    }
}

/// Open a WebSocket to `url`, adding `headers` to the upgrade request.
pub async fn connect(url: &str, headers: &[(String, String)]) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    for (name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {name}"))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Rewrite an `http(s)` URL to `ws(s)`. Other schemes pass through.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
