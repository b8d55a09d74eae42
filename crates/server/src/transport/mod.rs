mod backpressure;
mod queue;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use wiregate_proto::MAX_TEXT_FRAME_LEN;

pub use backpressure::BackpressureGuard;
pub use queue::{SerialQueue, DEFAULT_QUEUE_DEPTH};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket handshake failed")]
    Handshake,
    #[error("connection closed")]
    Closed,
    #[error("websocket failure: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Frame read from the peer.
#[derive(Debug)]
pub enum Inbound {
    Text(String),
    Ping(Vec<u8>),
    Pong,
    Closed,
}

/// Frame queued for the peer. The writer task owns the sink; everything
/// else goes through this enum over the connection's outbound channel.
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

pub struct ChannelReader {
    stream: SplitStream<WebSocketStream<TcpStream>>,
}

pub struct ChannelWriter {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
}

/// Performs the server side of the WebSocket upgrade and captures the
/// access token when the client authenticates during the handshake,
/// from `Authorization: Bearer` or a `token`/`accessToken` query
/// parameter.
pub async fn accept(
    socket: TcpStream,
) -> Result<(ChannelReader, ChannelWriter, Option<String>), TransportError> {
    let config = WebSocketConfig {
        max_message_size: Some(MAX_TEXT_FRAME_LEN),
        max_frame_size: Some(MAX_TEXT_FRAME_LEN),
        ..WebSocketConfig::default()
    };
    let mut token = None;
    let callback = |request: &Request, response: Response| {
        token = bearer_token(request).or_else(|| request.uri().query().and_then(extract_token));
        Ok(response)
    };
    let stream = accept_hdr_async_with_config(socket, callback, Some(config))
        .await
        .map_err(|_| TransportError::Handshake)?;
    let (sink, stream) = stream.split();
    Ok((ChannelReader { stream }, ChannelWriter { sink }, token))
}

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_token(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        pair.strip_prefix("token=")
            .or_else(|| pair.strip_prefix("accessToken="))
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string())
    })
}

impl ChannelReader {
    /// Reads the next frame. Binary frames are rejected at the protocol
    /// layer; the wire speaks JSON text only.
    pub async fn next(&mut self) -> Result<Inbound, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(payload))) => return Ok(Inbound::Text(payload)),
                Some(Ok(Message::Ping(payload))) => return Ok(Inbound::Ping(payload)),
                Some(Ok(Message::Pong(_))) => return Ok(Inbound::Pong),
                Some(Ok(Message::Binary(_))) => return Err(TransportError::Closed),
                Some(Ok(Message::Close(_))) | None => return Ok(Inbound::Closed),
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(error)) => return Err(error.into()),
            }
        }
    }
}

impl ChannelWriter {
    pub async fn write(&mut self, frame: Outbound) -> Result<(), TransportError> {
        let message = match frame {
            Outbound::Text(payload) => Message::Text(payload),
            Outbound::Ping(payload) => Message::Ping(payload),
            Outbound::Pong(payload) => Message::Pong(payload),
            Outbound::Close { code, reason } => Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })),
        };
        self.sink.send(message).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.sink.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_extraction() {
        assert_eq!(extract_token("token=abc"), Some("abc".to_string()));
        assert_eq!(extract_token("v=1&token=abc&x=2"), Some("abc".to_string()));
        assert_eq!(extract_token("accessToken=abc"), Some("abc".to_string()));
        assert_eq!(extract_token("token="), None);
        assert_eq!(extract_token("other=abc"), None);
    }

    #[test]
    fn bearer_header_wins_over_query() {
        let request = Request::builder()
            .uri("ws://gateway/ws?token=from-query")
            .header("authorization", "Bearer from-header")
            .body(())
            .unwrap();
        assert_eq!(bearer_token(&request), Some("from-header".to_string()));
        let bare = Request::builder().uri("ws://gateway/ws").body(()).unwrap();
        assert_eq!(bearer_token(&bare), None);
    }
}
