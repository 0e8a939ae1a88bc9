use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::Duration,
};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("WebSocket Error")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Connection closed by controller")]
    Closed,
    #[error("Read timed out after {0:?}")]
    Timeout(Duration),
    #[error("Not connected")]
    NotConnected,
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[serde(alias = "ws")]
    WebSocket,
    Tcp,
}

/// Where the controller lives and how to talk to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub kind: TransportKind,
}

impl Endpoint {
    pub fn new(host: &str, port: u16, kind: TransportKind) -> Self {
        Self {
            host: host.to_string(),
            port,
            kind,
        }
    }

    /// Same port / transport, different address
    pub fn with_host(&self, host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..self.clone()
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransportKind::WebSocket => write!(f, "{}", self.url()),
            TransportKind::Tcp => write!(f, "tcp://{}:{}", self.host, self.port),
        }
    }
}

/// One live session with the controller carrying JSON text frames
#[async_trait::async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError>;
    /// Waits for the next complete text frame
    async fn recv_text(&mut self) -> Result<String, TransportError>;
    async fn ping(&mut self) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Trait to allow different ways of opening a [`Transport`], so that
/// connection handling can be exercised without a controller
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>, TransportError>;
}

/// Opens real network sessions based on [`Endpoint::kind`]
pub struct NetConnector;

#[async_trait::async_trait]
impl Connector for NetConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>, TransportError> {
        match endpoint.kind {
            TransportKind::WebSocket => Ok(Box::new(WsTransport::connect(endpoint).await?)),
            TransportKind::Tcp => Ok(Box::new(TcpTransport::connect(endpoint).await?)),
        }
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let (stream, _resp) = tokio_tungstenite::connect_async(endpoint.url()).await?;
        log::debug!("WebSocket session open to {endpoint:}");
        Ok(Self { stream })
    }
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.stream.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    async fn recv_text(&mut self) -> Result<String, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return Ok(text),
                    Err(e) => {
                        log::warn!("Dropping non utf8 binary frame {e:}");
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                // pings are answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.stream.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        use tokio_tungstenite::tungstenite::Error;
        match self.stream.close(None).await {
            Ok(()) | Err(Error::ConnectionClosed) | Err(Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Raw TCP carrying the same JSON without any framing: frames are
/// carved out of the byte stream one complete JSON value at a time
pub struct TcpTransport {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl TcpTransport {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;
        log::debug!("TCP session open to {endpoint:}");
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(4096),
        }
    }

    fn take_frame(&mut self) -> Result<Option<String>, TransportError> {
        let end = {
            let mut values = serde_json::Deserializer::from_slice(&self.buffer)
                .into_iter::<serde::de::IgnoredAny>();
            match values.next() {
                Some(Ok(_)) => values.byte_offset(),
                Some(Err(e)) if e.is_eof() => return Ok(None),
                Some(Err(e)) => {
                    self.buffer.clear();
                    return Err(TransportError::InvalidFrame(e.to_string()));
                }
                None => {
                    // whitespace only
                    self.buffer.clear();
                    return Ok(None);
                }
            }
        };

        let frame = String::from_utf8_lossy(&self.buffer[..end]).trim().to_string();
        self.buffer.drain(..end);
        Ok(Some(frame))
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.stream.write_all(text.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        Ok(())
    }

    async fn recv_text(&mut self) -> Result<String, TransportError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(frame);
            }
            let len = self.stream.read(&mut chunk).await?;
            if len == 0 {
                return Err(TransportError::Closed);
            }
            self.buffer.extend_from_slice(&chunk[..len]);
        }
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        // No ping frame exists on the raw socket; surface any pending
        // socket error instead
        self.stream.writable().await?;
        if let Some(e) = self.stream.take_error()? {
            return Err(e.into());
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.stream.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn endpoint_formats() {
        let ws = Endpoint::new("10.0.0.5", 6680, TransportKind::WebSocket);
        assert_eq!(ws.url(), "ws://10.0.0.5:6680");
        assert_eq!(ws.with_host("10.0.0.9").to_string(), "ws://10.0.0.9:6680");
        let tcp = Endpoint::new("10.0.0.5", 6681, TransportKind::Tcp);
        assert_eq!(tcp.to_string(), "tcp://10.0.0.5:6681");
    }

    #[tokio::test]
    async fn tcp_frames_split_and_joined() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            // two values in one write, then one value split across writes
            sock.write_all(br#"{"messageID":"1"} {"messageID":"2"}"#)
                .await
                .expect("write");
            sock.write_all(br#"{"messageID":"#).await.expect("write");
            tokio::time::sleep(Duration::from_millis(20)).await;
            sock.write_all(br#""3","objectList":[]}"#).await.expect("write");
        });

        let endpoint = Endpoint::new("127.0.0.1", addr.port(), TransportKind::Tcp);
        let mut transport = TcpTransport::connect(&endpoint).await.expect("connect");
        assert_eq!(transport.recv_text().await.expect("1"), r#"{"messageID":"1"}"#);
        assert_eq!(transport.recv_text().await.expect("2"), r#"{"messageID":"2"}"#);
        assert_eq!(
            transport.recv_text().await.expect("3"),
            r#"{"messageID":"3","objectList":[]}"#
        );
        server.await.expect("server");
        assert!(matches!(
            transport.recv_text().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn tcp_garbage_is_invalid_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            sock.write_all(b"}}not json").await.expect("write");
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let endpoint = Endpoint::new("127.0.0.1", addr.port(), TransportKind::Tcp);
        let mut transport = TcpTransport::connect(&endpoint).await.expect("connect");
        assert!(matches!(
            transport.recv_text().await,
            Err(TransportError::InvalidFrame(_))
        ));
    }
}
