//! WebSocket transport
//!
//! Message-oriented: one binary frame carries exactly one encoded message.
//! Control frames and text frames carry no message and read as
//! [`ReadOutcome::Idle`]; a close frame reads as [`ReadOutcome::Eof`].

use super::{ReadOutcome, StreamReader, StreamWriter, Transport};
use crate::{NetworkError, NetworkResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
    remote_addr: SocketAddr,
}

#[async_trait]
impl<S> StreamReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self) -> NetworkResult<ReadOutcome> {
        match self.stream.next().await {
            Some(Ok(WsMessage::Binary(data))) => {
                trace!(bytes = data.len(), "websocket read");
                Ok(ReadOutcome::Data(Bytes::from(data)))
            }
            Some(Ok(WsMessage::Close(frame))) => {
                debug!(remote = %self.remote_addr, ?frame, "websocket close frame");
                Ok(ReadOutcome::Eof)
            }
            Some(Ok(_)) => Ok(ReadOutcome::Idle),
            Some(Err(e)) => Err(NetworkError::websocket(
                "Failed to read websocket frame",
                Some(self.remote_addr),
                e,
            )),
            None => Ok(ReadOutcome::Eof),
        }
    }
}

pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
    remote_addr: SocketAddr,
}

#[async_trait]
impl<S> StreamWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, data: Bytes) -> NetworkResult<()> {
        self.sink
            .send(WsMessage::Binary(data.to_vec()))
            .await
            .map_err(|e| {
                NetworkError::websocket(
                    "Failed to write websocket frame",
                    Some(self.remote_addr),
                    e,
                )
            })
    }

    async fn close(&mut self) -> NetworkResult<()> {
        self.sink.close().await.map_err(|e| {
            NetworkError::websocket("Failed to close websocket", Some(self.remote_addr), e)
        })
    }
}

impl Transport {
    /// Split an established WebSocket stream
    pub fn websocket<S>(
        ws: WebSocketStream<S>,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        Self {
            reader: Box::new(WsReader {
                stream,
                remote_addr,
            }),
            writer: Box::new(WsWriter { sink, remote_addr }),
            remote_addr,
            local_addr,
        }
    }

    /// Run the server-side WebSocket handshake on an accepted TCP stream
    pub async fn accept_websocket(stream: TcpStream) -> NetworkResult<Self> {
        let remote_addr = stream
            .peer_addr()
            .map_err(|e| NetworkError::io("Failed to get peer address", e))?;
        let local_addr = stream
            .local_addr()
            .map_err(|e| NetworkError::io("Failed to get local address", e))?;
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| NetworkError::websocket("WebSocket handshake failed", Some(remote_addr), e))?;
        Ok(Self::websocket(ws, remote_addr, local_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_websocket_frames_map_to_outcomes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
                .await
                .unwrap();
            ws.send(WsMessage::Ping(vec![1])).await.unwrap();
            ws.send(WsMessage::Text("ignored".into())).await.unwrap();
            ws.send(WsMessage::Binary(b"payload".to_vec())).await.unwrap();
            match ws.next().await {
                Some(Ok(WsMessage::Binary(data))) => assert_eq!(data, b"reply"),
                // the pong for our ping may arrive first
                Some(Ok(WsMessage::Pong(_))) => match ws.next().await {
                    Some(Ok(WsMessage::Binary(data))) => assert_eq!(data, b"reply"),
                    other => panic!("unexpected frame {other:?}"),
                },
                other => panic!("unexpected frame {other:?}"),
            }
            ws.close(None).await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = Transport::accept_websocket(stream).await.unwrap();

        assert_eq!(transport.reader.read().await.unwrap(), ReadOutcome::Idle);
        assert_eq!(transport.reader.read().await.unwrap(), ReadOutcome::Idle);
        assert_eq!(
            transport.reader.read().await.unwrap(),
            ReadOutcome::Data(Bytes::from_static(b"payload"))
        );

        transport
            .writer
            .write(Bytes::from_static(b"reply"))
            .await
            .unwrap();
        assert_eq!(transport.reader.read().await.unwrap(), ReadOutcome::Eof);
        client.await.unwrap();
    }
}
