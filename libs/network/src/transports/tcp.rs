//! TCP stream transport
//!
//! Reads go into one reusable buffer sized by configuration; a read of zero
//! bytes means the peer closed its write side.

use super::{ReadOutcome, StreamReader, StreamWriter, Transport};
use crate::{NetworkError, NetworkResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{trace, warn};

pub struct TcpReader {
    half: OwnedReadHalf,
    buffer: BytesMut,
    buffer_size: usize,
}

impl TcpReader {
    pub fn new(half: OwnedReadHalf, buffer_size: usize) -> Self {
        Self {
            half,
            buffer: BytesMut::with_capacity(buffer_size),
            buffer_size,
        }
    }
}

#[async_trait]
impl StreamReader for TcpReader {
    async fn read(&mut self) -> NetworkResult<ReadOutcome> {
        // reclaims the allocation once earlier chunks are dropped
        self.buffer.reserve(self.buffer_size);
        let n = self
            .half
            .read_buf(&mut self.buffer)
            .await
            .map_err(|e| NetworkError::io("Failed to read from TCP stream", e))?;
        if n == 0 {
            return Ok(ReadOutcome::Eof);
        }
        trace!(bytes = n, "tcp read");
        Ok(ReadOutcome::Data(self.buffer.split().freeze()))
    }
}

pub struct TcpWriter {
    half: OwnedWriteHalf,
}

impl TcpWriter {
    pub fn new(half: OwnedWriteHalf) -> Self {
        Self { half }
    }
}

#[async_trait]
impl StreamWriter for TcpWriter {
    async fn write(&mut self, data: Bytes) -> NetworkResult<()> {
        self.half
            .write_all(&data)
            .await
            .map_err(|e| NetworkError::io("Failed to write to TCP stream", e))?;
        self.half
            .flush()
            .await
            .map_err(|e| NetworkError::io("Failed to flush TCP stream", e))
    }

    async fn close(&mut self) -> NetworkResult<()> {
        self.half
            .shutdown()
            .await
            .map_err(|e| NetworkError::io("Failed to shut down TCP stream", e))
    }
}

impl Transport {
    /// Split an accepted TCP stream
    pub fn tcp(stream: TcpStream, read_buffer_size: usize) -> NetworkResult<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        let remote_addr = stream
            .peer_addr()
            .map_err(|e| NetworkError::io("Failed to get peer address", e))?;
        let local_addr = stream
            .local_addr()
            .map_err(|e| NetworkError::io("Failed to get local address", e))?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: Box::new(TcpReader::new(read_half, read_buffer_size)),
            writer: Box::new(TcpWriter::new(write_half)),
            remote_addr,
            local_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_transport_read_write_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"hello").await.unwrap();
            let mut reply = [0u8; 3];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"ack");
            // dropping the stream closes it
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = Transport::tcp(stream, 64).unwrap();
        assert_eq!(transport.local_addr, addr);

        let mut received = Vec::new();
        while received.len() < 5 {
            match transport.reader.read().await.unwrap() {
                ReadOutcome::Data(chunk) => received.extend_from_slice(&chunk),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(received, b"hello");

        transport.writer.write(Bytes::from_static(b"ack")).await.unwrap();
        client.await.unwrap();

        assert_eq!(transport.reader.read().await.unwrap(), ReadOutcome::Eof);
    }
}
