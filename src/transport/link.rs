use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::errors::{MonkeyError, MonkeyResult};
use crate::protocol::{encode, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal.
    Failed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Failed,
            _ => ConnectionState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Failed => 3,
        }
    }
}

/// Connection state readable from any thread.
#[derive(Debug, Clone)]
pub struct SharedConnectionState(Arc<AtomicU8>);

impl Default for SharedConnectionState {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(ConnectionState::Disconnected.as_u8())))
    }
}

impl SharedConnectionState {
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `next` unless the link already failed.
    pub fn set(&self, next: ConnectionState) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ConnectionState::Failed.as_u8()).then_some(next.as_u8())
            });
    }
}

/// Read side of a link. Exactly one reader per connection.
pub struct LinkReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> LinkReader<R> {
    /// Reads whatever is available; `Ok(0)` means the peer closed the stream.
    pub async fn read_available(&mut self, buf: &mut [u8]) -> MonkeyResult<usize> {
        let n = self
            .inner
            .read(buf)
            .await
            .map_err(|e| MonkeyError::Transport(format!("read failed: {e}")))?;
        tracing::trace!(bytes = n, "read from link");
        Ok(n)
    }
}

/// Buffered write side of a link.
pub struct LinkWriter<W> {
    inner: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> LinkWriter<W> {
    /// Appends a whole encoded packet to the write buffer.
    pub async fn send(&mut self, bytes: &[u8]) -> MonkeyResult<()> {
        self.inner
            .write_all(bytes)
            .await
            .map_err(|e| MonkeyError::Transport(format!("write failed: {e}")))
    }

    pub async fn flush(&mut self) -> MonkeyResult<()> {
        self.inner
            .flush()
            .await
            .map_err(|e| MonkeyError::Transport(format!("flush failed: {e}")))
    }

    pub async fn send_packet(&mut self, packet: &Packet) -> MonkeyResult<()> {
        let bytes = encode(packet)?;
        self.send(&bytes).await?;
        self.flush().await
    }

    pub async fn shutdown(&mut self) -> MonkeyResult<()> {
        self.inner.shutdown().await.map_err(MonkeyError::from)
    }
}

/// One duplex byte-stream connection between agent and controller.
pub struct TransportLink<R, W> {
    reader: LinkReader<R>,
    writer: LinkWriter<W>,
}

pub type TcpLink = TransportLink<OwnedReadHalf, OwnedWriteHalf>;

impl TcpLink {
    pub async fn connect(address: &str) -> MonkeyResult<Self> {
        let stream = TcpStream::connect(address).await.map_err(|e| {
            MonkeyError::Connection(format!("cannot connect to controller at {address}: {e}"))
        })?;
        tracing::info!(%address, "connected to controller");
        Self::from_tcp(stream)
    }

    pub fn from_tcp(stream: TcpStream) -> MonkeyResult<Self> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer))
    }
}

impl<S: AsyncRead + AsyncWrite> TransportLink<ReadHalf<S>, WriteHalf<S>> {
    pub fn from_stream(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }
}

impl<R, W> TransportLink<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: LinkReader { inner: reader },
            writer: LinkWriter {
                inner: BufWriter::new(writer),
            },
        }
    }

    pub fn into_split(self) -> (LinkReader<R>, LinkWriter<W>) {
        (self.reader, self.writer)
    }

    pub async fn read_available(&mut self, buf: &mut [u8]) -> MonkeyResult<usize> {
        self.reader.read_available(buf).await
    }

    pub async fn send_packet(&mut self, packet: &Packet) -> MonkeyResult<()> {
        self.writer.send_packet(packet).await
    }

    pub async fn flush(&mut self) -> MonkeyResult<()> {
        self.writer.flush().await
    }
}
