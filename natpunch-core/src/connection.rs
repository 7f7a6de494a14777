use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::message::{Message, HEADER_LEN};

/// A connected TCP stream produced by the listener, a connector or a relay.
///
/// The read timeout applies to every framed read made through
/// [`read_message`](Connection::read_message); it is the deadline an
/// authenticator imposes and restores. A read cut short by the timeout, or by
/// dropping its future, keeps the bytes it got and the next read resumes the
/// same frame.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    local: Endpoint,
    peer: Endpoint,
    read_timeout: Option<Duration>,
    partial: PartialFrame,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?.into();
        let peer = stream.peer_addr()?.into();
        Ok(Self {
            stream,
            local,
            peer,
            read_timeout: None,
            partial: PartialFrame::default(),
        })
    }
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::new(TcpStream::connect(addr).await?)
    }
    #[inline]
    pub fn local_endpoint(&self) -> Endpoint {
        self.local
    }
    #[inline]
    pub fn peer_endpoint(&self) -> Endpoint {
        self.peer
    }
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }
    /// Replace the read timeout, returning the previous one.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Option<Duration> {
        std::mem::replace(&mut self.read_timeout, timeout)
    }
    pub async fn read_message(&mut self) -> Result<Message> {
        let read = self.partial.read(&mut self.stream);
        match self.read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, read)
                .await
                .map_err(|_| Error::Timeout)?,
            None => read.await,
        }
    }
    pub async fn write_message(&mut self, message: &Message) -> Result<()> {
        write_message(&mut self.stream, message).await
    }
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
    /// Bytes of an unfinished frame are discarded.
    pub fn into_stream(self) -> TcpStream {
        if self.partial.filled > 0 {
            log::debug!(
                "dropping {} bytes of a partial frame from {}",
                self.partial.filled,
                self.peer
            );
        }
        self.stream
    }
    pub fn into_split(self) -> (MessageReader, MessageWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            MessageReader {
                read_half,
                peer: self.peer,
                partial: self.partial,
            },
            MessageWriter {
                write_half,
                peer: self.peer,
            },
        )
    }
}

pub struct MessageReader {
    read_half: OwnedReadHalf,
    peer: Endpoint,
    partial: PartialFrame,
}

impl MessageReader {
    pub fn peer_endpoint(&self) -> Endpoint {
        self.peer
    }
    /// Cancel safe, as [`Connection::read_message`].
    pub async fn read_message(&mut self) -> Result<Message> {
        self.partial.read(&mut self.read_half).await
    }
}

pub struct MessageWriter {
    write_half: OwnedWriteHalf,
    peer: Endpoint,
}

impl MessageWriter {
    pub fn peer_endpoint(&self) -> Endpoint {
        self.peer
    }
    pub async fn write_message(&mut self, message: &Message) -> Result<()> {
        write_message(&mut self.write_half, message).await
    }
    pub async fn shutdown(&mut self) -> Result<()> {
        Ok(self.write_half.shutdown().await?)
    }
}

/// The frame being read and how much of it has arrived.
#[derive(Debug, Default)]
struct PartialFrame {
    buf: BytesMut,
    filled: usize,
}

impl PartialFrame {
    /// Reads no further than the end of the current frame, so the bytes that
    /// follow stay in the socket for whoever takes the stream next.
    async fn read<R: AsyncRead + Unpin>(&mut self, read: &mut R) -> Result<Message> {
        if self.buf.len() < HEADER_LEN {
            self.buf.resize(HEADER_LEN, 0);
        }
        loop {
            if self.filled == HEADER_LEN && self.buf.len() == HEADER_LEN {
                let len = Message::body_len(&self.buf)?;
                self.buf.resize(HEADER_LEN + len, 0);
            }
            if self.filled == self.buf.len() {
                break;
            }
            // `read` is cancel safe; `filled` only moves once bytes are in `buf`
            let n = read.read(&mut self.buf[self.filled..]).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            self.filled += n;
        }
        let frame = std::mem::take(&mut self.buf);
        self.filled = 0;
        Message::decode(&frame)
    }
}

pub async fn write_message<W: AsyncWrite + Unpin>(write: &mut W, message: &Message) -> Result<()> {
    write.write_all(&message.encode()?).await?;
    Ok(())
}
