//! Byte-level I/O handles behind a connection.
//!
//! A connection only needs "read one block" and "write one block"; streams
//! and datagram sockets are adapted to that shape here.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;

/// Largest UDP payload.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Read side of a connection.
pub trait BlockReader: Send {
    /// Append received bytes to `buf`. `Ok(0)` means end of stream.
    fn read_block<'a>(&'a mut self, buf: &'a mut BytesMut) -> BoxFuture<'a, io::Result<usize>>;
}

/// Write side of a connection.
pub trait BlockWriter: Send {
    /// Write the whole of `data`.
    fn write_block<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>>;

    fn shutdown(&mut self) -> BoxFuture<'_, io::Result<()>>;
}

/// Any `AsyncRead` as a block reader.
pub struct StreamReader<R>(pub R);

impl<R: AsyncRead + Unpin + Send> BlockReader for StreamReader<R> {
    fn read_block<'a>(&'a mut self, buf: &'a mut BytesMut) -> BoxFuture<'a, io::Result<usize>> {
        self.0.read_buf(buf).boxed()
    }
}

/// Any `AsyncWrite` as a block writer.
pub struct StreamWriter<W>(pub W);

impl<W: AsyncWrite + Unpin + Send> BlockWriter for StreamWriter<W> {
    fn write_block<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        self.0.write_all(data).boxed()
    }

    fn shutdown(&mut self) -> BoxFuture<'_, io::Result<()>> {
        self.0.shutdown().boxed()
    }
}

/// Datagrams delivered by an acceptor that demultiplexes one socket.
pub struct ChannelReader {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelReader {
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }
}

impl BlockReader for ChannelReader {
    fn read_block<'a>(&'a mut self, buf: &'a mut BytesMut) -> BoxFuture<'a, io::Result<usize>> {
        async move {
            match self.rx.recv().await {
                Some(payload) => {
                    buf.extend_from_slice(&payload);
                    Ok(payload.len())
                }
                None => Ok(0),
            }
        }
        .boxed()
    }
}

/// Reader over a connected UDP socket.
pub struct DatagramReader {
    socket: Arc<UdpSocket>,
    scratch: Vec<u8>,
}

impl DatagramReader {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            scratch: vec![0; MAX_DATAGRAM_SIZE],
        }
    }
}

impl BlockReader for DatagramReader {
    fn read_block<'a>(&'a mut self, buf: &'a mut BytesMut) -> BoxFuture<'a, io::Result<usize>> {
        async move {
            loop {
                let n = self.socket.recv(&mut self.scratch).await?;
                // An empty datagram is not the end of the "stream".
                if n > 0 {
                    buf.extend_from_slice(&self.scratch[..n]);
                    return Ok(n);
                }
            }
        }
        .boxed()
    }
}

/// Writer sending datagrams, to the connected peer or to a fixed address.
pub struct DatagramWriter {
    socket: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
}

impl DatagramWriter {
    pub fn connected(socket: Arc<UdpSocket>) -> Self {
        Self { socket, peer: None }
    }

    pub fn to_peer(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer: Some(peer),
        }
    }
}

impl BlockWriter for DatagramWriter {
    fn write_block<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        async move {
            let sent = match self.peer {
                Some(peer) => self.socket.send_to(data, peer).await?,
                None => self.socket.send(data).await?,
            };
            if sent != data.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("datagram truncated: {sent} of {} bytes sent", data.len()),
                ));
            }
            Ok(())
        }
        .boxed()
    }

    fn shutdown(&mut self) -> BoxFuture<'_, io::Result<()>> {
        async { Ok(()) }.boxed()
    }
}

/// Everything a connection needs to talk to its peer.
pub struct ConnectionIo {
    pub reader: Box<dyn BlockReader>,
    pub writer: Box<dyn BlockWriter>,
}

impl ConnectionIo {
    pub fn new(reader: Box<dyn BlockReader>, writer: Box<dyn BlockWriter>) -> Self {
        Self { reader, writer }
    }

    pub fn tcp(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        Self::new(
            Box::new(StreamReader(read)),
            Box::new(StreamWriter(write)),
        )
    }

    pub fn udp_connected(socket: Arc<UdpSocket>) -> Self {
        Self::new(
            Box::new(DatagramReader::new(Arc::clone(&socket))),
            Box::new(DatagramWriter::connected(socket)),
        )
    }

    pub fn udp_demultiplexed(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        rx: mpsc::Receiver<Bytes>,
    ) -> Self {
        Self::new(
            Box::new(ChannelReader::new(rx)),
            Box::new(DatagramWriter::to_peer(socket, peer)),
        )
    }
}

/// Conditions that end a connection quietly.
pub fn is_benign(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_kinds() {
        assert!(is_benign(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_benign(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_benign(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn channel_reader_ends_when_sender_drops() {
        let (tx, rx) = mpsc::channel(4);
        let mut reader = ChannelReader::new(rx);
        tx.send(Bytes::from_static(b"ping")).await.unwrap();
        drop(tx);
        let mut buf = BytesMut::with_capacity(16);
        assert_eq!(reader.read_block(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf[..], b"ping");
        assert_eq!(reader.read_block(&mut buf).await.unwrap(), 0);
    }
}
