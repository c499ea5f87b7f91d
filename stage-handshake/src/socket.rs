//! Async transport wrappers.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` and
//! [`FrameStream`] around `tokio::net::TcpStream`.  Both move whole frames of
//! a caller-specified size and bound every wait.  All protocol logic lives
//! elsewhere; this module owns only byte I/O.
//!
//! A wait that runs out surfaces as an [`io::Error`] of kind
//! [`io::ErrorKind::TimedOut`]; a stream that closes mid-frame surfaces as
//! [`io::ErrorKind::UnexpectedEof`].

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

fn timed_out(what: &str, wait: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{what} timed out after {wait:?}"),
    )
}

// ---------------------------------------------------------------------------
// UDP
// ---------------------------------------------------------------------------

/// A frame-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared across tasks.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing port `0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> io::Result<Self> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Send `frame` as a single datagram to `dest`.
    pub async fn send_to(&self, frame: &[u8], dest: SocketAddr) -> io::Result<()> {
        self.inner.send_to(frame, dest).await?;
        Ok(())
    }

    /// Receive the next datagram, expecting one of `expected_len` bytes.
    ///
    /// The buffer is one byte larger than `expected_len` so an oversized
    /// datagram comes back longer than expected instead of silently
    /// truncated.  Length is not checked here.
    pub async fn recv_frame(&self, expected_len: usize) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; expected_len + 1];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((buf, addr))
    }

    /// [`recv_frame`](Self::recv_frame) bounded by `wait`.
    pub async fn recv_frame_within(
        &self,
        expected_len: usize,
        wait: Duration,
    ) -> io::Result<(Vec<u8>, SocketAddr)> {
        timeout(wait, self.recv_frame(expected_len))
            .await
            .map_err(|_| timed_out("datagram receive", wait))?
    }
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// A TCP stream carrying fixed-size frames.
#[derive(Debug)]
pub struct FrameStream {
    pub peer_addr: SocketAddr,
    inner: TcpStream,
}

impl FrameStream {
    pub fn new(inner: TcpStream) -> io::Result<Self> {
        let peer_addr = inner.peer_addr()?;
        Ok(Self { peer_addr, inner })
    }

    /// Connect to `addr`, giving up after `wait`.
    pub async fn connect(addr: SocketAddr, wait: Duration) -> io::Result<Self> {
        let stream = timeout(wait, TcpStream::connect(addr))
            .await
            .map_err(|_| timed_out("connect", wait))??;
        stream.set_nodelay(true)?;
        Self::new(stream)
    }

    /// Accept one connection on `listener`, giving up after `wait`.
    pub async fn accept(listener: &TcpListener, wait: Duration) -> io::Result<Self> {
        let (stream, _) = timeout(wait, listener.accept())
            .await
            .map_err(|_| timed_out("accept", wait))??;
        stream.set_nodelay(true)?;
        Self::new(stream)
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await
    }

    /// Read exactly `len` bytes, bounded by `wait`.
    pub async fn read_frame(&mut self, len: usize, wait: Duration) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        timeout(wait, self.inner.read_exact(&mut buf))
            .await
            .map_err(|_| timed_out("stream read", wait))??;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn oversized_datagram_is_not_truncated_to_expected() {
        let a = Socket::bind(loopback()).await.unwrap();
        let b = Socket::bind(loopback()).await.unwrap();
        a.send_to(&[7u8; 32], b.local_addr).await.unwrap();
        let (frame, from) = b.recv_frame(24).await.unwrap();
        assert_eq!(frame.len(), 25);
        assert_eq!(from, a.local_addr);
    }

    #[tokio::test]
    async fn recv_within_times_out() {
        let s = Socket::bind(loopback()).await.unwrap();
        let err = s
            .recv_frame_within(24, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn stream_short_read_is_unexpected_eof() {
        let listener = TcpListener::bind(loopback()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let writer = tokio::spawn(async move {
            let mut s = FrameStream::connect(addr, Duration::from_secs(1)).await.unwrap();
            s.write_frame(&[1, 2, 3]).await.unwrap();
        });
        let mut s = FrameStream::accept(&listener, Duration::from_secs(1))
            .await
            .unwrap();
        writer.await.unwrap();
        let err = s.read_frame(8, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
