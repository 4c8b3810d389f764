//! Minimal datagram transport used by the data and control planes.
//!
//! Everything above this module talks to a connected [`DatagramConn`]: send a
//! datagram, or receive one before a deadline.  The UDP implementation wraps
//! a connected `tokio::net::UdpSocket`; tests substitute their own.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::Instant;

/// A connected, unreliable datagram channel.
#[async_trait]
pub trait DatagramConn: Send + Sync {
    /// Send one datagram, returning the number of bytes written.
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Receive one datagram, failing with [`io::ErrorKind::TimedOut`] if
    /// nothing arrives before `deadline`.
    async fn recv_until(&self, buf: &mut [u8], deadline: Instant) -> io::Result<usize>;
}

#[async_trait]
impl<T: DatagramConn + ?Sized> DatagramConn for Arc<T> {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).send(buf).await
    }

    async fn recv_until(&self, buf: &mut [u8], deadline: Instant) -> io::Result<usize> {
        (**self).recv_until(buf, deadline).await
    }
}

/// UDP socket connected to a single peer.
pub struct UdpConn {
    socket: UdpSocket,
}

impl UdpConn {
    /// Bind `local` and connect to `remote`.
    pub async fn open(local: SocketAddr, remote: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local)
            .await
            .with_context(|| format!("failed to bind UDP socket on {}", local))?;
        socket
            .connect(remote)
            .await
            .with_context(|| format!("failed to connect UDP socket to {}", remote))?;
        Ok(Self { socket })
    }

    /// Wrap a socket that is already connected.
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self { socket }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }
}

#[async_trait]
impl DatagramConn for UdpConn {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf).await
    }

    async fn recv_until(&self, buf: &mut [u8], deadline: Instant) -> io::Result<usize> {
        match tokio::time::timeout_at(deadline, self.socket.recv(buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "receive deadline expired")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
