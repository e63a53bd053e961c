use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

use web_time::Duration;

use crate::error::NetplayError;

/// A datagram larger than this may be fragmented. Every packet this crate
/// sends is far below it.
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

/// The outcome of one blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// `len` bytes arrived from `from`.
    Datagram {
        /// Bytes written into the caller's buffer.
        len: usize,
        /// Sender address.
        from: SocketAddr,
    },
    /// The read timeout elapsed with nothing to read.
    TimedOut,
}

/// A blocking UDP socket bound to `0.0.0.0:port`.
///
/// Every method takes `&self`, so the socket can be shared through an
/// `Arc` between the session thread, which sends, and the listener thread,
/// which receives. Receives block for at most the configured read timeout.
#[derive(Debug)]
pub struct PeerSocket {
    socket: UdpSocket,
    port: u16,
}

impl PeerSocket {
    /// Binds `0.0.0.0:port`. Port 0 picks an ephemeral port.
    ///
    /// # Errors
    ///
    /// [`NetplayError::Bind`] if the OS refuses the bind.
    pub fn bind(port: u16) -> Result<Self, NetplayError> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr).map_err(|err| NetplayError::Bind {
            port,
            context: err.to_string(),
        })?;
        Ok(Self { socket, port })
    }

    /// Caps how long [`recv_from`](Self::recv_from) blocks.
    ///
    /// # Errors
    ///
    /// [`NetplayError::Socket`] if the timeout is zero or the OS rejects it.
    pub fn set_read_timeout(&self, timeout: Duration) -> Result<(), NetplayError> {
        self.socket
            .set_read_timeout(Some(timeout))
            .map_err(|err| NetplayError::Socket {
                context: format!("set_read_timeout({timeout:?}): {err}"),
            })
    }

    /// Sends one datagram.
    ///
    /// # Errors
    ///
    /// [`NetplayError::Socket`] if the OS send fails. UDP delivery itself is
    /// never confirmed.
    pub fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> Result<(), NetplayError> {
        debug_assert!(bytes.len() <= IDEAL_MAX_UDP_PACKET_SIZE);
        self.socket
            .send_to(bytes, addr)
            .map(|_| ())
            .map_err(|err| NetplayError::Socket {
                context: format!("send to {addr}: {err}"),
            })
    }

    /// Blocks until a datagram arrives or the read timeout elapses.
    ///
    /// Bytes beyond `buffer.len()` are discarded by the OS.
    ///
    /// # Errors
    ///
    /// [`NetplayError::Socket`] for any failure other than a timeout.
    pub fn recv_from(&self, buffer: &mut [u8]) -> Result<Received, NetplayError> {
        match self.socket.recv_from(buffer) {
            Ok((len, from)) => Ok(Received::Datagram { len, from }),
            Err(ref err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(Received::TimedOut)
            },
            // ICMP port unreachable from an earlier send shows up here on some platforms
            Err(ref err) if err.kind() == ErrorKind::ConnectionReset => Ok(Received::TimedOut),
            Err(err) => Err(NetplayError::Socket {
                context: format!("recv: {err}"),
            }),
        }
    }

    /// The bound address; reports the real port when bound to port 0.
    ///
    /// # Errors
    ///
    /// [`NetplayError::Socket`] if the OS cannot report it.
    pub fn local_addr(&self) -> Result<SocketAddr, NetplayError> {
        self.socket.local_addr().map_err(|err| NetplayError::Socket {
            context: format!("local_addr: {err}"),
        })
    }

    /// The port passed to [`bind`](Self::bind).
    #[must_use]
    pub const fn requested_port(&self) -> u16 {
        self.port
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn loopback(socket: &PeerSocket) -> SocketAddr {
        let port = socket.local_addr().unwrap().port();
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn ephemeral_bind_reports_real_port() {
        let socket = PeerSocket::bind(0).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
        assert_eq!(socket.requested_port(), 0);
    }

    #[test]
    fn datagram_roundtrip_on_loopback() {
        let a = PeerSocket::bind(0).unwrap();
        let b = PeerSocket::bind(0).unwrap();
        b.set_read_timeout(Duration::from_secs(2)).unwrap();
        a.send_to(b"hello", loopback(&b)).unwrap();

        let mut buf = [0u8; 16];
        match b.recv_from(&mut buf).unwrap() {
            Received::Datagram { len, from } => {
                assert_eq!(&buf[..len], b"hello");
                assert_eq!(from.port(), a.local_addr().unwrap().port());
            },
            Received::TimedOut => panic!("expected a datagram"),
        }
    }

    #[test]
    fn silence_reports_timeout() {
        let socket = PeerSocket::bind(0).unwrap();
        socket.set_read_timeout(Duration::from_millis(20)).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(socket.recv_from(&mut buf).unwrap(), Received::TimedOut);
    }

    #[test]
    fn binding_a_taken_port_fails() {
        let first = PeerSocket::bind(0).unwrap();
        let port = first.local_addr().unwrap().port();
        let err = PeerSocket::bind(port).unwrap_err();
        assert!(matches!(err, NetplayError::Bind { port: p, .. } if p == port));
    }
}
