//! UDP socket plumbing for the relay
//!
//! Two sockets per session: an unbound sender the audio callback writes
//! through, and a bound receiver with a large OS buffer and a short read
//! timeout so the receiver task can observe shutdown.

pub mod receiver;

use std::net::{Ipv4Addr, UdpSocket};
use std::time::Duration;

use tracing::warn;

use crate::constants::{RECV_SOCKET_BUFFER_BYTES, RECV_TIMEOUT_MS};
use crate::error::NetworkError;

/// Socket the relay core sends outbound packets through.
pub fn bind_send_socket() -> Result<UdpSocket, NetworkError> {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .map_err(|e| NetworkError::BindFailed(format!("send socket: {e}")))
}

/// Socket reply packets arrive on, tuned for bursty peers.
pub fn bind_recv_socket(port: u16) -> Result<UdpSocket, NetworkError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
        .map_err(|e| NetworkError::BindFailed(format!("receive socket on port {port}: {e}")))?;

    socket
        .set_read_timeout(Some(Duration::from_millis(RECV_TIMEOUT_MS)))
        .map_err(|e| NetworkError::SocketConfig(format!("read timeout: {e}")))?;

    enlarge_recv_buffer(&socket, RECV_SOCKET_BUFFER_BYTES);

    Ok(socket)
}

/// Grow the OS receive buffer. Best effort: the relay still works with the
/// default size, it just absorbs smaller peer bursts.
fn enlarge_recv_buffer(socket: &UdpSocket, bytes: usize) {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;

        let value = bytes as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &value as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            warn!(bytes, "failed to enlarge socket receive buffer");
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (socket, bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_socket_gets_an_ephemeral_port() {
        let socket = bind_send_socket().unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn recv_socket_has_a_read_timeout() {
        let socket = bind_recv_socket(0).unwrap();
        let timeout = socket.read_timeout().unwrap().unwrap();
        assert_eq!(timeout, Duration::from_millis(RECV_TIMEOUT_MS));
    }
}
