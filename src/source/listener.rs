use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::{TcpListener, UdpSocket};

/// Bind the TCP listener for server mode. A bind failure is fatal at
/// startup.
pub async fn bind_tcp(port: u16) -> io::Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port)).await
}

pub async fn bind_udp(port: u16) -> io::Result<UdpStream> {
    Ok(UdpStream(UdpSocket::bind(("0.0.0.0", port)).await?))
}

/// Adapts the UDP socket to the byte-stream interface the line reader
/// consumes: each datagram's bytes are surfaced in arrival order. A
/// datagram larger than the read buffer is cut at the buffer boundary,
/// which the reader's line-length bound already accounts for.
pub struct UdpStream(UdpSocket);

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().0.poll_recv(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn udp_datagrams_surface_as_stream_bytes() {
        let stream = bind_udp(0).await.unwrap();
        let addr = stream.0.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"hello over udp\n", addr).await.unwrap();

        let mut stream = stream;
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello over udp\n");
    }

    #[tokio::test]
    async fn tcp_bind_on_ephemeral_port_succeeds() {
        let listener = bind_tcp(0).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
