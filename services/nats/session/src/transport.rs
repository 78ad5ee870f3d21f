//! TCP transport for sessions.

use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// Connect to a server over TCP with Nagle disabled
pub async fn connect_tcp<A: ToSocketAddrs>(addr: A) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    debug!("Connected to {}", stream.peer_addr()?);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"PING\r\n").await.unwrap();
        });

        let mut stream = connect_tcp(addr).await.unwrap();
        assert!(stream.nodelay().unwrap());

        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING\r\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        assert!(connect_tcp(addr).await.is_err());
    }
}
