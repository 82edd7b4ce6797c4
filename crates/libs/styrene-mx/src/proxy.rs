//! Outbound tunnelling through an HTTP `CONNECT` proxy.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{ConnectionState, MxError};

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Opens a tunnel to `host:port` through `proxy` (`host:port`).
pub async fn connect_via_proxy(proxy: &str, host: &str, port: u16) -> Result<TcpStream, MxError> {
    let mut stream = TcpStream::connect(proxy)
        .await
        .map_err(|err| MxError::from_io(err, ConnectionState::Connecting))?;

    let authority = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    let request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", authority);
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|err| MxError::from_io(err, ConnectionState::Connecting))?;

    let head = read_response_head(&mut stream).await?;
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if !status_line.starts_with("HTTP/1.") || status != "200" {
        return Err(MxError::transport(
            format!("proxy {} refused tunnel to {}: {}", proxy, authority, status_line.trim()),
            ConnectionState::Connecting,
        ));
    }
    log::debug!("mx_client: tunnel to {} open via {}", authority, proxy);
    Ok(stream)
}

// Byte at a time so nothing past the header is consumed.
async fn read_response_head(stream: &mut TcpStream) -> Result<String, MxError> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(MxError::transport(
                "proxy response header too large",
                ConnectionState::Connecting,
            ));
        }
        let read = stream
            .read(&mut byte)
            .await
            .map_err(|err| MxError::from_io(err, ConnectionState::Connecting))?;
        if read == 0 {
            return Err(MxError::transport(
                "proxy closed the connection during CONNECT",
                ConnectionState::Connecting,
            ));
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;

    async fn fake_proxy(reply: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let task = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let mut reader = BufReader::new(socket);
            let mut request_line = String::new();
            reader.read_line(&mut request_line).await.expect("request line");
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.expect("header");
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let mut socket = reader.into_inner();
            socket.write_all(reply.as_bytes()).await.expect("reply");
            let mut ping = [0_u8; 4];
            if socket.read_exact(&mut ping).await.is_ok() {
                socket.write_all(&ping).await.expect("echo");
            }
            request_line
        });
        (addr, task)
    }

    #[tokio::test]
    async fn tunnels_after_a_200_reply() {
        let (proxy, task) = fake_proxy("HTTP/1.1 200 Connection established\r\n\r\n").await;
        let mut stream = connect_via_proxy(&proxy, "10.1.2.3", 10933).await.expect("tunnel");
        stream.write_all(b"ping").await.expect("write");
        let mut echoed = [0_u8; 4];
        stream.read_exact(&mut echoed).await.expect("read");
        assert_eq!(&echoed, b"ping");
        assert_eq!(task.await.expect("proxy"), "CONNECT 10.1.2.3:10933 HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn refused_tunnel_is_a_connecting_failure() {
        let (proxy, _task) =
            fake_proxy("HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await;
        let err = connect_via_proxy(&proxy, "::1", 10933).await.expect_err("refused");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("407"));
    }
}
