//! Minimal SOCKS5 client (RFC 1928): no-auth greeting and CONNECT by
//! domain name, which is all Tor needs for `.onion` targets.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::TransportError;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS error",
    }
}

/// Connects to `host:port` through the SOCKS5 proxy at `proxy`.
pub(crate) async fn connect(
    proxy: &str,
    host: &str,
    port: u16,
) -> Result<TcpStream, TransportError> {
    let target = format!("{}:{}", host, port);
    let mut stream = TcpStream::connect(proxy)
        .await
        .map_err(|e| TransportError::connection(&target, format!("socks proxy {}: {}", proxy, e)))?;

    stream.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [VERSION, METHOD_NO_AUTH] {
        return Err(TransportError::Protocol(format!(
            "socks proxy rejected no-auth greeting: {:02x?}",
            choice
        )));
    }

    let host_len = u8::try_from(host.len())
        .map_err(|_| TransportError::connection(&target, "hostname too long for socks"))?;
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host_len]);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(TransportError::Protocol(format!(
            "unexpected socks reply version {}",
            head[0]
        )));
    }
    if head[1] != 0x00 {
        return Err(TransportError::connection(&target, reply_message(head[1])));
    }

    // Discard the bound address.
    let skip = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0]) + 2
        }
        other => {
            return Err(TransportError::Protocol(format!(
                "unknown socks address type {}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A one-shot SOCKS5 proxy that answers CONNECT with `reply_code`,
    /// records the requested target, and then echoes bytes back.
    async fn fake_proxy(reply_code: u8) -> (String, tokio::task::JoinHandle<(String, u16)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            s.read_exact(&mut greeting).await.unwrap();
            s.write_all(&[5, 0]).await.unwrap();

            let mut head = [0u8; 5];
            s.read_exact(&mut head).await.unwrap();
            let mut host = vec![0u8; head[4] as usize];
            s.read_exact(&mut host).await.unwrap();
            let mut port = [0u8; 2];
            s.read_exact(&mut port).await.unwrap();

            s.write_all(&[5, reply_code, 0, 1, 127, 0, 0, 1, 0, 0])
                .await
                .unwrap();
            if reply_code == 0 {
                let mut buf = [0u8; 4];
                s.read_exact(&mut buf).await.unwrap();
                s.write_all(&buf).await.unwrap();
            }
            (String::from_utf8(host).unwrap(), u16::from_be_bytes(port))
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn connect_by_domain_name() {
        let (proxy, handle) = fake_proxy(0).await;
        let mut stream = connect(&proxy, "abcdefgh.onion", 9999).await.unwrap();

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let (host, port) = handle.await.unwrap();
        assert_eq!(host, "abcdefgh.onion");
        assert_eq!(port, 9999);
    }

    #[tokio::test]
    async fn proxy_failure_code_is_reported() {
        let (proxy, _handle) = fake_proxy(0x04).await;
        let err = connect(&proxy, "gone.onion", 80).await.unwrap_err();
        match err {
            TransportError::Connection { reason, .. } => assert_eq!(reason, "host unreachable"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_proxy_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = connect(&addr, "x.onion", 1).await.unwrap_err();
        assert!(matches!(err, TransportError::Connection { .. }));
    }
}
