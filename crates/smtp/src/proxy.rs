//! [PROXY protocol](https://www.haproxy.org/download/1.8/doc/proxy-protocol.txt)
//! preamble decoding.
//!
//! When enabled, the preamble is read before the greeting; the decoded
//! addresses are stored on the session for hooks to inspect.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::debug;

/// v2 preamble signature.
const V2_SIGNATURE: &[u8; 12] = b"\r\n\r\n\x00\r\nQUIT\n";

/// Maximum length of a v1 preamble line, CRLF included.
const V1_LIMIT: usize = 107;

/// Addresses carried by a PROXY preamble. Absent for `UNKNOWN` (v1) and
/// `LOCAL`/unspecified (v2) connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyInfo {
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed PROXY preamble")]
    Malformed,
}

/// Read and decode one v1 or v2 preamble from the start of the stream.
pub async fn read_preamble<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<ProxyInfo, ProxyError> {
    // both versions are distinguishable from their first octet
    let first = loop {
        let buf = reader.fill_buf().await?;
        match buf.first() {
            Some(&b) => break b,
            None => return Err(ProxyError::Malformed),
        }
    };

    match first {
        b'\r' => v2(reader).await,
        b'P' => v1(reader).await,
        _ => Err(ProxyError::Malformed),
    }
}

async fn v1<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<ProxyInfo, ProxyError> {
    let mut line = Vec::new();
    line::read_line(reader, V1_LIMIT, &mut line)
        .await
        .map_err(|_| ProxyError::Malformed)?;
    let line = std::str::from_utf8(&line).map_err(|_| ProxyError::Malformed)?;
    debug!(?line, "proxy v1 preamble");

    let mut fields = line.split_ascii_whitespace();
    if fields.next() != Some("PROXY") {
        return Err(ProxyError::Malformed);
    }

    match fields.next() {
        Some("TCP4" | "TCP6") => {}
        Some("UNKNOWN") => {
            return Ok(ProxyInfo {
                source: None,
                destination: None,
            })
        }
        _ => return Err(ProxyError::Malformed),
    }

    let mut addr = || -> Result<IpAddr, ProxyError> {
        fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(ProxyError::Malformed)
    };
    let (src, dst) = (addr()?, addr()?);

    let mut port = || -> Result<u16, ProxyError> {
        fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(ProxyError::Malformed)
    };
    let (sport, dport) = (port()?, port()?);

    Ok(ProxyInfo {
        source: Some(SocketAddr::new(src, sport)),
        destination: Some(SocketAddr::new(dst, dport)),
    })
}

async fn v2<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<ProxyInfo, ProxyError> {
    let mut header = [0u8; 16];
    reader.read_exact(&mut header).await?;

    if &header[..12] != V2_SIGNATURE || header[12] & 0xf0 != 0x20 {
        return Err(ProxyError::Malformed);
    }

    let command = header[12] & 0x0f;
    let family = header[13];
    let len = usize::from(u16::from_be_bytes([header[14], header[15]]));

    let mut addresses = vec![0u8; len];
    reader.read_exact(&mut addresses).await?;
    debug!(command, family, len, "proxy v2 preamble");

    // LOCAL commands and unspecified families carry no usable addresses
    if command != 0x01 {
        return Ok(ProxyInfo {
            source: None,
            destination: None,
        });
    }

    match family {
        // TCP or UDP over IPv4
        0x11 | 0x12 if len >= 12 => {
            let src = Ipv4Addr::new(addresses[0], addresses[1], addresses[2], addresses[3]);
            let dst = Ipv4Addr::new(addresses[4], addresses[5], addresses[6], addresses[7]);
            let sport = u16::from_be_bytes([addresses[8], addresses[9]]);
            let dport = u16::from_be_bytes([addresses[10], addresses[11]]);
            Ok(ProxyInfo {
                source: Some(SocketAddr::new(IpAddr::V4(src), sport)),
                destination: Some(SocketAddr::new(IpAddr::V4(dst), dport)),
            })
        }
        // TCP or UDP over IPv6
        0x21 | 0x22 if len >= 36 => {
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&addresses[..16]);
            dst.copy_from_slice(&addresses[16..32]);
            let sport = u16::from_be_bytes([addresses[32], addresses[33]]);
            let dport = u16::from_be_bytes([addresses[34], addresses[35]]);
            Ok(ProxyInfo {
                source: Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), sport)),
                destination: Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dport)),
            })
        }
        0x00 | 0x31 | 0x32 => Ok(ProxyInfo {
            source: None,
            destination: None,
        }),
        _ => Err(ProxyError::Malformed),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, BufReader};

    use super::{read_preamble, ProxyInfo};

    async fn decode(wire: &[u8]) -> Result<ProxyInfo, super::ProxyError> {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut server = BufReader::new(server);

        client.write_all(wire).await.unwrap();
        client.shutdown().await.unwrap();

        read_preamble(&mut server).await
    }

    #[tokio::test]
    async fn v1_tcp4() {
        let info = decode(b"PROXY TCP4 192.0.2.1 198.51.100.2 51000 25\r\n")
            .await
            .unwrap();
        assert_eq!(info.source.unwrap().to_string(), "192.0.2.1:51000");
        assert_eq!(info.destination.unwrap().to_string(), "198.51.100.2:25");
    }

    #[tokio::test]
    async fn v1_unknown() {
        let info = decode(b"PROXY UNKNOWN\r\n").await.unwrap();
        assert_eq!(info.source, None);
        assert_eq!(info.destination, None);
    }

    #[tokio::test]
    async fn v2_tcp4() {
        let mut wire = b"\r\n\r\n\x00\r\nQUIT\n".to_vec();
        wire.push(0x21); // version 2, PROXY
        wire.push(0x11); // TCP over IPv4
        wire.extend_from_slice(&12u16.to_be_bytes());
        wire.extend_from_slice(&[192, 0, 2, 1]);
        wire.extend_from_slice(&[198, 51, 100, 2]);
        wire.extend_from_slice(&51000u16.to_be_bytes());
        wire.extend_from_slice(&25u16.to_be_bytes());

        let info = decode(&wire).await.unwrap();
        assert_eq!(info.source.unwrap().to_string(), "192.0.2.1:51000");
        assert_eq!(info.destination.unwrap().to_string(), "198.51.100.2:25");
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        assert!(decode(b"EHLO example.org\r\n").await.is_err());
        assert!(decode(b"\r\n\r\n\x00\r\nQUIT\nxxxx").await.is_err());
    }
}
