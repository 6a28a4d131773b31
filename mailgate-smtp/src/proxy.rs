//! PROXY protocol v1 (text form) preamble.

use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    error::{ConnectionError, ConnectionResult},
    transport::Transport,
};

/// Longest legal v1 header, terminator included.
const MAX_HEADER: usize = 107;

/// The original client identity as reported by the load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyInfo {
    pub remote_address: String,
    pub remote_port: u16,
}

/// Consume the PROXY line that a fronting balancer prepends to the stream.
///
/// Returns `Ok(None)` for `PROXY UNKNOWN`, where the session keeps the
/// socket's own peer address. Anything that is not a well-formed v1 header
/// is an error; nothing sensible can follow it.
pub async fn read_proxy_header<Stream>(
    transport: &mut Transport<Stream>,
) -> ConnectionResult<Option<ProxyInfo>>
where
    Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    let mut header = Vec::with_capacity(MAX_HEADER);
    let mut byte = [0u8; 1];

    // One byte at a time: the preamble has no length prefix and anything
    // past the newline belongs to SMTP.
    loop {
        if transport.receive(&mut byte).await? == 0 {
            return Err(ConnectionError::Closed);
        }

        header.push(byte[0]);

        if byte[0] == b'\n' {
            break;
        }

        if header.len() >= MAX_HEADER {
            return Err(malformed("header too long"));
        }
    }

    let line = String::from_utf8_lossy(&header);
    let line = line.trim_end_matches(['\r', '\n']);

    let mut words = line.split(' ');

    if words.next() != Some("PROXY") {
        return Err(malformed("missing PROXY keyword"));
    }

    match words.next() {
        Some("UNKNOWN") => return Ok(None),
        Some("TCP4" | "TCP6") => {}
        _ => return Err(malformed("unsupported protocol family")),
    }

    let (Some(source), Some(_dest), Some(source_port), Some(_dest_port)) =
        (words.next(), words.next(), words.next(), words.next())
    else {
        return Err(malformed("truncated header"));
    };

    let Ok(address) = source.parse::<IpAddr>() else {
        return Err(malformed("invalid source address"));
    };

    let Ok(port) = source_port.parse::<u16>() else {
        return Err(malformed("invalid source port"));
    };

    Ok(Some(ProxyInfo {
        remote_address: address.to_string(),
        remote_port: port,
    }))
}

fn malformed(reason: &str) -> ConnectionError {
    ConnectionError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("malformed PROXY header: {reason}"),
    ))
}
