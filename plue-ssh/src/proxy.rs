//! PROXY protocol v2 header parsing.
//!
//! Load balancers may prepend a binary header declaring the original client
//! address. The header is honored only when the directly connected peer is
//! on the trusted-source list; otherwise the declared address is ignored
//! and the peer address stands.
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

/// The 12-byte v2 signature.
pub const SIGNATURE: [u8; 12] = *b"\r\n\r\n\0\r\nQUIT\n";

const VERSION_LOCAL: u8 = 0x20;
const VERSION_PROXY: u8 = 0x21;
const FAMILY_UNSPEC: u8 = 0x00;
const FAMILY_TCP4: u8 = 0x11;
const FAMILY_TCP6: u8 = 0x21;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("bad PROXY signature")]
    BadSignature,
    #[error("unsupported PROXY version/command {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("unsupported PROXY address family {0:#04x}")]
    UnsupportedFamily(u8),
    #[error("truncated PROXY header")]
    Truncated,
    #[error("i/o reading PROXY header: {0}")]
    Io(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(err.to_string())
        }
    }
}

/// A parsed header. `source` is `None` for LOCAL commands (health checks),
/// which carry no address override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
}

/// Read and parse one v2 header off the front of `stream`.
pub fn read_header(stream: &mut impl Read) -> Result<Header, Error> {
    let mut signature = [0u8; 12];
    stream.read_exact(&mut signature)?;
    if signature != SIGNATURE {
        return Err(Error::BadSignature);
    }

    let mut head = [0u8; 4];
    stream.read_exact(&mut head)?;
    let ver_cmd = head[0];
    let family = head[1];
    let len = u16::from_be_bytes([head[2], head[3]]) as usize;

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;

    match ver_cmd {
        VERSION_LOCAL => {
            return Ok(Header {
                source: None,
                destination: None,
            })
        }
        VERSION_PROXY => {}
        other => return Err(Error::UnsupportedVersion(other)),
    }

    match family {
        FAMILY_UNSPEC => Ok(Header {
            source: None,
            destination: None,
        }),
        FAMILY_TCP4 => {
            if body.len() < 12 {
                return Err(Error::Truncated);
            }
            let src = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let dst = Ipv4Addr::new(body[4], body[5], body[6], body[7]);
            let src_port = u16::from_be_bytes([body[8], body[9]]);
            let dst_port = u16::from_be_bytes([body[10], body[11]]);
            Ok(Header {
                source: Some(SocketAddr::new(IpAddr::V4(src), src_port)),
                destination: Some(SocketAddr::new(IpAddr::V4(dst), dst_port)),
            })
        }
        FAMILY_TCP6 => {
            if body.len() < 36 {
                return Err(Error::Truncated);
            }
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&body[..16]);
            dst.copy_from_slice(&body[16..32]);
            let src_port = u16::from_be_bytes([body[32], body[33]]);
            let dst_port = u16::from_be_bytes([body[34], body[35]]);
            Ok(Header {
                source: Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), src_port)),
                destination: Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dst_port)),
            })
        }
        other => Err(Error::UnsupportedFamily(other)),
    }
}

/// PROXY section of the front-end configuration.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub enabled: bool,
    /// Peers allowed to speak the protocol at all.
    pub trusted: Vec<IpAddr>,
}

impl ProxyConfig {
    pub fn is_trusted(&self, peer: IpAddr) -> bool {
        self.enabled && self.trusted.contains(&peer)
    }
}

/// The address rate limiting and logging should attribute the session to.
pub fn effective_addr(
    config: &ProxyConfig,
    peer: SocketAddr,
    declared: Option<SocketAddr>,
) -> SocketAddr {
    match declared {
        Some(source) if config.is_trusted(peer.ip()) => source,
        Some(source) => {
            log::warn!(
                target: "ssh",
                "Ignoring PROXY source {source} declared by untrusted peer {peer}"
            );
            peer
        }
        None => peer,
    }
}
