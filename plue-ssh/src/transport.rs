//! Thin adapter over the external SSH transport library.
//!
//! The library performs the cryptographic handshake, channel multiplexing
//! and wire framing; this module defines the narrow surface the front-end
//! consumes: accepted connections, offered credentials, exec requests and
//! a byte channel. Algorithm preferences are handed to the adapter verbatim
//! through [`TransportConfig`].
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Transport algorithm allow-lists and the host key location. Passed to the
/// underlying library at bind time.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Ed25519 host key, stored with mode 0600.
    pub host_key: PathBuf,
    pub ciphers: Vec<String>,
    pub kex: Vec<String>,
    pub macs: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host_key: PathBuf::from("host_ed25519"),
            ciphers: vec![
                "chacha20-poly1305@openssh.com".to_owned(),
                "aes256-gcm@openssh.com".to_owned(),
                "aes128-gcm@openssh.com".to_owned(),
            ],
            kex: vec![
                "curve25519-sha256".to_owned(),
                "curve25519-sha256@libssh.org".to_owned(),
            ],
            macs: vec![
                "umac-128-etm@openssh.com".to_owned(),
                "hmac-sha2-256-etm@openssh.com".to_owned(),
            ],
        }
    }
}

/// A credential offered during authentication.
#[derive(Debug, Clone)]
pub enum Credentials {
    PublicKey(ssh_key::PublicKey),
    Certificate(Box<ssh_key::Certificate>),
}

/// One authentication attempt from the client.
#[derive(Debug, Clone)]
pub struct AuthAttempt {
    pub username: String,
    pub credentials: Credentials,
}

/// An exec request with the channel it arrived on.
pub struct Exec<C> {
    pub command: String,
    pub channel: C,
}

/// Write half of a session channel: data, extended (stderr) data, exit
/// status and close.
pub trait ChannelWriter: Send {
    fn write_data(&mut self, data: &[u8]) -> io::Result<()>;
    fn write_stderr(&mut self, data: &[u8]) -> io::Result<()>;
    fn exit_status(&mut self, code: i32) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
}

/// A session channel, split into an owned reader and writer so the two
/// directions can be driven from different threads.
pub trait Channel: Send + 'static {
    type Reader: io::Read + Send + 'static;
    type Writer: ChannelWriter + 'static;

    fn split(self) -> (Self::Reader, Self::Writer);
}

/// One inbound connection, after the transport handshake.
pub trait Connection: Send + 'static {
    type Channel: Channel;

    /// Address of the directly connected peer.
    fn peer_addr(&self) -> SocketAddr;

    /// Source declared by a PROXY header the adapter consumed, if any.
    /// Trust gating happens above, not in the adapter.
    fn proxied_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Next authentication attempt; `None` when the client gave up or the
    /// transport closed.
    fn next_auth(&mut self) -> io::Result<Option<AuthAttempt>>;

    /// Answer the most recent attempt. The message is only shown on
    /// rejection.
    fn respond_auth(&mut self, accepted: bool, message: &str) -> io::Result<()>;

    /// The session's exec request; `None` if the client closed without one.
    /// Only `exec` is served: shell, pty and subsystem requests are denied
    /// by the adapter.
    fn next_exec(&mut self) -> io::Result<Option<Exec<Self::Channel>>>;

    /// A handle that forces the connection closed from another thread,
    /// used to cut stragglers at shutdown.
    fn closer(&self) -> Box<dyn FnOnce() + Send>;
}

/// Accept side of the adapter.
pub trait Listener: Send {
    type Conn: Connection;

    /// Block until the next connection finishes its transport handshake.
    /// `WouldBlock` is returned periodically so the serve loop can observe
    /// shutdown.
    fn accept(&mut self) -> io::Result<Self::Conn>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}
