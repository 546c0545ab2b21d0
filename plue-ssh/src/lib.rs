//! SSH front-end of the Plue Git service.
//!
//! The cryptographic transport is an external collaborator reached through
//! the thin adapter traits in [`transport`]; everything above it lives here:
//! the authentication state machine, command extraction, rate limiting,
//! PROXY protocol handling, authorization and the serve loop that proxies
//! channels into the Git executor.
pub mod auth;
pub mod command;
pub mod limiter;
pub mod proxy;
pub mod server;
pub mod transport;

pub use auth::{AuthConfig, AuthInfo, Authenticator};
pub use command::SshCommand;
pub use server::{Server, SshConfig};
