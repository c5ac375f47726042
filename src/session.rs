//! Protocol collaborator contract
//!
//! The broker never reads or writes protocol frames itself. A transport hands
//! each accepted connection to the router as a [`Session`].

use crate::error::{RejectReason, SessionError};
use async_trait::async_trait;

#[async_trait]
pub trait Session: Send {
    /// Complete whatever setup the protocol needs before a redirect can be sent.
    async fn complete_handshake(&mut self) -> Result<(), SessionError>;

    /// Address the client used to connect, possibly including a port.
    fn requested_address(&self) -> &str;

    /// Tell the client to reconnect to `host:port`. One-shot.
    async fn send_redirect(&mut self, host: &str, port: u16) -> Result<(), SessionError>;

    /// Turn the client away with a user-visible reason.
    async fn reject(&mut self, reason: RejectReason) -> Result<(), SessionError>;
}
