//! Chat transport capability: connect a worker session, read posts, send
//! messages and copy profiles.
//!
//! Protocol framing is out of scope; production transports implement these
//! traits outside this crate.

pub mod loopback;

use std::sync::Arc;
use std::time::Duration;

use fleet_core::Worker;

pub use loopback::{LoopbackClient, LoopbackTransport};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Rate limited by the network; retry after the given wait.
    #[error("flood wait for {0:?}")]
    FloodWait(Duration),
    /// The account was banned or deactivated.
    #[error("account banned")]
    Banned,
    /// The peer is private, deleted, or the account was kicked.
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("comments are disabled")]
    CommentsDisabled,
    #[error("client disconnected")]
    Disconnected,
    #[error("transport error: {0}")]
    Other(String),
}

/// A post as seen by `fetch_recent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRecord {
    pub id: i64,
    pub text: Option<String>,
}

/// Public identity of a peer or worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileSnapshot {
    pub title: String,
    pub about: Option<String>,
}

/// A connected client bound to one worker session.
#[async_trait::async_trait]
pub trait ChatClient: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Send `text` to `peer`; when `reply_to` is set, post it as a comment
    /// under that post. Returns the new message id.
    async fn send_message(
        &self,
        peer: &str,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<i64, TransportError>;

    /// Newest first.
    async fn fetch_recent(&self, peer: &str, limit: usize) -> Result<Vec<PostRecord>, TransportError>;

    async fn fetch_profile(&self, peer: &str) -> Result<ProfileSnapshot, TransportError>;

    /// Replace the worker's own public identity.
    async fn update_profile(&self, profile: &ProfileSnapshot) -> Result<(), TransportError>;

    async fn disconnect(&self);
}

/// Opens clients from decrypted session bytes.
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync {
    async fn connect(&self, worker: &Worker, session: &[u8]) -> Result<Arc<dyn ChatClient>, TransportError>;
}
