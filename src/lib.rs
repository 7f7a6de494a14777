//! # natpunch - NAT traversal services
//!
//! Services built on [`natpunch_core`]:
//!
//! - [`relay`] - a TCP relay that allocates a public listener per client and
//!   pipes peers through it when no direct path exists
//! - [`mediator`] - a rendezvous server where peers register their private and
//!   public endpoints, exchange them before hole punching, and ask each other
//!   for reversed connections
//!
//! A typical peer registers with a mediator, learns the other side's endpoints
//! through a connect request, runs
//! [`HolePuncher::establish_connection`](natpunch_core::punch::HolePuncher::establish_connection)
//! and falls back to a relay allocation when the race times out.

pub mod config;
pub mod error;
pub mod mediator;
pub mod relay;

pub use natpunch_core as core;

use natpunch_core::connection::MessageWriter;
use natpunch_core::message::Message;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Write half of a control connection shared between the session loop and
/// the tasks that push indications to it.
pub(crate) type SharedWriter = Arc<async_lock::Mutex<MessageWriter>>;

pub(crate) async fn send(writer: &SharedWriter, message: &Message) -> natpunch_core::error::Result<()> {
    writer.lock().await.write_message(message).await
}

pub(crate) struct OwnedJoinHandle {
    handle: JoinHandle<()>,
}

impl OwnedJoinHandle {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }
}

impl Drop for OwnedJoinHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
