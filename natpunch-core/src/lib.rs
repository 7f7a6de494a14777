//! # natpunch-core - TCP hole punching engine
//!
//! `natpunch-core` establishes direct TCP connections between peers that may
//! both sit behind NATs. It is the engine under the `natpunch` crate, which
//! adds the relay and mediator services.
//!
//! ## Architecture
//!
//! - [`punch`] - [`HolePuncher`](punch::HolePuncher) races connectors and
//!   listeners against a peer's private and public endpoints
//! - [`listener`] - the restartable accept loop shared by a race, routing
//!   inbound connections by remote endpoint
//! - [`auth`] - pluggable checks a connection must pass before it wins
//! - [`rendezvous`] - token-keyed handoff of connections to waiters
//! - [`cancel`] and [`mailbox`] - the cancellation and handoff primitives
//!   the above are built from
//! - [`message`] and [`connection`] - STUN-style framing on TCP streams
//!
//! ## Hole Punching
//!
//! Both peers learn each other's endpoints out of band (see the mediator in
//! `natpunch`) and call `establish_connection` at about the same time:
//!
//! ```rust,no_run
//! use natpunch_core::auth::SharedSecretAuthenticator;
//! use natpunch_core::listener::ConnectionListener;
//! use natpunch_core::punch::{HolePuncher, PunchConfig, PunchOutcome};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> natpunch_core::error::Result<()> {
//! let listener = Arc::new(ConnectionListener::new("0.0.0.0:9000".parse().unwrap()));
//! let puncher = HolePuncher::new(listener, PunchConfig::default());
//! let private = "192.168.1.20:9000".parse().unwrap();
//! let public = "203.0.113.9:40123".parse().unwrap();
//! let auth = Arc::new(SharedSecretAuthenticator::new("shared secret"));
//! match puncher.establish_connection(private, public, auth).await? {
//!     PunchOutcome::Established { connection, .. } => {
//!         println!("connected to {}", connection.peer_endpoint());
//!     }
//!     PunchOutcome::TimedOut => println!("no direct path, fall back to a relay"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod cancel;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod mailbox;
pub mod message;
pub mod punch;
pub mod rendezvous;
pub mod socket;
