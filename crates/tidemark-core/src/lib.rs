//! # tidemark-core - Actor runtime for Tidemark
//!
//! A small cooperative actor runtime purpose-built for the replication
//! pipeline: thousands of lightweight table actors multiplexed onto a fixed
//! worker pool.
//!
//! ## Guarantees
//!
//! - **Single consumer**: a given actor is polled by at most one worker at
//!   any time.
//! - **Per-sender FIFO**: messages from one sender arrive at an actor in
//!   send order. No ordering is promised across actors.
//! - **Fairness**: an actor yields after a bounded message batch or a
//!   wall-clock budget, whichever comes first.
//! - **Fault isolation**: a panic inside actor code stops that actor alone.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tidemark_core::actor::{Actor, ActorContext, Message, System, SystemConfig};
//! use async_trait::async_trait;
//!
//! struct Counter(u64);
//!
//! #[async_trait]
//! impl Actor for Counter {
//!     type Payload = u64;
//!     async fn poll(&mut self, _ctx: &ActorContext, msgs: Vec<Message<u64>>) -> bool {
//!         for msg in msgs {
//!             match msg {
//!                 Message::Value(n) => self.0 += n,
//!                 Message::Stop => return false,
//!                 _ => {}
//!             }
//!         }
//!         true
//!     }
//! }
//!
//! # async fn example() {
//! let system: System<u64> = System::new("counters", SystemConfig::default());
//! let router = system.router();
//! system.spawn(1, Box::new(Counter(0))).unwrap();
//! router.send(1, Message::Value(41));
//! # }
//! ```

pub mod actor;
pub mod error;

pub use actor::{Actor, ActorContext, ActorId, Message, Router, SendResult, System, SystemConfig};
pub use error::SystemError;
