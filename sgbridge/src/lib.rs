//! Send side of a message bridge.
//!
//! A dedicated thread drains encoded AMQP envelopes from an in-process queue,
//! extracts each message body, and forwards it as one datagram to a local
//! (filesystem path) or UDP destination. Per-message failures are counted and
//! skipped; only a broken socket stops the thread.
//!
//! ```no_run
//! use sgbridge::cancel::CancelToken;
//! use sgbridge::config::BridgeConfig;
//! use sgbridge::envelope::{Body, MessageBuilder};
//! use sgbridge::queue;
//! use sgbridge::runtime::Worker;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (tx, rx) = queue::channel(1024);
//! let worker = Worker::spawn(&BridgeConfig::default(), rx, CancelToken::new())?;
//!
//! let msg = MessageBuilder::new().body(Body::data(b"{}".to_vec())).encode();
//! tx.push(msg.into())?;
//!
//! drop(tx);
//! let stats = worker.stats().clone();
//! let exit = worker.join()?;
//! println!("{exit:?}: {}", stats.snapshot());
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod config;
pub mod envelope;
pub mod net;
pub mod queue;
pub mod runtime;
mod trace;

pub use trace::init_tracing;
