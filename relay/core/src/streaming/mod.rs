//! Streaming Infrastructure
//!
//! Shares one token stream between the live client and the persistence sink.
//!
//! # Architecture
//!
//! ```text
//!                    ┌────────────────────────┐
//!  FilteredTokens ──▶│    multicast actor     │
//!                    │ owns upstream + senders│
//!                    └─────┬────────────┬─────┘
//!                          │            │
//!                      Branch A     Branch B
//!                    (client SSE) (persistence)
//! ```
//!
//! The actor keeps pulling while either branch is attached. Dropping the
//! client branch (a disconnect) leaves the persistence branch running to the
//! end of the reply; the upstream is dropped only once both have gone.

mod multicast;

pub use multicast::{fan_out, Branch};
