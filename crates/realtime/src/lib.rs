//! Realtime change feed for the placement backend
//!
//! Speaks the Phoenix channel protocol over one websocket and delivers
//! `postgres_changes` notifications for a table to an `mpsc` receiver. The
//! returned [`Subscription`] leaves the channel when unsubscribed or dropped.

mod channel;
mod client;
mod error;
mod message;

pub use channel::{PostgresChanges, Subscription};
pub use client::{ConnectionState, RealtimeClient, RealtimeClientOptions};
pub use error::RealtimeError;
pub use message::{Change, ChangeEvent, ChangeKind, RealtimeMessage};
