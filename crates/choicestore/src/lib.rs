//! Short-lived choice store.
//!
//! Maps short opaque ids (small enough for a chat button payload) to pending
//! requests. Entries expire `ttl` after creation; an expired id keeps
//! answering [`StoreError::Expired`] for `expired_retention` before it is
//! forgotten, so callers can tell "too late" apart from "never existed".

mod store;

pub use store::{Entry, RequestStore, StoreConfig, StoreError, SweepStats};
