//! Type definitions for the commit locking layer.

mod ids;

pub use ids::{Oid, SessionId, Tid, TxnId};
