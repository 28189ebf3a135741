//! Core identifier types.
//!
//! These types provide type-safe wrappers around numeric identifiers,
//! preventing accidental misuse of object ids as version tokens and so on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Object identifier - stable key of a stored object.
///
/// # Example
///
/// ```rust
/// use commitlock_common::types::Oid;
///
/// let oid = Oid::new(42);
/// assert_eq!(oid.as_u64(), 42);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Oid(u64);

impl Oid {
    /// The root object.
    pub const ROOT: Self = Self(0);

    /// Creates a new `Oid` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Converts to bytes (big-endian).
    #[inline]
    #[must_use]
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({:#x})", self.0)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Oid {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

/// Version token - identifies the committed version of an object.
///
/// Version tokens are allocated by the backend at commit time and are
/// strictly increasing. `Tid::ZERO` stands for "no committed version",
/// which is what a transaction expects when it creates a new object.
///
/// # Example
///
/// ```rust
/// use commitlock_common::types::Tid;
///
/// let tid = Tid::new(5);
/// assert!(tid.next() > tid);
/// assert!(!Tid::ZERO.is_committed());
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Tid(u64);

impl Tid {
    /// Version token of an object that has never been committed.
    pub const ZERO: Self = Self(0);

    /// Creates a new `Tid` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(tid: u64) -> Self {
        Self(tid)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next version token.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns true if this token names a committed version.
    #[inline]
    #[must_use]
    pub const fn is_committed(self) -> bool {
        self.0 != Self::ZERO.0
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ZERO {
            write!(f, "Tid(ZERO)")
        } else {
            write!(f, "Tid({})", self.0)
        }
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Tid {
    #[inline]
    fn from(tid: u64) -> Self {
        Self::new(tid)
    }
}

impl From<Option<Tid>> for Tid {
    /// A missing row has no committed version.
    #[inline]
    fn from(tid: Option<Tid>) -> Self {
        tid.unwrap_or(Self::ZERO)
    }
}

/// Transaction identifier - uniquely identifies a transaction attempt.
///
/// Transaction IDs are handed out by the commit coordinator and are
/// monotonically increasing. A retried transaction gets a fresh id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TxnId(u64);

impl TxnId {
    /// Invalid transaction ID, used as a sentinel value.
    pub const INVALID: Self = Self(0);

    /// Creates a new `TxnId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Checks if this is a valid transaction ID.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "TxnId(INVALID)")
        } else {
            write!(f, "TxnId({})", self.0)
        }
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TxnId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

/// Backend session identifier.
///
/// One session backs one connection handle; the backend's lock table and
/// wait-for graph are keyed by session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Creates a new `SessionId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}
