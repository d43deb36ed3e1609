#![no_std]

//! Streamgate Common Types
//!
//! Value types shared by the endpoint pool, the stream state machine and the
//! metrics recorder. Everything here is `no_std` (+ `alloc`) and cheap to copy
//! or clone, so it can be used as map keys and stored in atomics.

extern crate alloc;

use alloc::string::{String, ToString};
use core::fmt;
use core::str::FromStr;

/// Default per-connection stream limit (HTTP/2 SETTINGS_MAX_CONCURRENT_STREAMS
/// as most servers advertise it)
pub const DEFAULT_MAX_STREAMS_PER_CONNECTION: u32 = 100;

/// First client-initiated stream id (HTTP/2 client streams are odd)
pub const FIRST_CLIENT_STREAM_ID: u32 = 1;

/// Largest stream id a connection may hand out (31-bit HTTP/2 id space)
pub const MAX_STREAM_ID: u32 = (1 << 31) - 1;

/// Remote endpoint (host + port)
///
/// Used as the endpoint pool key and as the suffix of the per-endpoint
/// metric names. `Display` renders `host:port`; IPv6 literals are bracketed
/// (`[::1]:8080`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        // Store IPv6 literals without brackets so both spellings compare equal
        let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            Some(inner) => inner.to_string(),
            None => host,
        };
        Self { host, port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// True if the host is an IPv6 literal (needs brackets in `host:port`)
    pub fn is_ipv6_literal(&self) -> bool {
        self.host.contains(':')
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6_literal() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Error returned when parsing an `Endpoint` from a `host:port` string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseEndpointError {
    MissingPort,
    InvalidPort,
    EmptyHost,
}

impl fmt::Display for ParseEndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseEndpointError::MissingPort => write!(f, "expected HOST:PORT, missing port"),
            ParseEndpointError::InvalidPort => write!(f, "port must be a number in 0-65535"),
            ParseEndpointError::EmptyHost => write!(f, "host must not be empty"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ParseEndpointError;

    /// Parse `host:port`, `[v6]:port` style strings
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // rsplit_once so IPv6 literals keep their inner colons
        let (host, port) = s.rsplit_once(':').ok_or(ParseEndpointError::MissingPort)?;
        let port: u16 = port.parse().map_err(|_| ParseEndpointError::InvalidPort)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ParseEndpointError::EmptyHost);
        }
        Ok(Endpoint::new(host, port))
    }
}

/// Stream identifier, unique within one connection's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamId(pub u32);

impl StreamId {
    /// Next client-initiated id (odd ids, step 2). None once the id space is exhausted.
    pub const fn next(self) -> Option<StreamId> {
        match self.0.checked_add(2) {
            Some(id) if id <= MAX_STREAM_ID => Some(StreamId(id)),
            _ => None,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stream lifecycle state
///
/// `Created → Active → {Completed, Reset, TimedOut, Errored}`.
/// The four terminal states are absorbing and mutually exclusive.
/// Stored as `u8` so it can live in an `AtomicU8`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StreamState {
    Created = 0,
    Active = 1,
    Completed = 2,
    Reset = 3,
    TimedOut = 4,
    Errored = 5,
}

impl StreamState {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a state stored in an atomic. Unknown values map to `None`.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(StreamState::Created),
            1 => Some(StreamState::Active),
            2 => Some(StreamState::Completed),
            3 => Some(StreamState::Reset),
            4 => Some(StreamState::TimedOut),
            5 => Some(StreamState::Errored),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Reset | StreamState::TimedOut | StreamState::Errored
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            StreamState::Created => "created",
            StreamState::Active => "active",
            StreamState::Completed => "completed",
            StreamState::Reset => "reset",
            StreamState::TimedOut => "timed_out",
            StreamState::Errored => "errored",
        }
    }
}

/// Why a stream left the non-terminal states
///
/// Every trigger path (normal completion, remote reset, local timeout,
/// caller cancellation, connection failure) names one of these when it
/// attempts the terminal claim.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TerminalReason {
    Completed = 2,
    Reset = 3,
    TimedOut = 4,
    Errored = 5,
}

impl TerminalReason {
    /// Terminal state entered when this reason wins the claim
    pub const fn state(self) -> StreamState {
        match self {
            TerminalReason::Completed => StreamState::Completed,
            TerminalReason::Reset => StreamState::Reset,
            TerminalReason::TimedOut => StreamState::TimedOut,
            TerminalReason::Errored => StreamState::Errored,
        }
    }

    pub const fn as_str(self) -> &'static str {
        self.state().as_str()
    }
}

impl From<TerminalReason> for StreamState {
    fn from(reason: TerminalReason) -> Self {
        reason.state()
    }
}
