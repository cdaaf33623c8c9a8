// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the gateway.
//!
//! Fatal errors (`GatewayError`) abort the process at startup. Per-session
//! failures (`SessionExit`) never propagate as Rust errors across threads —
//! they are the terminal value a session worker reports to the reaper.

use std::fmt;
use thiserror::Error;

/// Fatal, startup-time errors. Any of these aborts the process with exit
/// code 1.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("failed to bind any listening socket")]
    BindFailure,

    #[error("failed to listen on any bound socket")]
    ListenFailure,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The reason a session worker terminated. Mirrors the historic
/// `RETVAL_*` exit codes of the C implementation, kept as small integers
/// so the reaper can log a terse numeric code the way the original did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// Clean termination: service not found, bad request already replied to,
    /// admission refused, etc. Nothing more to do.
    Clean,
    /// A write to the client socket failed or the client half-closed.
    WriteFailed,
    /// The request line could not be read at all.
    ReadFailed,
    /// `GET` was not used.
    UnknownMethod,
    /// The request line/URL was malformed or exceeded the size bound.
    BadRequest,
    /// Joining the multicast group failed.
    RtpFailed,
    /// The upstream multicast socket produced an error or went quiet.
    SockReadFailed,
    /// The worker thread panicked; converted here instead of unwinding
    /// into the dispatcher.
    Panicked,
}

impl SessionExit {
    /// Numeric code matching the historic `RETVAL_*` constants.
    pub fn code(self) -> i32 {
        match self {
            SessionExit::Clean => 0,
            SessionExit::WriteFailed => 1,
            SessionExit::ReadFailed => 2,
            SessionExit::UnknownMethod => 3,
            SessionExit::BadRequest => 4,
            SessionExit::RtpFailed => 5,
            SessionExit::SockReadFailed => 6,
            SessionExit::Panicked => 7,
        }
    }
}

impl fmt::Display for SessionExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionExit::Clean => "CLEAN",
            SessionExit::WriteFailed => "WRITE_FAILED",
            SessionExit::ReadFailed => "READ_FAILED",
            SessionExit::UnknownMethod => "UNKNOWN_METHOD",
            SessionExit::BadRequest => "BAD_REQUEST",
            SessionExit::RtpFailed => "RTP_FAILED",
            SessionExit::SockReadFailed => "SOCK_READ_FAILED",
            SessionExit::Panicked => "PANICKED",
        };
        write!(f, "{name}({})", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_historic_values() {
        assert_eq!(SessionExit::Clean.code(), 0);
        assert_eq!(SessionExit::WriteFailed.code(), 1);
        assert_eq!(SessionExit::ReadFailed.code(), 2);
        assert_eq!(SessionExit::UnknownMethod.code(), 3);
        assert_eq!(SessionExit::BadRequest.code(), 4);
        assert_eq!(SessionExit::RtpFailed.code(), 5);
        assert_eq!(SessionExit::SockReadFailed.code(), 6);
    }
}
