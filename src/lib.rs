// Copyright 2020 Joyent, Inc.

//! SigmaP sessions: reliable, ordered, at-most-once RPC over TCP
//!
//! Every SigmaOS service speaks SigmaP, a file-system-shaped request/reply
//! protocol. This crate provides the session layer that sits under it: a
//! logical client/server session that survives broken TCP connections,
//! replica failover and duplicated messages.
//!
//! Client side: a [`sessmgr::SessionMgr`] maps a destination (an ordered
//! list of candidate addresses) to a [`client::ClntSession`]. The session
//! stamps each request with the next sequence number, tracks it until a
//! reply arrives, and on a connection break redials the address list and
//! resends everything outstanding in sequence-number order.
//!
//! Server side: a [`server::SessionSrv`] accepts connections and routes
//! each frame to a [`srvsess::SrvSession`] from the
//! [`srvsess::SessionTable`]. A session executes its requests one at a
//! time, serving retransmissions from its [`replycache::ReplyCache`]. The
//! [`reaper::Reaper`] detaches sessions whose client went silent.
//!
//! Protocol definition
//!
//! SigmaP frames have the following structure:
//!
//! * LEN       4-byte big-endian unsigned integer, the number of bytes that
//!             follow.  Receivers read exactly one frame without look-ahead.
//!
//! * VERSION   1-byte integer.  The only supported value is "1".
//!
//! * TYPE      1-byte integer, the `FcallType`.
//!
//! * SESSION   8-byte big-endian session id.
//!
//! * CLIENT    8-byte big-endian client id.
//!
//! * SEQNO     8-byte big-endian sequence number.
//!
//! * ACKED     8-byte big-endian sequence number below which the client will
//!             never resend.
//!
//! * TAG       2-byte big-endian tag.
//!
//! * FENCELEN  2-byte big-endian length, followed by FENCELEN opaque bytes.
//!
//! * CRC       4-byte big-endian CRC16 of PAYLOAD followed by DATA.
//!
//! * PLEN      4-byte big-endian length, followed by a JSON-encoded PAYLOAD.
//!
//! * DLEN      4-byte big-endian length, followed by DLEN raw DATA bytes.

#![allow(missing_docs)]

use std::sync::{Mutex, MutexGuard, PoisonError};

use slog::{o, Drain, Logger};

pub mod client;
pub mod config;
pub mod conn;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod reaper;
pub mod replicate;
pub mod replycache;
pub mod server;
pub mod sessmgr;
pub mod srvsess;

pub use crate::error::SessionError;

/// Falls back to the `log` crate when the caller gives no logger.
pub(crate) fn logger_or_stdlog(log: Option<&Logger>) -> Logger {
    log.cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
}

/// Session state stays consistent across a panicking holder, so a poisoned
/// lock is still usable.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
