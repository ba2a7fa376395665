// Copyright 2020 Joyent, Inc.

//! Per-session reply cache.
//!
//! Maps a sequence number to the reply produced the first time it was
//! executed, so a retransmitted request is answered without running it
//! again. Each request carries the client's low-water mark (`acked`): the
//! client never resends below it, so entries under the mark are dropped and
//! any request under the mark is a stale duplicate.

use std::collections::BTreeMap;

use crate::protocol::{Fcall, Seqno};

#[derive(Debug, Default)]
pub struct ReplyCache {
    replies: BTreeMap<Seqno, Fcall>,
    low_water: Seqno,
}

impl ReplyCache {
    pub fn new() -> Self {
        ReplyCache::default()
    }

    pub fn lookup(&self, seqno: Seqno) -> Option<&Fcall> {
        self.replies.get(&seqno)
    }

    pub fn insert(&mut self, reply: Fcall) {
        if reply.seqno >= self.low_water {
            self.replies.insert(reply.seqno, reply);
        }
    }

    /// Raises the low-water mark to `acked` and drops every reply below it.
    /// Returns how many replies were dropped.
    pub fn advance(&mut self, acked: Seqno) -> usize {
        if acked <= self.low_water {
            return 0;
        }
        self.low_water = acked;
        let keep = self.replies.split_off(&acked);
        let purged = self.replies.len();
        self.replies = keep;
        purged
    }

    /// True if the client has promised never to send `seqno` again.
    pub fn is_stale(&self, seqno: Seqno) -> bool {
        seqno < self.low_water
    }

    pub fn low_water(&self) -> Seqno {
        self.low_water
    }

    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }

    pub fn clear(&mut self) {
        self.replies.clear();
    }
}
