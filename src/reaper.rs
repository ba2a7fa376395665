// Copyright 2020 Joyent, Inc.

//! Detaches server sessions whose client has gone silent.

use std::cmp;
use std::sync::Arc;
use std::time::{Duration, Instant};

use slog::{debug, info, o, Logger};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::logger_or_stdlog;
use crate::protocol::{Fcall, Fence, Tmsg};
use crate::srvsess::SessionTable;

/// Tombstones are kept this many session timeouts before being forgotten.
const TOMBSTONE_TIMEOUTS: u32 = 10;

pub struct Reaper {
    table: Arc<SessionTable>,
    timeout: Duration,
    interval: Duration,
    replica_id: u64,
    log: Logger,
}

impl Reaper {
    pub fn new(
        table: Arc<SessionTable>,
        timeout: Duration,
        interval: Duration,
        replica_id: u64,
        log: Option<&Logger>,
    ) -> Reaper {
        Reaper {
            table,
            timeout,
            interval: cmp::max(interval, Duration::from_millis(1)),
            replica_id,
            log: logger_or_stdlog(log).new(o!("component" => "reaper")),
        }
    }

    /// Returns a detach request for every open session not heard from
    /// within the timeout as of `now`. A session gets at most one pending
    /// detach.
    pub fn expired(&self, now: Instant) -> Vec<Fcall> {
        self.table
            .snapshot()
            .into_iter()
            .filter(|sess| {
                now.saturating_duration_since(sess.last_heard()) > self.timeout
            })
            .filter(|sess| sess.begin_detach())
            .map(|sess| {
                info!(self.log, "session timed out";
                    "sid" => sess.sid().as_u64());
                Fcall::request(
                    Tmsg::detach(self.replica_id, self.replica_id),
                    sess.sid(),
                    sess.client(),
                    0,
                    0,
                    Fence::default(),
                )
            })
            .collect()
    }

    /// Scans the table every interval until `token` is cancelled, handing
    /// each synthesized detach to `submit`. `submit` must route it through
    /// the session's ordered queue.
    pub async fn run<F>(self, token: CancellationToken, submit: F)
    where
        F: Fn(Fcall),
    {
        let mut ticker = time::interval(self.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Instant::now();
                    for detach in self.expired(now) {
                        submit(detach);
                    }
                    let forgotten = self.table.forget_closed(
                        now,
                        self.timeout * TOMBSTONE_TIMEOUTS,
                    );
                    if forgotten > 0 {
                        debug!(self.log, "forgot closed sessions";
                            "count" => forgotten);
                    }
                }
            }
        }
    }
}
