// Copyright 2020 Joyent, Inc.

//! Seams to a replicated log (e.g. a Raft clerk).
//!
//! The session layer does no consensus itself. In replicated mode it hands
//! each request to a [`Replicator`]; the replicator delivers committed
//! requests back through `SessionSrv::apply_committed` on every replica,
//! where the reply cache absorbs duplicates.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::SessionError;
use crate::protocol::Fcall;

pub trait Replicator: Send + Sync + 'static {
    /// Proposes `fcall`. The proposal must be ordered at call time: two
    /// calls for the same session commit in call order. The returned future
    /// resolves once the request is committed, or fails if it will not be.
    fn propose(
        &self,
        fcall: Fcall,
    ) -> BoxFuture<'static, Result<(), SessionError>>;
}

/// Decides whether a committed `Tdetach` may close its session.
pub type Authorizer = Arc<dyn Fn(&Fcall) -> bool + Send + Sync>;

/// Honors a detach only if its proposer was the leader recorded in the
/// envelope. A detach proposed by a deposed leader is ignored, so it
/// cannot tear down a session the new leader has resumed. A client's own
/// detach (`Tmsg::client_detach`) is always honored.
pub fn leader_only() -> Authorizer {
    Arc::new(|fcall: &Fcall| match fcall.detach_req() {
        Ok(req) => req.from_client() || req.proposer == req.leader,
        Err(_) => false,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Mutex;

    use futures::future;
    use tokio_test::block_on;

    use crate::protocol::{
        ClientId, FcallType, Fence, SessionId, Tmsg, CLIENT_PROPOSER,
    };

    /// An in-memory log that accepts proposals while it has room.
    struct MemLog {
        entries: Mutex<Vec<Fcall>>,
        capacity: usize,
    }

    impl Replicator for MemLog {
        fn propose(
            &self,
            fcall: Fcall,
        ) -> BoxFuture<'static, Result<(), SessionError>> {
            let mut entries = self.entries.lock().unwrap();
            let res = if entries.len() < self.capacity {
                entries.push(fcall);
                Ok(())
            } else {
                Err(SessionError::Retry(String::from("log full")))
            };
            Box::pin(future::ready(res))
        }
    }

    fn detach(proposer: u64, leader: u64) -> Fcall {
        Fcall::request(
            Tmsg::detach(proposer, leader),
            SessionId::new(3),
            ClientId::new(3),
            0,
            0,
            Fence::default(),
        )
    }

    #[test]
    fn leader_only_checks_proposer() {
        let authorize = leader_only();
        assert!(authorize(&detach(2, 2)));
        assert!(!authorize(&detach(1, 2)));

        assert!(authorize(&detach(CLIENT_PROPOSER, CLIENT_PROPOSER)));

        let mut garbled = detach(2, 2);
        garbled.payload = serde_json::Value::Null;
        assert!(!authorize(&garbled));
    }

    #[test]
    fn proposals_are_ordered_at_call_time() {
        let log = MemLog {
            entries: Mutex::new(Vec::new()),
            capacity: 2,
        };
        let first = log.propose(detach(1, 1));
        let second = log.propose(Fcall::request(
            Tmsg::new(FcallType::Twalk, serde_json::Value::Null),
            SessionId::new(3),
            ClientId::new(3),
            1,
            1,
            Fence::default(),
        ));
        let third = log.propose(detach(1, 1));

        // Awaited out of order; the log order is already fixed.
        assert!(block_on(second).is_ok());
        assert!(block_on(first).is_ok());
        assert!(block_on(third).is_err());

        let entries = log.entries.lock().unwrap();
        let types: Vec<FcallType> = entries.iter().map(|f| f.ty).collect();
        assert_eq!(types, vec![FcallType::Tdetach, FcallType::Twalk]);
    }
}
