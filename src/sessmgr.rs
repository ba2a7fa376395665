// Copyright 2020 Joyent, Inc.

//! Client session manager: one `ClntSession` per destination.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use slog::{debug, o, Logger};

use crate::client::ClntSession;
use crate::config::ClntConfig;
use crate::error::SessionError;
use crate::protocol::{ClientId, Fcall, Fence, SessionId, Tmsg};
use crate::{lock, logger_or_stdlog};

/// Hands out client sessions keyed by destination, an ordered list of
/// candidate addresses for one logical server.
///
/// A session that has closed is replaced by a fresh one, with a new session
/// id, the next time its destination is used.
pub struct SessionMgr {
    client: ClientId,
    cfg: ClntConfig,
    log: Logger,
    sessions: Mutex<HashMap<Vec<SocketAddr>, Arc<ClntSession>>>,
}

impl SessionMgr {
    pub fn new(cfg: ClntConfig, log: Option<&Logger>) -> SessionMgr {
        SessionMgr::with_client(ClientId::random(), cfg, log)
    }

    pub fn with_client(
        client: ClientId,
        cfg: ClntConfig,
        log: Option<&Logger>,
    ) -> SessionMgr {
        let log = logger_or_stdlog(log).new(o!("client" => client.as_u64()));
        SessionMgr {
            client,
            cfg,
            log,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client
    }

    pub fn lookup_or_alloc(
        &self,
        addrs: &[SocketAddr],
    ) -> Result<Arc<ClntSession>, SessionError> {
        if addrs.is_empty() {
            return Err(SessionError::Unreachable(String::from(
                "empty address list",
            )));
        }

        let mut sessions = lock(&self.sessions);
        if let Some(sess) = sessions.get(addrs) {
            if !sess.is_closed() {
                return Ok(Arc::clone(sess));
            }
        }

        let sess = ClntSession::new(
            SessionId::random(),
            self.client,
            addrs.to_vec(),
            self.cfg.clone(),
            Some(&self.log),
        );
        debug!(self.log, "new session";
            "sid" => sess.sid().as_u64(), "addrs" => ?addrs);
        sessions.insert(addrs.to_vec(), Arc::clone(&sess));
        Ok(sess)
    }

    /// Sends `msg` to the server at `addrs` and waits for its reply.
    pub async fn rpc(
        &self,
        addrs: &[SocketAddr],
        msg: Tmsg,
        fence: Fence,
    ) -> Result<Fcall, SessionError> {
        let sess = self.lookup_or_alloc(addrs)?;
        sess.rpc(msg, fence).await
    }

    /// Closes and forgets the session for `addrs`, if any.
    pub fn disconnect(&self, addrs: &[SocketAddr]) {
        let sess = lock(&self.sessions).remove(addrs);
        if let Some(sess) = sess {
            debug!(self.log, "disconnecting"; "sid" => sess.sid().as_u64());
            sess.close();
        }
    }

    /// Detaches every session.
    pub async fn exit(&self) {
        let sessions: Vec<Arc<ClntSession>> =
            lock(&self.sessions).drain().map(|(_, s)| s).collect();
        for sess in sessions {
            if let Err(e) = sess.detach().await {
                debug!(self.log, "detach failed";
                    "sid" => sess.sid().as_u64(), "err" => %e);
            }
        }
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        lock(&self.sessions).values().map(|s| s.sid()).collect()
    }
}
