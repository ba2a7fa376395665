// Copyright 2020 Joyent, Inc.

//! Accepts SigmaP connections and routes their frames to server sessions.

use std::sync::Arc;

use slog::{debug, error, info, o, trace, warn, Logger};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SrvConfig;
use crate::conn::Conn;
use crate::dispatch::NewProtocol;
use crate::error::SessionError;
use crate::logger_or_stdlog;
use crate::protocol::{Fcall, FcallType, HeartbeatReq, SessionId};
use crate::reaper::Reaper;
use crate::replicate::{leader_only, Authorizer, Replicator};
use crate::srvsess::SessionTable;

pub struct SessionSrv {
    cfg: SrvConfig,
    newproto: Arc<dyn NewProtocol>,
    table: Arc<SessionTable>,
    replicator: Option<Arc<dyn Replicator>>,
    log: Logger,
    token: CancellationToken,
}

impl SessionSrv {
    pub fn new<P: NewProtocol>(
        cfg: SrvConfig,
        newproto: P,
        log: Option<&Logger>,
    ) -> SessionSrv {
        let log = logger_or_stdlog(log);
        let newproto: Arc<dyn NewProtocol> = Arc::new(newproto);
        let table = Arc::new(SessionTable::new(
            Arc::clone(&newproto),
            leader_only(),
            Some(&log),
        ));
        SessionSrv {
            cfg,
            newproto,
            table,
            replicator: None,
            log,
            token: CancellationToken::new(),
        }
    }

    /// Switches to replicated mode: requests are proposed to `replicator`
    /// and executed when committed, and a committed detach closes its
    /// session only if `authorize` accepts it. Must be called before any
    /// connection is served.
    pub fn with_replicator(
        mut self,
        replicator: Arc<dyn Replicator>,
        authorize: Authorizer,
    ) -> SessionSrv {
        self.table = Arc::new(SessionTable::new(
            Arc::clone(&self.newproto),
            authorize,
            Some(&self.log),
        ));
        self.replicator = Some(replicator);
        self
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// Accepts connections until `shutdown` is called. Also runs the
    /// session reaper for the server's lifetime.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let _reaper = self.spawn_reaper();
        if let Ok(addr) = listener.local_addr() {
            info!(self.log, "listening for sigmap sessions"; "address" => addr);
        }

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        self.accept(stream);
                    }
                    Err(e) => {
                        error!(self.log, "failed to accept socket";
                            "err" => %e);
                    }
                }
            }
        }
        info!(self.log, "server shut down");
    }

    /// Serves one already-accepted socket.
    pub fn accept(self: &Arc<Self>, stream: TcpStream) -> Conn {
        let srv = Arc::clone(self);
        let table = Arc::clone(&self.table);
        let log = self.log.clone();
        let conn = Conn::spawn(
            stream,
            &self.log,
            self.token.child_token(),
            move |conn: &Conn, fcall: Fcall| srv.on_frame(conn, fcall),
            move |conn: &Conn, reason: SessionError| {
                let unbound = table.unbind_conn(conn.id());
                debug!(log, "client connection closed";
                    "conn" => conn.id(), "reason" => %reason,
                    "unbound" => unbound);
            },
        );
        debug!(self.log, "accepted connection"; "conn" => conn.id());
        conn
    }

    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let reaper = Reaper::new(
            Arc::clone(&self.table),
            self.cfg.session_timeout(),
            self.cfg.reap_interval(),
            self.cfg.replica_id,
            Some(&self.log),
        );
        let srv = Arc::clone(self);
        let token = self.token.child_token();
        tokio::spawn(async move {
            reaper.run(token, move |detach| srv.route_detach(detach)).await;
        })
    }

    /// Executes a request the replicated log has committed. Called on every
    /// replica, possibly more than once for the same request.
    pub fn apply_committed(&self, fcall: Fcall) -> Result<(), SessionError> {
        let sess = self.table.alloc_if_absent(fcall.session, fcall.client)?;
        sess.touch();
        sess.submit(fcall)
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    fn on_frame(&self, conn: &Conn, fcall: Fcall) {
        if !fcall.ty.is_request() {
            warn!(self.log, "unexpected message from client";
                "conn" => conn.id(), "type" => ?fcall.ty);
            conn.close_with(SessionError::UnknownMessage(fcall.ty as u8));
            return;
        }

        let sess = match self.table.alloc_if_absent(fcall.session, fcall.client)
        {
            Ok(sess) => sess,
            Err(e) => {
                debug!(self.log, "rejecting request";
                    "sid" => fcall.session.as_u64(), "err" => %e);
                let _ = conn.send(fcall.rerror(&e));
                return;
            }
        };
        sess.touch();
        if !sess.bind(conn) {
            trace!(self.log, "frame on superseded connection";
                "sid" => fcall.session.as_u64(), "conn" => conn.id());
        }

        if fcall.ty == FcallType::Theartbeat {
            self.heartbeat(&fcall);
        }

        match &self.replicator {
            Some(replicator) if fcall.ty != FcallType::Theartbeat => {
                self.propose(replicator, conn, fcall)
            }
            _ => {
                if let Err(fcall) = sess.try_submit(fcall) {
                    let _ = conn.send(fcall.rerror(&SessionError::Closed));
                }
            }
        }
    }

    /// A heartbeat vouches for every session it lists, not only the one
    /// that carried it.
    fn heartbeat(&self, fcall: &Fcall) {
        let payload = fcall.payload.clone();
        let req: HeartbeatReq = match serde_json::from_value(payload) {
            Ok(req) => req,
            Err(_) => return,
        };
        for sid in req.sids {
            if let Ok(Some(sess)) = self.table.lookup(SessionId::new(sid)) {
                sess.touch();
            }
        }
    }

    fn propose(
        &self,
        replicator: &Arc<dyn Replicator>,
        conn: &Conn,
        fcall: Fcall,
    ) {
        let req = fcall.clone();
        // Ordering is fixed here, at call time; the task only waits.
        let committed = replicator.propose(fcall);
        let conn = conn.clone();
        let log = self.log.new(o!("sid" => req.session.as_u64()));
        tokio::spawn(async move {
            if let Err(e) = committed.await {
                debug!(log, "proposal failed";
                    "seqno" => req.seqno, "err" => %e);
                let retry = SessionError::Retry(e.to_string());
                let _ = conn.send(req.rerror(&retry));
            }
        });
    }

    fn route_detach(&self, detach: Fcall) {
        let sid = detach.session;
        match &self.replicator {
            Some(replicator) => {
                let committed = replicator.propose(detach);
                let table = Arc::clone(&self.table);
                let log = self.log.clone();
                tokio::spawn(async move {
                    if let Err(e) = committed.await {
                        debug!(log, "detach proposal failed";
                            "sid" => sid.as_u64(), "err" => %e);
                        if let Ok(Some(sess)) = table.lookup(sid) {
                            sess.abandon_detach();
                        }
                    }
                });
            }
            None => {
                if let Ok(Some(sess)) = self.table.lookup(sid) {
                    if let Err(e) = sess.submit(detach) {
                        debug!(self.log, "failed to queue detach";
                            "sid" => sid.as_u64(), "err" => %e);
                    }
                }
            }
        }
    }
}
