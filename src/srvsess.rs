// Copyright 2020 Joyent, Inc.

//! Server sessions and the table that holds them.
//!
//! Each `SrvSession` owns one worker task and an unbounded queue. Whatever
//! the source of a request (a live connection, a replayed commit, the
//! reaper), it goes through that queue, so a session executes its requests
//! one at a time in arrival order no matter how many connections carried
//! them. Replies go to the connection currently bound to the session, or to
//! the oneshot given to `execute`.
//!
//! Locking is two-level: the table lock covers insert and lookup only;
//! each session's own lock covers its binding and liveness fields.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value;
use slog::{debug, info, o, trace, warn, Logger};
use tokio::sync::{mpsc, oneshot};

use crate::conn::{Conn, ConnId};
use crate::dispatch::{NewProtocol, Protocol};
use crate::error::SessionError;
use crate::protocol::{ClientId, Fcall, FcallType, SessionId};
use crate::replicate::Authorizer;
use crate::replycache::ReplyCache;
use crate::{lock, logger_or_stdlog};

pub struct SrvSession {
    sid: SessionId,
    log: Logger,
    state: Mutex<SrvState>,
    queue: mpsc::UnboundedSender<Work>,
}

struct SrvState {
    client: ClientId,
    conn: Option<Conn>,
    /// Highest connection id ever bound; older connections never win back
    /// the reply path.
    bound: ConnId,
    last_heard: Instant,
    closed: bool,
    detaching: bool,
}

struct Work {
    fcall: Fcall,
    reply: Option<oneshot::Sender<Fcall>>,
}

impl SrvSession {
    fn spawn(
        sid: SessionId,
        client: ClientId,
        proto: Box<dyn Protocol>,
        authorize: Authorizer,
        log: &Logger,
    ) -> Arc<SrvSession> {
        let log = log.new(o!("sid" => sid.as_u64()));
        let (tx, rx) = mpsc::unbounded_channel();
        let sess = Arc::new(SrvSession {
            sid,
            log: log.clone(),
            state: Mutex::new(SrvState {
                client,
                conn: None,
                bound: 0,
                last_heard: Instant::now(),
                closed: false,
                detaching: false,
            }),
            queue: tx,
        });

        let worker = Worker {
            sess: Arc::downgrade(&sess),
            proto,
            cache: ReplyCache::new(),
            authorize,
            log,
        };
        tokio::spawn(worker.run(rx));
        sess
    }

    pub fn sid(&self) -> SessionId {
        self.sid
    }

    pub fn client(&self) -> ClientId {
        lock(&self.state).client
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn last_heard(&self) -> Instant {
        lock(&self.state).last_heard
    }

    /// Records that the client was heard from.
    pub fn touch(&self) {
        lock(&self.state).last_heard = Instant::now();
    }

    /// Makes `conn` the destination for this session's replies. Only the
    /// reply path changes; queued and applied requests are unaffected.
    ///
    /// Connection ids only grow, so a frame arriving late on a connection
    /// older than the bound one leaves the binding alone. Returns whether
    /// `conn` is now bound.
    pub fn bind(&self, conn: &Conn) -> bool {
        let mut st = lock(&self.state);
        if st.closed || conn.is_closed() || conn.id() < st.bound {
            return false;
        }
        match &st.conn {
            Some(cur) if cur.id() == conn.id() => return true,
            Some(cur) => {
                debug!(self.log, "rebinding session";
                    "from" => cur.id(), "to" => conn.id());
            }
            None => {
                debug!(self.log, "binding session"; "conn" => conn.id());
            }
        }
        st.bound = conn.id();
        st.conn = Some(conn.clone());
        true
    }

    /// Drops the binding if it is to connection `id`, which has closed.
    /// Replies emitted until the client comes back are dropped; its resend
    /// is answered from the reply cache.
    pub fn unbind(&self, id: ConnId) -> bool {
        let mut st = lock(&self.state);
        match &st.conn {
            Some(cur) if cur.id() == id => {
                debug!(self.log, "unbinding session"; "conn" => id);
                st.conn = None;
                true
            }
            _ => false,
        }
    }

    pub fn bound_conn(&self) -> Option<ConnId> {
        lock(&self.state).conn.as_ref().map(Conn::id)
    }

    /// Queues `fcall`; its reply goes to the bound connection.
    pub fn submit(&self, fcall: Fcall) -> Result<(), SessionError> {
        self.enqueue(Work { fcall, reply: None })
    }

    /// Queues `fcall` and returns a receiver for its reply.
    pub fn execute(
        &self,
        fcall: Fcall,
    ) -> Result<oneshot::Receiver<Fcall>, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Work {
            fcall,
            reply: Some(tx),
        })?;
        Ok(rx)
    }

    /// Like `submit`, but hands `fcall` back if the session is closed.
    pub(crate) fn try_submit(&self, fcall: Fcall) -> Result<(), Fcall> {
        if self.is_closed() {
            return Err(fcall);
        }
        self.queue
            .send(Work { fcall, reply: None })
            .map_err(|e| e.0.fcall)
    }

    fn enqueue(&self, work: Work) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.queue.send(work).map_err(|_| SessionError::Closed)
    }

    /// Claims the right to inject a timeout detach. False if the session is
    /// already closed or a detach is already on its way.
    pub(crate) fn begin_detach(&self) -> bool {
        let mut st = lock(&self.state);
        if st.closed || st.detaching {
            return false;
        }
        st.detaching = true;
        true
    }

    /// Lets the reaper try again after a detach that was not honored.
    pub(crate) fn abandon_detach(&self) {
        lock(&self.state).detaching = false;
    }

    fn mark_closed(&self) {
        lock(&self.state).closed = true;
    }

    fn release(&self) {
        lock(&self.state).conn = None;
    }

    fn emit(&self, reply: Fcall, target: Option<oneshot::Sender<Fcall>>) {
        if let Some(tx) = target {
            let _ = tx.send(reply);
            return;
        }
        let conn = lock(&self.state).conn.clone();
        match conn {
            Some(conn) => {
                if let Err(e) = conn.send(reply) {
                    debug!(self.log, "dropping reply"; "err" => %e);
                }
            }
            None => trace!(self.log, "no connection bound; dropping reply"),
        }
    }
}

struct Worker {
    sess: Weak<SrvSession>,
    proto: Box<dyn Protocol>,
    cache: ReplyCache,
    authorize: Authorizer,
    log: Logger,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Work>) {
        while let Some(work) = rx.recv().await {
            let sess = match self.sess.upgrade() {
                Some(sess) => sess,
                None => break,
            };

            if let Some(reply) = self.execute(&sess, &work.fcall) {
                sess.emit(reply, work.reply);
            }

            if sess.is_closed() {
                // Refuse new work, then answer whatever is already queued.
                rx.close();
                while let Ok(work) = rx.try_recv() {
                    let reply = work.fcall.rerror(&SessionError::Closed);
                    sess.emit(reply, work.reply);
                }
                sess.release();
                break;
            }
        }
        trace!(self.log, "session worker exiting");
    }

    fn execute(&mut self, sess: &SrvSession, fcall: &Fcall) -> Option<Fcall> {
        if sess.is_closed() {
            return Some(fcall.rerror(&SessionError::Closed));
        }

        match fcall.ty {
            FcallType::Theartbeat => Some(fcall.reply(
                FcallType::Rheartbeat,
                Value::Null,
                Bytes::new(),
            )),
            FcallType::Tdetach => Some(self.detach(sess, fcall)),
            ty => match ty.reply_type() {
                Some(rty) => self.execute_once(fcall, rty),
                None => {
                    let err = SessionError::UnknownMessage(ty as u8);
                    Some(fcall.rerror(&err))
                }
            },
        }
    }

    fn execute_once(&mut self, fcall: &Fcall, rty: FcallType) -> Option<Fcall> {
        let purged = self.cache.advance(fcall.acked);
        if purged > 0 {
            trace!(self.log, "purged acknowledged replies";
                "count" => purged, "low_water" => self.cache.low_water());
        }

        if self.cache.is_stale(fcall.seqno) {
            debug!(self.log, "dropping stale duplicate";
                "seqno" => fcall.seqno);
            return None;
        }

        if let Some(reply) = self.cache.lookup(fcall.seqno) {
            debug!(self.log, "replaying cached reply"; "seqno" => fcall.seqno);
            return Some(reply.clone());
        }

        let reply = match self.proto.dispatch(fcall, &self.log) {
            Ok(r) => fcall.reply(rty, r.payload, r.data),
            Err(e) => {
                debug!(self.log, "request failed";
                    "seqno" => fcall.seqno, "err" => %e);
                fcall.rerror(&e)
            }
        };
        self.cache.insert(reply.clone());
        Some(reply)
    }

    fn detach(&mut self, sess: &SrvSession, fcall: &Fcall) -> Fcall {
        if !(self.authorize)(fcall) {
            warn!(self.log, "ignoring detach from stale proposer";
                "payload" => %fcall.payload);
            sess.abandon_detach();
            let msg = String::from("detach proposer is not the current leader");
            return fcall.rerror(&SessionError::Retry(msg));
        }

        self.proto.detach(sess.sid, &self.log);
        self.cache.clear();
        sess.mark_closed();
        info!(self.log, "session detached");
        fcall.reply(FcallType::Rdetach, Value::Null, Bytes::new())
    }
}

/// Registry of server sessions by id.
///
/// Detached sessions stay in the table as tombstones so that later frames
/// for them fail with `Closed` instead of silently opening a new session.
pub struct SessionTable {
    sessions: Mutex<HashMap<SessionId, Arc<SrvSession>>>,
    newproto: Arc<dyn NewProtocol>,
    authorize: Authorizer,
    log: Logger,
}

impl SessionTable {
    pub fn new(
        newproto: Arc<dyn NewProtocol>,
        authorize: Authorizer,
        log: Option<&Logger>,
    ) -> SessionTable {
        SessionTable {
            sessions: Mutex::new(HashMap::new()),
            newproto,
            authorize,
            log: logger_or_stdlog(log),
        }
    }

    /// `Ok(None)` if `sid` was never seen, `Err(Closed)` if it was detached.
    pub fn lookup(
        &self,
        sid: SessionId,
    ) -> Result<Option<Arc<SrvSession>>, SessionError> {
        match lock(&self.sessions).get(&sid) {
            Some(sess) if sess.is_closed() => Err(SessionError::Closed),
            Some(sess) => Ok(Some(Arc::clone(sess))),
            None => Ok(None),
        }
    }

    pub fn alloc_if_absent(
        &self,
        sid: SessionId,
        client: ClientId,
    ) -> Result<Arc<SrvSession>, SessionError> {
        let mut sessions = lock(&self.sessions);
        if let Some(sess) = sessions.get(&sid) {
            if sess.is_closed() {
                return Err(SessionError::Closed);
            }
            return Ok(Arc::clone(sess));
        }

        info!(self.log, "new session";
            "sid" => sid.as_u64(), "client" => %client);
        let proto = self.newproto.new_protocol(sid, client);
        let sess = SrvSession::spawn(
            sid,
            client,
            proto,
            Arc::clone(&self.authorize),
            &self.log,
        );
        sessions.insert(sid, Arc::clone(&sess));
        Ok(sess)
    }

    /// Unbinds every session whose replies go to the closed connection
    /// `id`. Returns how many were unbound.
    pub fn unbind_conn(&self, id: ConnId) -> usize {
        self.snapshot()
            .into_iter()
            .filter(|sess| sess.unbind(id))
            .count()
    }

    pub fn snapshot(&self) -> Vec<Arc<SrvSession>> {
        lock(&self.sessions).values().cloned().collect()
    }

    /// Drops tombstones of sessions closed and silent for at least `age`.
    pub fn forget_closed(&self, now: Instant, age: Duration) -> usize {
        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|_, sess| {
            !(sess.is_closed()
                && now.saturating_duration_since(sess.last_heard()) >= age)
        });
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::dispatch::Reply;
    use crate::protocol::{Fence, Tmsg};
    use crate::replicate::leader_only;

    struct Counter {
        runs: Arc<AtomicUsize>,
        detached: Arc<AtomicUsize>,
    }

    impl Protocol for Counter {
        fn dispatch(
            &mut self,
            req: &Fcall,
            _log: &Logger,
        ) -> Result<Reply, SessionError> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if req.payload == json!("fail") {
                return Err(SessionError::Remote(String::from("no such file")));
            }
            Ok(Reply::new(json!({ "run": n, "seqno": req.seqno })))
        }

        fn detach(&mut self, _sid: SessionId, _log: &Logger) {
            self.detached.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn table() -> (SessionTable, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let detached = Arc::new(AtomicUsize::new(0));
        let (r, d) = (Arc::clone(&runs), Arc::clone(&detached));
        let newproto = move |_: SessionId, _: ClientId| -> Box<dyn Protocol> {
            Box::new(Counter {
                runs: Arc::clone(&r),
                detached: Arc::clone(&d),
            })
        };
        let log = Logger::root(slog::Discard, o!());
        (
            SessionTable::new(Arc::new(newproto), leader_only(), Some(&log)),
            runs,
            detached,
        )
    }

    fn req(sid: u64, seqno: u64, acked: u64, payload: Value) -> Fcall {
        Fcall::request(
            Tmsg::new(FcallType::Twrite, payload),
            SessionId::new(sid),
            ClientId::new(1),
            seqno,
            acked,
            Fence::default(),
        )
    }

    async fn exec(sess: &SrvSession, fcall: Fcall) -> Fcall {
        sess.execute(fcall).unwrap().await.unwrap()
    }

    #[tokio::test]
    async fn retransmission_is_served_from_cache() {
        let (table, runs, _) = table();
        let sess = table
            .alloc_if_absent(SessionId::new(42), ClientId::new(1))
            .unwrap();

        let first = exec(&sess, req(42, 1, 1, json!("x"))).await;
        let again = exec(&sess, req(42, 1, 1, json!("x"))).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(first.ty, FcallType::Rwrite);
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn errors_are_cached_too() {
        let (table, runs, _) = table();
        let sess = table
            .alloc_if_absent(SessionId::new(5), ClientId::new(1))
            .unwrap();

        let first = exec(&sess, req(5, 1, 1, json!("fail"))).await;
        let again = exec(&sess, req(5, 1, 1, json!("fail"))).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            first.as_error(),
            Some(SessionError::Remote(String::from("no such file")))
        );
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn requests_below_low_water_are_dropped() {
        let (table, runs, _) = table();
        let sess = table
            .alloc_if_absent(SessionId::new(6), ClientId::new(1))
            .unwrap();

        exec(&sess, req(6, 1, 1, json!(1))).await;
        exec(&sess, req(6, 2, 2, json!(2))).await;

        // seqno 1 is below the mark set by seqno 2; no reply, no execution.
        let stale = sess.execute(req(6, 1, 1, json!(1))).unwrap();
        assert!(stale.await.is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn detach_closes_session() {
        let (table, _, detached) = table();
        let sid = SessionId::new(7);
        let sess = table.alloc_if_absent(sid, ClientId::new(1)).unwrap();

        let mut stale = req(7, 0, 0, Value::Null);
        stale.ty = FcallType::Tdetach;
        stale.payload = Tmsg::detach(1, 2).payload;
        let reply = exec(&sess, stale).await;
        assert!(matches!(reply.as_error(), Some(SessionError::Retry(_))));
        assert!(!sess.is_closed());
        assert_eq!(detached.load(Ordering::SeqCst), 0);

        let mut detach = req(7, 0, 0, Value::Null);
        detach.ty = FcallType::Tdetach;
        detach.payload = Tmsg::detach(2, 2).payload;
        let reply = exec(&sess, detach).await;
        assert_eq!(reply.ty, FcallType::Rdetach);
        assert!(sess.is_closed());
        assert_eq!(detached.load(Ordering::SeqCst), 1);

        assert_eq!(table.lookup(sid).err(), Some(SessionError::Closed));
        assert_eq!(
            table.alloc_if_absent(sid, ClientId::new(1)).err(),
            Some(SessionError::Closed)
        );
        assert_eq!(
            sess.submit(req(7, 1, 1, Value::Null)),
            Err(SessionError::Closed)
        );
    }

    #[tokio::test]
    async fn forget_closed_drops_old_tombstones() {
        let (table, _, _) = table();
        let sid = SessionId::new(8);
        let sess = table.alloc_if_absent(sid, ClientId::new(1)).unwrap();
        table
            .alloc_if_absent(SessionId::new(9), ClientId::new(1))
            .unwrap();

        let mut detach = req(8, 0, 0, Value::Null);
        detach.ty = FcallType::Tdetach;
        detach.payload = Tmsg::client_detach().payload;
        exec(&sess, detach).await;

        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(table.forget_closed(later, Duration::from_secs(30)), 1);
        assert_eq!(table.len(), 1);
        assert!(matches!(table.lookup(sid), Ok(None)));
    }
}
