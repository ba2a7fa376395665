// Copyright 2020 Joyent, Inc.

//! Client side of a SigmaP session.
//!
//! A `ClntSession` is a long-lived handle to one logical server, which may
//! be a set of replicas reachable at different addresses. It has at most one
//! live `Conn` at a time. Every request gets the next sequence number and
//! stays in the outstanding map until its reply arrives or the session
//! closes.
//!
//! When the connection breaks, the session redials its address list from
//! the top and resends every outstanding request in ascending sequence
//! number order, so the server's reply cache sees retransmissions in the
//! order they were first issued. If no address answers, every outstanding
//! request fails with `Unreachable` and the session is closed.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connected
//!                     |                           |
//!                     +--------> Closed <---------+
//! ```

use std::cmp;
use std::collections::BTreeMap;
use std::mem;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use slog::{debug, info, o, trace, warn, Logger};
use tokio::sync::oneshot;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::ClntConfig;
use crate::conn::{Conn, ConnId};
use crate::error::SessionError;
use crate::protocol::{ClientId, Fcall, Fence, Seqno, SessionId, Tmsg};
use crate::{lock, logger_or_stdlog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Delay before the first redial after a break; doubles on each further
/// break with no reply in between.
const REDIAL_BASE_DELAY: Duration = Duration::from_millis(10);
const REDIAL_MAX_DELAY: Duration = Duration::from_secs(1);
/// Breaks tolerated without any reply before the session gives up.
const MAX_REDIALS: u32 = 8;

type ReplySlot = oneshot::Sender<Result<Fcall, SessionError>>;

struct Outstanding {
    fcall: Fcall,
    done: Option<ReplySlot>,
}

struct ClntState {
    status: SessionStatus,
    conn: Option<Conn>,
    next_seqno: Seqno,
    outstanding: BTreeMap<Seqno, Outstanding>,
    last_activity: Instant,
    err: Option<SessionError>,
    /// Connection breaks since the last reply.
    redials: u32,
}

/// Returned by `send`; redeem it with `recv`.
pub struct ReplyHandle {
    seqno: Seqno,
    rx: oneshot::Receiver<Result<Fcall, SessionError>>,
}

impl ReplyHandle {
    pub fn seqno(&self) -> Seqno {
        self.seqno
    }
}

pub struct ClntSession {
    sid: SessionId,
    client: ClientId,
    addrs: Vec<SocketAddr>,
    cfg: ClntConfig,
    log: Logger,
    state: Mutex<ClntState>,
    token: CancellationToken,
}

impl ClntSession {
    pub fn new(
        sid: SessionId,
        client: ClientId,
        addrs: Vec<SocketAddr>,
        cfg: ClntConfig,
        log: Option<&Logger>,
    ) -> Arc<ClntSession> {
        let log = logger_or_stdlog(log).new(o!("sid" => sid.as_u64()));
        let sess = Arc::new(ClntSession {
            sid,
            client,
            addrs,
            cfg,
            log,
            state: Mutex::new(ClntState {
                status: SessionStatus::Disconnected,
                conn: None,
                next_seqno: 1,
                outstanding: BTreeMap::new(),
                last_activity: Instant::now(),
                err: None,
                redials: 0,
            }),
            token: CancellationToken::new(),
        });

        if let Some(idle) = sess.cfg.heartbeat_idle() {
            tokio::spawn(heartbeat_loop(
                Arc::downgrade(&sess),
                idle,
                sess.token.clone(),
            ));
        }
        sess
    }

    pub fn sid(&self) -> SessionId {
        self.sid
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.state).status
    }

    pub fn is_closed(&self) -> bool {
        self.status() == SessionStatus::Closed
    }

    pub fn outstanding(&self) -> usize {
        lock(&self.state).outstanding.len()
    }

    /// Stamps `msg` with the next sequence number and queues it. The first
    /// send on a new session starts connecting.
    pub fn send(
        self: &Arc<Self>,
        msg: Tmsg,
        fence: Fence,
    ) -> Result<ReplyHandle, SessionError> {
        let (tx, rx) = oneshot::channel();
        let mut st = lock(&self.state);
        if st.status == SessionStatus::Closed {
            return Err(st.err.clone().unwrap_or(SessionError::Closed));
        }

        let seqno = st.next_seqno;
        st.next_seqno += 1;
        let acked = st.outstanding.keys().next().copied().unwrap_or(seqno);
        let fcall =
            Fcall::request(msg, self.sid, self.client, seqno, acked, fence);
        st.outstanding.insert(
            seqno,
            Outstanding {
                fcall: fcall.clone(),
                done: Some(tx),
            },
        );
        st.last_activity = Instant::now();

        match st.status {
            SessionStatus::Connected => {
                if let Some(conn) = &st.conn {
                    // On failure the close callback resends it.
                    if let Err(e) = conn.send(fcall) {
                        trace!(self.log, "send deferred";
                            "seqno" => seqno, "err" => %e);
                    }
                }
            }
            SessionStatus::Disconnected => {
                st.status = SessionStatus::Connecting;
                self.spawn_establish(Duration::from_millis(0));
            }
            _ => (),
        }

        Ok(ReplyHandle { seqno, rx })
    }

    /// Waits for the reply to `handle`. An `Rerror` reply comes back as the
    /// error it carries.
    pub async fn recv(
        &self,
        handle: ReplyHandle,
    ) -> Result<Fcall, SessionError> {
        let reply = handle.rx.await.map_err(|_| SessionError::Closed)??;
        match reply.as_error() {
            Some(err) => Err(err),
            None => Ok(reply),
        }
    }

    pub async fn rpc(
        self: &Arc<Self>,
        msg: Tmsg,
        fence: Fence,
    ) -> Result<Fcall, SessionError> {
        let handle = self.send(msg, fence)?;
        self.recv(handle).await
    }

    /// Asks the server to end the session, then closes it locally.
    pub async fn detach(self: &Arc<Self>) -> Result<(), SessionError> {
        let res = if self.status() == SessionStatus::Connected {
            self.rpc(Tmsg::client_detach(), Fence::default())
                .await
                .map(|_| ())
        } else {
            Ok(())
        };
        self.close();
        res
    }

    /// Closes the session. Outstanding requests fail with `Closed`. Closing
    /// a closed session does nothing.
    pub fn close(&self) {
        self.close_with(SessionError::Closed);
    }

    /// Breaks the current connection but keeps the session, which then
    /// reconnects and resends.
    pub fn close_conn(&self) {
        let conn = lock(&self.state).conn.clone();
        if let Some(conn) = conn {
            conn.close_with(SessionError::Unreachable(String::from(
                "connection closed by client",
            )));
        }
    }

    fn close_with(&self, err: SessionError) {
        let (conn, waiters) = {
            let mut st = lock(&self.state);
            if st.status == SessionStatus::Closed {
                return;
            }
            st.status = SessionStatus::Closed;
            st.err = Some(err.clone());
            let waiters: Vec<ReplySlot> = mem::take(&mut st.outstanding)
                .into_iter()
                .filter_map(|(_, mut o)| o.done.take())
                .collect();
            (st.conn.take(), waiters)
        };

        info!(self.log, "session closed";
            "err" => %err, "failed" => waiters.len());
        self.token.cancel();
        if let Some(conn) = conn {
            conn.close();
        }
        for done in waiters {
            let _ = done.send(Err(err.clone()));
        }
    }

    fn spawn_establish(self: &Arc<Self>, delay: Duration) {
        let sess = Arc::clone(self);
        tokio::spawn(async move {
            if delay > Duration::from_millis(0) {
                time::sleep(delay).await;
            }
            sess.establish().await
        });
    }

    /// Moves to `Reconnecting` and schedules a redial with backoff, or
    /// closes the session once connections keep breaking without any
    /// reply getting through.
    fn redial(self: &Arc<Self>, mut st: MutexGuard<'_, ClntState>) {
        st.conn = None;
        st.redials += 1;
        if st.redials > MAX_REDIALS {
            let redials = st.redials;
            drop(st);
            let msg = format!("connection broke {} times in a row", redials);
            self.close_with(SessionError::Unreachable(msg));
            return;
        }
        st.status = SessionStatus::Reconnecting;
        let delay = cmp::min(
            REDIAL_BASE_DELAY * 2u32.pow(st.redials - 1),
            REDIAL_MAX_DELAY,
        );
        drop(st);
        trace!(self.log, "redialing"; "delay_ms" => delay.as_millis() as u64);
        self.spawn_establish(delay);
    }

    /// Connect policy: the first address, in list order, that accepts a
    /// connection becomes current.
    async fn establish(self: Arc<Self>) {
        let mut last_err = None;
        for addr in &self.addrs {
            if self.is_closed() {
                return;
            }
            match self.dial(*addr).await {
                Ok(conn) => {
                    self.install(conn);
                    return;
                }
                Err(e) => {
                    debug!(self.log, "connect failed";
                        "addr" => %addr, "err" => %e);
                    last_err = Some(e);
                }
            }
        }

        let msg = match last_err {
            Some(e) => format!("no address answered ({})", e),
            None => String::from("no addresses"),
        };
        warn!(self.log, "session unreachable"; "err" => &msg);
        self.close_with(SessionError::Unreachable(msg));
    }

    async fn dial(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<Conn, SessionError> {
        let on_frame = {
            let sess = Arc::downgrade(self);
            move |_: &Conn, fcall: Fcall| {
                if let Some(sess) = sess.upgrade() {
                    sess.complete(fcall);
                }
            }
        };
        let on_close = {
            let sess = Arc::downgrade(self);
            move |conn: &Conn, reason: SessionError| {
                if let Some(sess) = sess.upgrade() {
                    sess.conn_broken(conn.id(), reason);
                }
            }
        };
        Conn::connect(
            addr,
            self.cfg.connect_timeout(),
            &self.log,
            self.token.child_token(),
            on_frame,
            on_close,
        )
        .await
    }

    /// Makes `conn` current and resends everything outstanding in sequence
    /// number order.
    fn install(self: &Arc<Self>, conn: Conn) {
        let mut st = lock(&self.state);
        if st.status == SessionStatus::Closed {
            drop(st);
            conn.close();
            return;
        }
        if conn.is_closed() {
            // Broke before it was current, so its close callback was
            // ignored.
            self.redial(st);
            return;
        }

        info!(self.log, "connected";
            "conn" => conn.id(),
            "peer" => conn.peer().map(|p| p.to_string()),
            "resend" => st.outstanding.len());
        for o in st.outstanding.values() {
            if conn.send(o.fcall.clone()).is_err() {
                break;
            }
        }
        st.status = SessionStatus::Connected;
        st.conn = Some(conn);
        st.last_activity = Instant::now();
    }

    fn conn_broken(self: &Arc<Self>, id: ConnId, reason: SessionError) {
        let mut st = lock(&self.state);
        let current = st.conn.as_ref().map(Conn::id) == Some(id);
        if !current || st.status != SessionStatus::Connected {
            return;
        }
        warn!(self.log, "connection broken, reconnecting";
            "conn" => id, "err" => %reason,
            "outstanding" => st.outstanding.len());
        self.redial(st);
    }

    /// Delivers a reply to its waiter. Replies matching nothing outstanding
    /// belong to a request already completed or failed and are dropped.
    fn complete(&self, reply: Fcall) {
        let done = {
            let mut st = lock(&self.state);
            st.last_activity = Instant::now();
            if reply.session != self.sid {
                debug!(self.log, "reply for another session";
                    "other" => reply.session.as_u64());
                return;
            }
            st.redials = 0;
            match st.outstanding.remove(&reply.seqno) {
                Some(mut o) => o.done.take(),
                None => {
                    trace!(self.log, "dropping unmatched reply";
                        "seqno" => reply.seqno);
                    return;
                }
            }
        };

        let closed = reply.as_error() == Some(SessionError::Closed);
        if let Some(done) = done {
            let _ = done.send(Ok(reply));
        }
        if closed {
            // The server no longer knows this session.
            self.close_with(SessionError::Closed);
        }
    }

    fn idle_for(&self, now: Instant) -> Option<Duration> {
        let st = lock(&self.state);
        if st.status != SessionStatus::Connected {
            return None;
        }
        Some(now.saturating_duration_since(st.last_activity))
    }
}

impl Drop for ClntSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn heartbeat_loop(
    sess: Weak<ClntSession>,
    idle: Duration,
    token: CancellationToken,
) {
    let period = cmp::max(idle / 2, Duration::from_millis(1));
    let mut ticker = time::interval(period);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let sess = match sess.upgrade() {
                    Some(sess) => sess,
                    None => break,
                };
                match sess.idle_for(Instant::now()) {
                    Some(quiet) if quiet >= idle => (),
                    _ => continue,
                }
                trace!(sess.log, "sending heartbeat");
                // The reply only refreshes activity; nobody waits on it.
                let hb = Tmsg::heartbeat(&[sess.sid]);
                if sess.send(hb, Fence::default()).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use serde_json::json;
    use tokio::net::TcpListener;

    use crate::protocol::FcallType;

    async fn dead_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn session(addrs: Vec<SocketAddr>) -> Arc<ClntSession> {
        let log = Logger::root(slog::Discard, o!());
        let cfg = ClntConfig {
            connect_timeout_ms: 500,
            heartbeat_idle_ms: None,
        };
        ClntSession::new(
            SessionId::new(11),
            ClientId::new(12),
            addrs,
            cfg,
            Some(&log),
        )
    }

    #[tokio::test]
    async fn unreachable_fails_outstanding_and_closes() {
        let sess = session(vec![dead_addr().await, dead_addr().await]);
        let first = sess
            .send(Tmsg::new(FcallType::Tattach, json!({})), Fence::default())
            .unwrap();
        assert_eq!(first.seqno(), 1);
        let second = sess
            .send(Tmsg::new(FcallType::Twalk, json!({})), Fence::default())
            .unwrap();
        assert_eq!(second.seqno(), 2);

        assert!(sess.recv(first).await.unwrap_err().is_unreachable());
        assert!(sess.recv(second).await.unwrap_err().is_unreachable());
        assert_eq!(sess.status(), SessionStatus::Closed);
        assert_eq!(sess.outstanding(), 0);

        // Later sends report why the session died.
        let err = sess
            .send(Tmsg::new(FcallType::Twalk, json!({})), Fence::default())
            .err()
            .unwrap();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let sess = session(vec![dead_addr().await]);
        sess.close();
        sess.close();
        sess.close_conn();
        assert_eq!(sess.status(), SessionStatus::Closed);
        assert_eq!(
            sess.send(Tmsg::new(FcallType::Tread, json!(0)), Fence::default())
                .err(),
            Some(SessionError::Closed)
        );
        assert!(sess.detach().await.is_ok());
    }

    #[tokio::test]
    async fn gives_up_when_connections_keep_dropping() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let sess = session(vec![addr]);
        let handle = sess
            .send(Tmsg::new(FcallType::Twalk, json!({})), Fence::default())
            .unwrap();
        let res = time::timeout(Duration::from_secs(10), sess.recv(handle))
            .await
            .expect("redial loop never gave up");
        assert!(res.unwrap_err().is_unreachable());
        assert_eq!(sess.status(), SessionStatus::Closed);
    }
}
