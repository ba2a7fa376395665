// Copyright 2020 Joyent, Inc.

//! One TCP socket carrying SigmaP frames.
//!
//! A `Conn` owns a reader task and a writer task. `send` only enqueues; the
//! writer drains the queue onto the socket. Any read or write failure
//! closes the connection exactly once, and the `on_close` callback given at
//! spawn time is then invoked exactly once with the reason. Closing a
//! connection never touches session state: that is left to the owner of the
//! callbacks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use slog::{debug, error, o, trace, warn, Logger};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;
use crate::lock;
use crate::protocol::{Fcall, SigmaRpc};

pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    id: ConnId,
    peer: Option<SocketAddr>,
    tx: mpsc::UnboundedSender<Fcall>,
    reason: Mutex<Option<SessionError>>,
    token: CancellationToken,
}

impl Conn {
    /// Dials `addr` and spawns the connection's tasks. Cancelling `token`
    /// closes the connection.
    pub async fn connect<F, C>(
        addr: SocketAddr,
        timeout: Duration,
        log: &Logger,
        token: CancellationToken,
        on_frame: F,
        on_close: C,
    ) -> Result<Conn, SessionError>
    where
        F: FnMut(&Conn, Fcall) + Send + 'static,
        C: FnOnce(&Conn, SessionError) + Send + 'static,
    {
        let dial = time::timeout(timeout, TcpStream::connect(addr));
        let stream = match dial.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let msg = format!("{}: {}", addr, e);
                return Err(SessionError::Unreachable(msg));
            }
            Err(_) => {
                let msg = format!("{}: connect timed out", addr);
                return Err(SessionError::Unreachable(msg));
            }
        };
        Ok(Conn::spawn(stream, log, token, on_frame, on_close))
    }

    pub fn spawn<F, C>(
        stream: TcpStream,
        log: &Logger,
        token: CancellationToken,
        on_frame: F,
        on_close: C,
    ) -> Conn
    where
        F: FnMut(&Conn, Fcall) + Send + 'static,
        C: FnOnce(&Conn, SessionError) + Send + 'static,
    {
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(log, "failed to set TCP_NODELAY"; "err" => %e);
        }
        let peer_str =
            peer.map_or_else(|| String::from("-"), |p| p.to_string());
        let log = log.new(o!("conn" => id, "peer" => peer_str));

        let (rd, wr) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Conn {
            inner: Arc::new(ConnInner {
                id,
                peer,
                tx,
                reason: Mutex::new(None),
                token,
            }),
        };

        tokio::spawn(read_loop(
            conn.clone(),
            FramedRead::new(rd, SigmaRpc),
            on_frame,
            log.clone(),
        ));
        tokio::spawn(write_loop(
            conn.clone(),
            FramedWrite::new(wr, SigmaRpc),
            rx,
            log.clone(),
        ));

        let closed = conn.clone();
        tokio::spawn(async move {
            closed.inner.token.cancelled().await;
            let reason = closed.reason();
            debug!(log, "connection closed"; "reason" => %reason);
            on_close(&closed, reason);
        });

        conn
    }

    pub fn id(&self) -> ConnId {
        self.inner.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// Queues `fcall` for the writer. Delivery is best effort; a failed
    /// write closes the connection.
    pub fn send(&self, fcall: Fcall) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.inner.tx.send(fcall).map_err(|_| SessionError::Closed)
    }

    pub fn close(&self) {
        self.close_with(SessionError::Closed);
    }

    /// Closes the connection, recording `reason` if this is the first
    /// close. Returns false if it was already closed.
    pub fn close_with(&self, reason: SessionError) -> bool {
        let mut slot = lock(&self.inner.reason);
        if self.inner.token.is_cancelled() {
            return false;
        }
        *slot = Some(reason);
        self.inner.token.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    fn reason(&self) -> SessionError {
        lock(&self.inner.reason)
            .clone()
            .unwrap_or(SessionError::Closed)
    }
}

async fn read_loop<F>(
    conn: Conn,
    mut stream: FramedRead<OwnedReadHalf, SigmaRpc>,
    mut on_frame: F,
    log: Logger,
) where
    F: FnMut(&Conn, Fcall) + Send + 'static,
{
    loop {
        tokio::select! {
            _ = conn.inner.token.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(fcall)) => {
                    trace!(log, "recv"; "type" => ?fcall.ty,
                        "sid" => fcall.session.as_u64(),
                        "seqno" => fcall.seqno);
                    on_frame(&conn, fcall);
                }
                Some(Err(e)) => {
                    error!(log, "failed to read frame"; "err" => %e);
                    conn.close_with(SessionError::from(e));
                    break;
                }
                None => {
                    debug!(log, "peer closed connection");
                    let msg = String::from("connection closed by peer");
                    conn.close_with(SessionError::Unreachable(msg));
                    break;
                }
            }
        }
    }
}

async fn write_loop(
    conn: Conn,
    mut sink: FramedWrite<OwnedWriteHalf, SigmaRpc>,
    mut rx: mpsc::UnboundedReceiver<Fcall>,
    log: Logger,
) {
    loop {
        tokio::select! {
            _ = conn.inner.token.cancelled() => break,
            next = rx.recv() => match next {
                Some(fcall) => {
                    trace!(log, "send"; "type" => ?fcall.ty,
                        "sid" => fcall.session.as_u64(),
                        "seqno" => fcall.seqno);
                    if let Err(e) = sink.send(fcall).await {
                        warn!(log, "failed to write frame"; "err" => %e);
                        let msg = e.to_string();
                        conn.close_with(SessionError::Unreachable(msg));
                        break;
                    }
                }
                None => break,
            }
        }
    }
    if let Err(e) = sink.close().await {
        trace!(log, "error shutting down socket"; "err" => %e);
    }
}
