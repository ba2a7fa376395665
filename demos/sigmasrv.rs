// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex};

use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use slog::{debug, info, o, Drain, Logger};
use tokio::net::TcpListener;

use sigmap_session::config::SrvConfig;
use sigmap_session::dispatch::{Protocol, Reply};
use sigmap_session::protocol::{ClientId, Fcall, FcallType, SessionId};
use sigmap_session::server::SessionSrv;
use sigmap_session::SessionError;

type Store = Arc<Mutex<HashMap<String, Value>>>;

#[derive(Serialize, Deserialize)]
struct WritePayload {
    path: String,
    value: Value,
}

#[derive(Serialize, Deserialize)]
struct ReadPayload {
    path: String,
}

/// A flat key/value namespace shared by all sessions.
struct KvProtocol {
    store: Store,
    writes: u64,
}

fn bad_payload(ty: FcallType) -> SessionError {
    SessionError::Remote(format!("malformed {:?} payload", ty))
}

impl Protocol for KvProtocol {
    fn dispatch(
        &mut self,
        req: &Fcall,
        log: &Logger,
    ) -> Result<Reply, SessionError> {
        match req.ty {
            FcallType::Tattach => Ok(Reply::new(json!({ "root": "/" }))),
            FcallType::Twalk => Ok(Reply::new(req.payload.clone())),
            FcallType::Twrite => {
                let p: WritePayload =
                    serde_json::from_value(req.payload.clone())
                        .map_err(|_| bad_payload(req.ty))?;
                debug!(log, "handling write"; "path" => &p.path);
                let mut store = self.store.lock().unwrap();
                store.insert(p.path, p.value);
                self.writes += 1;
                Ok(Reply::new(json!({ "writes": self.writes })))
            }
            FcallType::Tread => {
                let p: ReadPayload =
                    serde_json::from_value(req.payload.clone())
                        .map_err(|_| bad_payload(req.ty))?;
                let store = self.store.lock().unwrap();
                match store.get(&p.path) {
                    Some(v) => Ok(Reply::new(v.clone())),
                    None => Err(SessionError::Remote(format!(
                        "{}: file not found",
                        p.path
                    ))),
                }
            }
            _ => Err(SessionError::UnknownMessage(req.ty as u8)),
        }
    }

    fn detach(&mut self, sid: SessionId, log: &Logger) {
        info!(log, "session detached"; "sid" => sid.as_u64(),
            "writes" => self.writes);
    }
}

#[tokio::main]
async fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let addr = env::args().nth(1).unwrap_or("127.0.0.1:2040".to_string());
    let cfg = match env::args().nth(2) {
        Some(json) => serde_json::from_str(&json).expect("bad server config"),
        None => SrvConfig::default(),
    };

    let store: Store = Arc::new(Mutex::new(HashMap::new()));
    let newproto = move |_: SessionId, _: ClientId| -> Box<dyn Protocol> {
        Box::new(KvProtocol {
            store: Arc::clone(&store),
            writes: 0,
        })
    };

    let listener = TcpListener::bind(&addr).await.expect("failed to bind");
    let srv = Arc::new(SessionSrv::new(cfg, newproto, Some(&root_log)));
    srv.serve(listener).await;
}
