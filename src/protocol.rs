// Copyright 2020 Joyent, Inc.

//! SigmaP envelope ("Fcall") and its length-prefixed frame codec.

use std::fmt;
use std::io;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use crc16::{State, ARC};
use num::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ErrKind, RerrorPayload, SessionError};

const FP_LEN_SZ: usize = 0x4;

// Offsets relative to the end of the length prefix.
const FP_OFF_VERSION: usize = 0x0;
const FP_OFF_TYPE: usize = 0x1;
const FP_OFF_SESSION: usize = 0x2;
const FP_OFF_CLIENT: usize = 0xa;
const FP_OFF_SEQNO: usize = 0x12;
const FP_OFF_ACKED: usize = 0x1a;
const FP_OFF_TAG: usize = 0x22;
const FP_OFF_FENCELEN: usize = 0x24;
const FP_OFF_FENCE: usize = 0x26;

/// Smallest possible frame body: fixed header, empty fence, crc and the two
/// inner length words.
const FP_MIN_BODY_SZ: usize = FP_OFF_FENCE + 4 + 4 + 4;

/// Frames claiming a larger body than this are rejected without buffering.
pub const FP_MAX_FRAME_SZ: usize = 64 * 1024 * 1024;

const FP_VERSION_1: u8 = 0x1;
const FP_VERSION_CURRENT: u8 = FP_VERSION_1;

pub type Seqno = u64;
pub type Tag = u16;

/// Identifies one logical client/server session across reconnects.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        SessionId(id)
    }

    /// A fresh non-zero session id.
    pub fn random() -> Self {
        SessionId(rand::random::<u64>() | 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the principal issuing requests. Outlives any one session.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        ClientId(id)
    }

    pub fn random() -> Self {
        ClientId(rand::random::<u64>() | 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Opaque consistency token. Carried, never interpreted, by the session
/// layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fence(Bytes);

impl Fence {
    pub fn new<B: Into<Bytes>>(b: B) -> Self {
        Fence(b.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    num_derive::FromPrimitive,
    num_derive::ToPrimitive,
)]
pub enum FcallType {
    Theartbeat = 1,
    Rheartbeat = 2,
    Tdetach = 3,
    Rdetach = 4,
    Tattach = 5,
    Rattach = 6,
    Twalk = 7,
    Rwalk = 8,
    Topen = 9,
    Ropen = 10,
    Tcreate = 11,
    Rcreate = 12,
    Tread = 13,
    Rread = 14,
    Twrite = 15,
    Rwrite = 16,
    Tclunk = 17,
    Rclunk = 18,
    Rerror = 19,
}

impl FcallType {
    pub fn is_request(self) -> bool {
        self.reply_type().is_some()
    }

    /// The reply type answering this request type, or `None` for reply
    /// types.
    pub fn reply_type(self) -> Option<FcallType> {
        match self {
            FcallType::Rerror => None,
            t => {
                let code = ToPrimitive::to_u8(&t)?;
                if code % 2 == 1 {
                    FromPrimitive::from_u8(code + 1)
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum FcallParseError {
    #[error("not enough bytes: need {0}")]
    NotEnoughBytes(usize),
    #[error("bad frame: {0}")]
    BadFrame(String),
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("I/O error: {0}")]
    IOError(#[from] io::Error),
}

impl From<FcallParseError> for SessionError {
    fn from(err: FcallParseError) -> Self {
        match err {
            FcallParseError::NotEnoughBytes(n) => {
                SessionError::BadFrame(format!("truncated frame, need {}", n))
            }
            FcallParseError::BadFrame(msg) => SessionError::BadFrame(msg),
            FcallParseError::UnknownType(t) => SessionError::UnknownMessage(t),
            FcallParseError::IOError(e) => {
                SessionError::Unreachable(e.to_string())
            }
        }
    }
}

/// The application-level part of a request, before the session stamps it.
#[derive(Debug, Clone, PartialEq)]
pub struct Tmsg {
    pub ty: FcallType,
    pub payload: Value,
    pub data: Bytes,
}

impl Tmsg {
    pub fn new(ty: FcallType, payload: Value) -> Self {
        Tmsg {
            ty,
            payload,
            data: Bytes::new(),
        }
    }

    pub fn with_data<B: Into<Bytes>>(mut self, data: B) -> Self {
        self.data = data.into();
        self
    }

    pub fn heartbeat(sids: &[SessionId]) -> Self {
        let req = HeartbeatReq {
            sids: sids.iter().map(|s| s.as_u64()).collect(),
        };
        Tmsg::new(FcallType::Theartbeat, to_payload(&req))
    }

    /// A detach proposed by replica `proposer` while it believed `leader`
    /// was the leader.
    pub fn detach(proposer: u64, leader: u64) -> Self {
        Tmsg::new(
            FcallType::Tdetach,
            to_payload(&DetachReq { proposer, leader }),
        )
    }

    /// A detach asked for by the client itself. It carries
    /// `CLIENT_PROPOSER` as both proposer and leader; an `Authorizer` must
    /// accept that pair (see `DetachReq::from_client`), since a client's
    /// own request to end its session is never stale.
    pub fn client_detach() -> Self {
        Tmsg::detach(CLIENT_PROPOSER, CLIENT_PROPOSER)
    }
}

/// Proposer id used by detaches that come from the client rather than from
/// a replica's reaper. Replicated deployments give their replicas non-zero
/// ids.
pub const CLIENT_PROPOSER: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReq {
    pub sids: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachReq {
    pub proposer: u64,
    pub leader: u64,
}

impl DetachReq {
    pub fn from_client(&self) -> bool {
        self.proposer == CLIENT_PROPOSER && self.leader == CLIENT_PROPOSER
    }
}

fn to_payload<T: serde::Serialize>(v: &T) -> Value {
    // Plain structs of integers always serialize.
    serde_json::to_value(v).unwrap_or(Value::Null)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fcall {
    pub ty: FcallType,
    pub session: SessionId,
    pub client: ClientId,
    pub seqno: Seqno,
    pub acked: Seqno,
    pub tag: Tag,
    pub fence: Fence,
    pub payload: Value,
    pub data: Bytes,
}

impl Fcall {
    pub fn request(
        msg: Tmsg,
        session: SessionId,
        client: ClientId,
        seqno: Seqno,
        acked: Seqno,
        fence: Fence,
    ) -> Fcall {
        Fcall {
            ty: msg.ty,
            session,
            client,
            seqno,
            acked,
            tag: seqno as Tag,
            fence,
            payload: msg.payload,
            data: msg.data,
        }
    }

    /// Builds the reply to this request, echoing its correlation fields.
    pub fn reply(&self, ty: FcallType, payload: Value, data: Bytes) -> Fcall {
        Fcall {
            ty,
            session: self.session,
            client: self.client,
            seqno: self.seqno,
            acked: self.acked,
            tag: self.tag,
            fence: self.fence.clone(),
            payload,
            data,
        }
    }

    pub fn rerror(&self, err: &SessionError) -> Fcall {
        let payload = RerrorPayload {
            kind: err.kind(),
            msg: err.to_string(),
        };
        self.reply(FcallType::Rerror, to_payload(&payload), Bytes::new())
    }

    /// Decodes an `Rerror` reply back into the error it carries.
    pub fn as_error(&self) -> Option<SessionError> {
        if self.ty != FcallType::Rerror {
            return None;
        }
        let err = match serde_json::from_value::<RerrorPayload>(
            self.payload.clone(),
        ) {
            Ok(p) => SessionError::from_wire(p.kind, p.msg),
            Err(_) => SessionError::from_wire(
                ErrKind::Other,
                String::from("malformed error reply"),
            ),
        };
        Some(err)
    }

    pub fn detach_req(&self) -> Result<DetachReq, SessionError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            SessionError::BadFrame(format!("bad detach payload: {}", e))
        })
    }

    /// Parses one complete frame, including its length prefix.
    pub fn parse(buf: &[u8]) -> Result<Fcall, FcallParseError> {
        let frame_len = Fcall::check_buffer_size(buf)?;
        let body = &buf[FP_LEN_SZ..frame_len];

        if body.len() < FP_MIN_BODY_SZ {
            let msg = format!("frame body too short ({} bytes)", body.len());
            return Err(FcallParseError::BadFrame(msg));
        }
        if body[FP_OFF_VERSION] != FP_VERSION_CURRENT {
            let msg = format!("unsupported version {}", body[FP_OFF_VERSION]);
            return Err(FcallParseError::BadFrame(msg));
        }
        let ty = FromPrimitive::from_u8(body[FP_OFF_TYPE])
            .ok_or(FcallParseError::UnknownType(body[FP_OFF_TYPE]))?;
        let session = SessionId(BigEndian::read_u64(
            &body[FP_OFF_SESSION..FP_OFF_CLIENT],
        ));
        let client =
            ClientId(BigEndian::read_u64(&body[FP_OFF_CLIENT..FP_OFF_SEQNO]));
        let seqno = BigEndian::read_u64(&body[FP_OFF_SEQNO..FP_OFF_ACKED]);
        let acked = BigEndian::read_u64(&body[FP_OFF_ACKED..FP_OFF_TAG]);
        let tag = BigEndian::read_u16(&body[FP_OFF_TAG..FP_OFF_FENCELEN]);
        let fence_len =
            BigEndian::read_u16(&body[FP_OFF_FENCELEN..FP_OFF_FENCE]) as usize;

        let mut off = FP_OFF_FENCE;
        let fence = take(body, &mut off, fence_len, "fence")?;
        let crc = BigEndian::read_u32(take(body, &mut off, 4, "crc")?);
        let plen = BigEndian::read_u32(take(body, &mut off, 4, "plen")?);
        let payload = take(body, &mut off, plen as usize, "payload")?;
        let dlen = BigEndian::read_u32(take(body, &mut off, 4, "dlen")?);
        let data = take(body, &mut off, dlen as usize, "data")?;
        if off != body.len() {
            let msg = format!("{} trailing bytes", body.len() - off);
            return Err(FcallParseError::BadFrame(msg));
        }

        Fcall::validate_crc(payload, data, crc)?;
        let payload = Fcall::parse_payload(payload)?;

        Ok(Fcall {
            ty,
            session,
            client,
            seqno,
            acked,
            tag,
            fence: Fence(Bytes::copy_from_slice(fence)),
            payload,
            data: Bytes::copy_from_slice(data),
        })
    }

    /// Returns the total frame size once `buf` holds all of it.
    fn check_buffer_size(buf: &[u8]) -> Result<usize, FcallParseError> {
        if buf.len() < FP_LEN_SZ {
            return Err(FcallParseError::NotEnoughBytes(FP_LEN_SZ));
        }
        let body_len = BigEndian::read_u32(&buf[..FP_LEN_SZ]) as usize;
        if body_len > FP_MAX_FRAME_SZ {
            let msg = format!("frame length {} exceeds maximum", body_len);
            return Err(FcallParseError::BadFrame(msg));
        }
        let frame_len = FP_LEN_SZ + body_len;
        if buf.len() < frame_len {
            Err(FcallParseError::NotEnoughBytes(frame_len))
        } else {
            Ok(frame_len)
        }
    }

    fn validate_crc(
        payload: &[u8],
        data: &[u8],
        crc: u32,
    ) -> Result<(), FcallParseError> {
        let calculated = frame_crc(payload, data);
        if crc != calculated {
            let msg = format!(
                "calculated CRC {:#x} does not match provided CRC {:#x}",
                calculated, crc
            );
            Err(FcallParseError::BadFrame(msg))
        } else {
            Ok(())
        }
    }

    fn parse_payload(buf: &[u8]) -> Result<Value, FcallParseError> {
        serde_json::from_slice(buf).map_err(|e| {
            let msg = format!("failed to parse payload as JSON: {}", e);
            FcallParseError::BadFrame(msg)
        })
    }
}

fn take<'a>(
    body: &'a [u8],
    off: &mut usize,
    n: usize,
    what: &str,
) -> Result<&'a [u8], FcallParseError> {
    let end = off.checked_add(n).filter(|end| *end <= body.len());
    match end {
        Some(end) => {
            let s = &body[*off..end];
            *off = end;
            Ok(s)
        }
        None => {
            let msg = format!("{} overruns frame", what);
            Err(FcallParseError::BadFrame(msg))
        }
    }
}

fn frame_crc(payload: &[u8], data: &[u8]) -> u32 {
    let mut state = State::<ARC>::new();
    state.update(payload);
    state.update(data);
    u32::from(state.get())
}

pub fn encode_fcall(
    fcall: &Fcall,
    buf: &mut BytesMut,
) -> Result<(), FcallParseError> {
    let ty = ToPrimitive::to_u8(&fcall.ty).ok_or_else(|| {
        FcallParseError::BadFrame(String::from("invalid message type"))
    })?;
    if fcall.fence.0.len() > usize::from(u16::MAX) {
        let msg = String::from("fence too large");
        return Err(FcallParseError::BadFrame(msg));
    }
    let payload = serde_json::to_vec(&fcall.payload).map_err(|e| {
        FcallParseError::BadFrame(format!("failed to encode payload: {}", e))
    })?;

    let body_len = FP_MIN_BODY_SZ
        + fcall.fence.0.len()
        + payload.len()
        + fcall.data.len();
    if body_len > FP_MAX_FRAME_SZ {
        let msg = format!("frame length {} exceeds maximum", body_len);
        return Err(FcallParseError::BadFrame(msg));
    }

    buf.reserve(FP_LEN_SZ + body_len);
    buf.put_u32(body_len as u32);
    buf.put_u8(FP_VERSION_CURRENT);
    buf.put_u8(ty);
    buf.put_u64(fcall.session.0);
    buf.put_u64(fcall.client.0);
    buf.put_u64(fcall.seqno);
    buf.put_u64(fcall.acked);
    buf.put_u16(fcall.tag);
    buf.put_u16(fcall.fence.0.len() as u16);
    buf.put_slice(&fcall.fence.0);
    buf.put_u32(frame_crc(&payload, &fcall.data));
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    buf.put_u32(fcall.data.len() as u32);
    buf.put_slice(&fcall.data);
    Ok(())
}

/// Frame codec for `tokio_util::codec::Framed`.
pub struct SigmaRpc;

impl Decoder for SigmaRpc {
    type Item = Fcall;
    type Error = FcallParseError;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, FcallParseError> {
        match Fcall::check_buffer_size(buf) {
            Ok(frame_len) => {
                let frame = buf.split_to(frame_len);
                Fcall::parse(&frame).map(Some)
            }
            Err(FcallParseError::NotEnoughBytes(n)) => {
                buf.reserve(n - buf.len());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Encoder<Fcall> for SigmaRpc {
    type Error = FcallParseError;

    fn encode(
        &mut self,
        item: Fcall,
        buf: &mut BytesMut,
    ) -> Result<(), FcallParseError> {
        encode_fcall(&item, buf)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::{quickcheck, Arbitrary, Gen};
    use serde_json::json;

    const ALL_TYPES: [FcallType; 19] = [
        FcallType::Theartbeat,
        FcallType::Rheartbeat,
        FcallType::Tdetach,
        FcallType::Rdetach,
        FcallType::Tattach,
        FcallType::Rattach,
        FcallType::Twalk,
        FcallType::Rwalk,
        FcallType::Topen,
        FcallType::Ropen,
        FcallType::Tcreate,
        FcallType::Rcreate,
        FcallType::Tread,
        FcallType::Rread,
        FcallType::Twrite,
        FcallType::Rwrite,
        FcallType::Tclunk,
        FcallType::Rclunk,
        FcallType::Rerror,
    ];

    impl Arbitrary for Fcall {
        fn arbitrary(g: &mut Gen) -> Self {
            let ty = *g.choose(&ALL_TYPES).unwrap_or(&FcallType::Twalk);
            let payload = match u8::arbitrary(g) % 3 {
                0 => Value::Null,
                1 => json!({ "name": String::arbitrary(g) }),
                _ => json!([u64::arbitrary(g), bool::arbitrary(g)]),
            };
            Fcall {
                ty,
                session: SessionId(u64::arbitrary(g)),
                client: ClientId(u64::arbitrary(g)),
                seqno: u64::arbitrary(g),
                acked: u64::arbitrary(g),
                tag: u16::arbitrary(g),
                fence: Fence::new(Vec::<u8>::arbitrary(g)),
                payload,
                data: Bytes::from(Vec::<u8>::arbitrary(g)),
            }
        }
    }

    fn encode(fcall: &Fcall) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_fcall(fcall, &mut buf).expect("encode");
        buf
    }

    fn sample() -> Fcall {
        Fcall::request(
            Tmsg::new(FcallType::Twalk, json!({"path": ["a", "b"]}))
                .with_data(&b"raw"[..]),
            SessionId::new(42),
            ClientId::new(7),
            3,
            1,
            Fence::new(&b"epoch-9"[..]),
        )
    }

    quickcheck! {
        fn prop_decode_encoded_frame(fcall: Fcall) -> bool {
            let mut buf = encode(&fcall);
            match SigmaRpc.decode(&mut buf) {
                Ok(Some(decoded)) => decoded == fcall && buf.is_empty(),
                _ => false,
            }
        }

        fn prop_strict_prefix_needs_more(fcall: Fcall, cut: usize) -> bool {
            let full = encode(&fcall);
            let cut = cut % full.len();
            let mut buf = BytesMut::from(&full[..cut]);
            matches!(SigmaRpc.decode(&mut buf), Ok(None)) && buf.len() == cut
        }
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let first = sample();
        let mut second = sample();
        second.seqno = 4;
        second.tag = 4;

        let mut buf = encode(&first);
        buf.extend_from_slice(&encode(&second));

        assert_eq!(SigmaRpc.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(SigmaRpc.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(SigmaRpc.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn rejects_oversized_length() {
        let mut buf = BytesMut::new();
        buf.put_u32((FP_MAX_FRAME_SZ + 1) as u32);
        match SigmaRpc.decode(&mut buf) {
            Err(FcallParseError::BadFrame(_)) => (),
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_type() {
        let mut buf = encode(&sample());
        buf[FP_LEN_SZ + FP_OFF_TYPE] = 0xee;
        match SigmaRpc.decode(&mut buf) {
            Err(FcallParseError::UnknownType(0xee)) => (),
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn rejects_corrupt_payload() {
        let mut buf = encode(&sample());
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        match SigmaRpc.decode(&mut buf) {
            Err(FcallParseError::BadFrame(msg)) => {
                assert!(msg.contains("CRC"), "{}", msg)
            }
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn reply_types() {
        assert_eq!(
            FcallType::Twalk.reply_type(),
            Some(FcallType::Rwalk)
        );
        assert_eq!(
            FcallType::Theartbeat.reply_type(),
            Some(FcallType::Rheartbeat)
        );
        assert_eq!(FcallType::Rwalk.reply_type(), None);
        assert_eq!(FcallType::Rerror.reply_type(), None);
        assert!(FcallType::Tdetach.is_request());
        assert!(!FcallType::Rdetach.is_request());
    }

    #[test]
    fn rerror_carries_error() {
        let req = sample();
        let reply = req.rerror(&SessionError::Closed);
        assert_eq!(reply.seqno, req.seqno);
        assert_eq!(reply.tag, req.tag);
        assert_eq!(reply.as_error(), Some(SessionError::Closed));
        assert_eq!(req.as_error(), None);
    }
}
