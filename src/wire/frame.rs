//! Wire codec: `<len:u32 big-endian><metadata:json-line "\n"><payload:bytes>`.
//!
//! The PHY prepends `snr_db` to the metadata of every frame it delivers to
//! the app; frames the app sends to the PHY for broadcast leave `snr_db`
//! unset (the PHY fills it in for the *receiving* side only).

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::utils::{ErrorKind, VRaftError};

/// Message kind, carried in frame metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgKind {
    #[serde(rename = "REQUEST_VOTE")]
    RequestVote,
    #[serde(rename = "VOTE")]
    Vote,
    #[serde(rename = "APPEND")]
    Append,
    #[serde(rename = "APPEND_ACK")]
    AppendAck,
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "SNR_REPORT")]
    SnrReport,
    #[serde(rename = "GAIN_CMD")]
    GainCmd,
    #[serde(rename = "EXP_BEGIN")]
    ExpBegin,
    #[serde(rename = "EXP_END")]
    ExpEnd,
}

impl MsgKind {
    fn as_str(&self) -> &'static str {
        match self {
            MsgKind::RequestVote => "REQUEST_VOTE",
            MsgKind::Vote => "VOTE",
            MsgKind::Append => "APPEND",
            MsgKind::AppendAck => "APPEND_ACK",
            MsgKind::Heartbeat => "HEARTBEAT",
            MsgKind::SnrReport => "SNR_REPORT",
            MsgKind::GainCmd => "GAIN_CMD",
            MsgKind::ExpBegin => "EXP_BEGIN",
            MsgKind::ExpEnd => "EXP_END",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "REQUEST_VOTE" => Some(MsgKind::RequestVote),
            "VOTE" => Some(MsgKind::Vote),
            "APPEND" => Some(MsgKind::Append),
            "APPEND_ACK" => Some(MsgKind::AppendAck),
            "HEARTBEAT" => Some(MsgKind::Heartbeat),
            "SNR_REPORT" => Some(MsgKind::SnrReport),
            "GAIN_CMD" => Some(MsgKind::GainCmd),
            "EXP_BEGIN" => Some(MsgKind::ExpBegin),
            "EXP_END" => Some(MsgKind::ExpEnd),
            _ => None,
        }
    }
}

/// Destination: either a single node id or the broadcast sentinel. The PHY
/// is authoritative for broadcast delivery; the core never tracks peer
/// addresses for transmission, it only stamps this field for receivers to
/// filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dest {
    Broadcast,
    Node(u8),
}

impl Serialize for Dest {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Dest::Broadcast => s.serialize_str("broadcast"),
            Dest::Node(id) => s.serialize_u8(*id),
        }
    }
}

struct DestVisitor;

impl<'de> Visitor<'de> for DestVisitor {
    type Value = Dest;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("the string \"broadcast\" or a node id integer")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Dest, E> {
        if v == "broadcast" {
            Ok(Dest::Broadcast)
        } else {
            Err(de::Error::custom(format!("unknown dst string '{}'", v)))
        }
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Dest, E> {
        Ok(Dest::Node(v as u8))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Dest, E> {
        Ok(Dest::Node(v as u8))
    }
}

impl<'de> Deserialize<'de> for Dest {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Dest, D::Error> {
        d.deserialize_any(DestVisitor)
    }
}

/// Per-frame metadata preceding the payload on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMeta {
    pub src: u8,
    pub dst: Dest,
    pub term: u64,
    pub kind: MsgKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub round_id: Option<u64>,
    /// Estimated SNR in dB, stamped by the PHY on ingress; absent on egress.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub snr_db: Option<f32>,
}

impl FrameMeta {
    pub fn new(src: u8, dst: Dest, term: u64, kind: MsgKind) -> Self {
        FrameMeta {
            src,
            dst,
            term,
            kind,
            round_id: None,
            snr_db: None,
        }
    }

    pub fn with_round(mut self, round_id: u64) -> Self {
        self.round_id = Some(round_id);
        self
    }
}

/// A decoded (or about-to-be-encoded) application frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub meta: FrameMeta,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(meta: FrameMeta, payload: Vec<u8>) -> Self {
        Frame { meta, payload }
    }

    /// Serializes to `<len:u32 be><meta-json>\n<payload>`.
    pub fn encode(&self) -> Result<Vec<u8>, VRaftError> {
        let meta_json = serde_json::to_vec(&self.meta)?;
        let body_len = (meta_json.len() + 1 + self.payload.len()) as u32;

        let mut buf = Vec::with_capacity(4 + body_len as usize);
        buf.extend_from_slice(&body_len.to_be_bytes());
        buf.extend_from_slice(&meta_json);
        buf.push(b'\n');
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes a frame off the wire. Malformed input yields a `Decode`-kind
    /// `VRaftError`; callers drop the frame and continue per the design
    /// doc's error taxonomy — this function never panics on bad input.
    pub fn decode(buf: &[u8]) -> Result<Frame, VRaftError> {
        if buf.len() < 4 {
            return Err(decode_err("FrameTooShort: missing length prefix"));
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let body = &buf[4..];
        if body.len() != len {
            return Err(decode_err(format!(
                "BadLength: header says {} but body has {} bytes",
                len,
                body.len()
            )));
        }

        let nl = body
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| decode_err("BadJson: no metadata terminator"))?;
        let meta_bytes = &body[..nl];
        let payload = body[nl + 1..].to_vec();

        // Parse to a generic value first so an unrecognized `kind` maps to
        // UnknownKind rather than a generic BadJson.
        let value: serde_json::Value = serde_json::from_slice(meta_bytes)
            .map_err(|e| decode_err(format!("BadJson: {}", e)))?;
        if let Some(kind_str) = value.get("kind").and_then(|k| k.as_str()) {
            if MsgKind::from_str(kind_str).is_none() {
                return Err(decode_err(format!(
                    "UnknownKind: '{}'",
                    kind_str
                )));
            }
        } else {
            return Err(decode_err("BadJson: missing 'kind' field"));
        }

        let meta: FrameMeta = serde_json::from_value(value)
            .map_err(|e| decode_err(format!("BadJson: {}", e)))?;

        Ok(Frame { meta, payload })
    }
}

fn decode_err(msg: impl Into<String>) -> VRaftError {
    VRaftError::of(ErrorKind::Decode, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        let meta = FrameMeta::new(2, Dest::Broadcast, 7, MsgKind::Heartbeat)
            .with_round(42);
        Frame::new(meta, b"hello".to_vec())
    }

    #[test]
    fn round_trip() {
        let f = sample_frame();
        let encoded = f.encode().unwrap();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, f);
    }

    #[test]
    fn dst_node_round_trip() {
        let meta = FrameMeta::new(1, Dest::Node(3), 1, MsgKind::Vote);
        let f = Frame::new(meta, vec![]);
        let encoded = f.encode().unwrap();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.meta.dst, Dest::Node(3));
    }

    #[test]
    fn frame_too_short() {
        let err = Frame::decode(&[0, 1]).unwrap_err();
        assert!(format!("{}", err).contains("FrameTooShort"));
    }

    #[test]
    fn bad_length() {
        let mut buf = sample_frame().encode().unwrap();
        buf[3] = 0xFF; // corrupt the length prefix
        let err = Frame::decode(&buf).unwrap_err();
        assert!(format!("{}", err).contains("BadLength"));
    }

    #[test]
    fn bad_json() {
        let mut buf = 5u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"{not json\n");
        let err = Frame::decode(&buf).unwrap_err();
        assert!(format!("{}", err).contains("BadJson"));
    }

    #[test]
    fn unknown_kind() {
        let body = b"{\"src\":1,\"dst\":\"broadcast\",\"term\":0,\"kind\":\"BOGUS\"}\n";
        let mut buf = (body.len() as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(body);
        let err = Frame::decode(&buf).unwrap_err();
        assert!(format!("{}", err).contains("UnknownKind"));
    }

    #[test]
    fn ground_truth_never_serialized() {
        // FrameMeta has no ground_truth field at all -- the type system
        // enforces information-hiding at compile time, not just by omission.
        let json = serde_json::to_string(&sample_frame().meta).unwrap();
        assert!(!json.contains("ground_truth"));
    }
}
