//! Gearman binary protocol: packet model, framing, unique-id composite.
//!
//! Every frame is a 12-byte header — 4 magic bytes (`\0REQ` client to
//! server, `\0RES` server to client), a big-endian i32 packet type, a
//! big-endian i32 body length — followed by the body: NUL-separated string
//! fields with the final field (usually an opaque payload) allowed to
//! contain NULs.

pub const HEADER_LEN: usize = 12;

const REQ_MAGIC: [u8; 4] = *b"\0REQ";
const RES_MAGIC: [u8; 4] = *b"\0RES";

// Refuse absurd frames before allocating for them.
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Frame direction; decides which magic is written and accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Request,
    Response,
}

impl Magic {
    fn bytes(self) -> [u8; 4] {
        match self {
            Magic::Request => REQ_MAGIC,
            Magic::Response => RES_MAGIC,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacketType {
    CanDo,
    CantDo,
    ResetAbilities,
    PreSleep,
    Noop,
    SubmitJob,
    JobCreated,
    GrabJob,
    NoJob,
    JobAssign,
    WorkComplete,
    WorkFail,
    EchoReq,
    EchoRes,
    SubmitJobBg,
    Error,
    SubmitJobHigh,
    GrabJobUniq,
    JobAssignUniq,
    SubmitJobHighBg,
    SubmitJobLow,
    SubmitJobLowBg,
    GrabJobAll,
    JobAssignAll,
}

impl PacketType {
    pub fn code(self) -> i32 {
        match self {
            PacketType::CanDo => 1,
            PacketType::CantDo => 2,
            PacketType::ResetAbilities => 3,
            PacketType::PreSleep => 4,
            PacketType::Noop => 6,
            PacketType::SubmitJob => 7,
            PacketType::JobCreated => 8,
            PacketType::GrabJob => 9,
            PacketType::NoJob => 10,
            PacketType::JobAssign => 11,
            PacketType::WorkComplete => 13,
            PacketType::WorkFail => 14,
            PacketType::EchoReq => 16,
            PacketType::EchoRes => 17,
            PacketType::SubmitJobBg => 18,
            PacketType::Error => 19,
            PacketType::SubmitJobHigh => 21,
            PacketType::GrabJobUniq => 30,
            PacketType::JobAssignUniq => 31,
            PacketType::SubmitJobHighBg => 32,
            PacketType::SubmitJobLow => 33,
            PacketType::SubmitJobLowBg => 34,
            PacketType::GrabJobAll => 39,
            PacketType::JobAssignAll => 40,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => PacketType::CanDo,
            2 => PacketType::CantDo,
            3 => PacketType::ResetAbilities,
            4 => PacketType::PreSleep,
            6 => PacketType::Noop,
            7 => PacketType::SubmitJob,
            8 => PacketType::JobCreated,
            9 => PacketType::GrabJob,
            10 => PacketType::NoJob,
            11 => PacketType::JobAssign,
            13 => PacketType::WorkComplete,
            14 => PacketType::WorkFail,
            16 => PacketType::EchoReq,
            17 => PacketType::EchoRes,
            18 => PacketType::SubmitJobBg,
            19 => PacketType::Error,
            21 => PacketType::SubmitJobHigh,
            30 => PacketType::GrabJobUniq,
            31 => PacketType::JobAssignUniq,
            32 => PacketType::SubmitJobHighBg,
            33 => PacketType::SubmitJobLow,
            34 => PacketType::SubmitJobLowBg,
            39 => PacketType::GrabJobAll,
            40 => PacketType::JobAssignAll,
            _ => return None,
        })
    }

    /// Number of NUL-separated fields in this packet's body.
    fn arg_count(self) -> usize {
        match self {
            PacketType::ResetAbilities
            | PacketType::PreSleep
            | PacketType::Noop
            | PacketType::GrabJob
            | PacketType::NoJob
            | PacketType::GrabJobUniq
            | PacketType::GrabJobAll => 0,
            PacketType::CanDo
            | PacketType::CantDo
            | PacketType::JobCreated
            | PacketType::WorkFail
            | PacketType::EchoReq
            | PacketType::EchoRes => 1,
            PacketType::WorkComplete | PacketType::Error => 2,
            PacketType::SubmitJob
            | PacketType::SubmitJobBg
            | PacketType::SubmitJobHigh
            | PacketType::SubmitJobHighBg
            | PacketType::SubmitJobLow
            | PacketType::SubmitJobLowBg
            | PacketType::JobAssign => 3,
            PacketType::JobAssignUniq => 4,
            PacketType::JobAssignAll => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DecodeError {
    BadMagic([u8; 4]),
    UnknownType(i32),
    /// Body length field is negative or beyond the sanity cap.
    BadLength(i64),
    /// Body does not contain the separators this packet type requires.
    MissingFields(PacketType),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::BadMagic(magic) => write!(f, "bad frame magic {magic:?}"),
            DecodeError::UnknownType(code) => write!(f, "unknown packet type {code}"),
            DecodeError::BadLength(len) => write!(f, "unreasonable body length {len}"),
            DecodeError::MissingFields(kind) => {
                write!(f, "body of {kind:?} is missing required fields")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub args: Vec<Vec<u8>>,
}

impl Packet {
    pub fn new(kind: PacketType, args: Vec<Vec<u8>>) -> Self {
        Self { kind, args }
    }

    /// Field accessor; absent fields read as empty.
    pub fn arg(&self, index: usize) -> &[u8] {
        self.args.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn encode(&self, magic: Magic) -> Vec<u8> {
        let body_len: usize = self.args.iter().map(Vec::len).sum::<usize>()
            + self.args.len().saturating_sub(1);
        let mut frame = Vec::with_capacity(HEADER_LEN + body_len);
        frame.extend_from_slice(&magic.bytes());
        frame.extend_from_slice(&self.kind.code().to_be_bytes());
        frame.extend_from_slice(&(body_len as u32).to_be_bytes());
        for (index, arg) in self.args.iter().enumerate() {
            if index > 0 {
                frame.push(0);
            }
            frame.extend_from_slice(arg);
        }
        frame
    }

    /// Decode a body whose header was already validated.
    pub fn decode(kind: PacketType, body: &[u8]) -> Result<Self, DecodeError> {
        let count = kind.arg_count();
        if count == 0 {
            return Ok(Packet::new(kind, Vec::new()));
        }

        let mut args = Vec::with_capacity(count);
        let mut rest = body;
        for _ in 0..count - 1 {
            let nul = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or(DecodeError::MissingFields(kind))?;
            args.push(rest[..nul].to_vec());
            rest = &rest[nul + 1..];
        }
        // The final field takes the remainder; it may itself contain NULs.
        args.push(rest.to_vec());
        Ok(Packet::new(kind, args))
    }
}

/// Validate a frame header, returning the packet type and body length.
pub fn decode_header(header: &[u8; HEADER_LEN], magic: Magic) -> Result<(PacketType, usize), DecodeError> {
    let mut found = [0u8; 4];
    found.copy_from_slice(&header[..4]);
    if found != magic.bytes() {
        return Err(DecodeError::BadMagic(found));
    }

    let code = i32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let kind = PacketType::from_code(code).ok_or(DecodeError::UnknownType(code))?;

    let len = i32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    if len < 0 || len as usize > MAX_BODY_LEN {
        return Err(DecodeError::BadLength(len as i64));
    }
    Ok((kind, len as usize))
}

/// The composite unique-id field: `correlation` or `correlation|batch_key`,
/// with literal `|` percent-escaped as `%7C` inside either component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueId {
    pub correlation: String,
    pub batch_key: Option<String>,
}

impl UniqueId {
    pub fn new(correlation: impl Into<String>) -> Self {
        Self {
            correlation: correlation.into(),
            batch_key: None,
        }
    }

    pub fn with_batch_key(self, batch_key: impl Into<String>) -> Self {
        Self {
            batch_key: Some(batch_key.into()),
            ..self
        }
    }

    pub fn encode(&self) -> String {
        match &self.batch_key {
            None => escape(&self.correlation),
            Some(key) => format!("{}|{}", escape(&self.correlation), escape(key)),
        }
    }

    pub fn decode(raw: &str) -> Self {
        match raw.split_once('|') {
            Some((correlation, batch_key)) => Self {
                correlation: unescape(correlation),
                batch_key: Some(unescape(batch_key)),
            },
            None => Self {
                correlation: unescape(raw),
                batch_key: None,
            },
        }
    }
}

fn escape(component: &str) -> String {
    component.replace('|', "%7C")
}

fn unescape(component: &str) -> String {
    component.replace("%7C", "|")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: &Packet, magic: Magic) -> Packet {
        let frame = packet.encode(magic);
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&frame[..HEADER_LEN]);
        let (kind, len) = decode_header(&header, magic).expect("header");
        assert_eq!(frame.len(), HEADER_LEN + len);
        Packet::decode(kind, &frame[HEADER_LEN..]).expect("body")
    }

    #[test]
    fn submit_frame_roundtrips() {
        let packet = Packet::new(
            PacketType::SubmitJob,
            vec![b"resize".to_vec(), b"c1".to_vec(), b"payload".to_vec()],
        );
        assert_eq!(roundtrip(&packet, Magic::Request), packet);
    }

    #[test]
    fn zero_field_frame_has_empty_body() {
        let packet = Packet::new(PacketType::GrabJobUniq, Vec::new());
        let frame = packet.encode(Magic::Request);
        assert_eq!(frame.len(), HEADER_LEN);
        assert_eq!(roundtrip(&packet, Magic::Request), packet);
    }

    #[test]
    fn final_field_may_contain_nuls() {
        let payload = b"a\0b\0c".to_vec();
        let packet = Packet::new(
            PacketType::JobAssign,
            vec![b"H:1".to_vec(), b"resize".to_vec(), payload.clone()],
        );
        let decoded = roundtrip(&packet, Magic::Response);
        assert_eq!(decoded.arg(2), payload.as_slice());
    }

    #[test]
    fn header_layout_is_big_endian() {
        let packet = Packet::new(PacketType::Noop, Vec::new());
        let frame = packet.encode(Magic::Response);
        assert_eq!(&frame[..4], b"\0RES");
        assert_eq!(&frame[4..8], &6i32.to_be_bytes());
        assert_eq!(&frame[8..12], &0i32.to_be_bytes());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let packet = Packet::new(PacketType::Noop, Vec::new());
        let frame = packet.encode(Magic::Request);
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&frame[..HEADER_LEN]);
        assert!(matches!(
            decode_header(&header, Magic::Response),
            Err(DecodeError::BadMagic(_))
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(b"\0RES");
        header[4..8].copy_from_slice(&99i32.to_be_bytes());
        assert_eq!(
            decode_header(&header, Magic::Response),
            Err(DecodeError::UnknownType(99))
        );
    }

    #[test]
    fn missing_separator_is_rejected() {
        // WORK_COMPLETE needs a NUL between handle and payload.
        let err = Packet::decode(PacketType::WorkComplete, b"justonefield").unwrap_err();
        assert_eq!(err, DecodeError::MissingFields(PacketType::WorkComplete));
    }

    #[test]
    fn unique_id_roundtrips_plain() {
        let id = UniqueId::new("order-17");
        assert_eq!(id.encode(), "order-17");
        assert_eq!(UniqueId::decode("order-17"), id);
    }

    #[test]
    fn unique_id_roundtrips_with_batch_key() {
        let id = UniqueId::new("order-17").with_batch_key("tenant-4");
        assert_eq!(id.encode(), "order-17|tenant-4");
        assert_eq!(UniqueId::decode("order-17|tenant-4"), id);
    }

    #[test]
    fn pipes_inside_components_are_escaped() {
        let id = UniqueId::new("a|b").with_batch_key("c|d");
        let raw = id.encode();
        assert_eq!(raw, "a%7Cb|c%7Cd");
        assert_eq!(UniqueId::decode(&raw), id);

        let keyless = UniqueId::new("x|y");
        assert_eq!(UniqueId::decode(&keyless.encode()), keyless);
    }
}
