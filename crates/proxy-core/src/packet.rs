//! Classifier: tags a raw datagram as a text, tank, or raw frame and
//! extracts the semantic fields the relay's interception rules key on.

use byteorder::{ByteOrder, LittleEndian};

use crate::tank::{TankPacket, PACKET_CALL_FUNCTION, PACKET_DISCONNECT, TANK_HEADER_LEN};
use crate::text::TextRecord;
use crate::variant::VariantList;

pub const MSG_UNKNOWN: u32 = 0;
pub const MSG_SERVER_HELLO: u32 = 1;
pub const MSG_GENERIC_TEXT: u32 = 2;
pub const MSG_GAME_MESSAGE: u32 = 3;
pub const MSG_GAME_PACKET: u32 = 4;

/// Semantic tag derived from a frame; not itself on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketId {
    ServerHello,
    Quit,
    QuitToExit,
    JoinRequest,
    ValidateWorld,
    Input,
    Log,
    Disconnect,
    OnSendToServer,
    OnSpawn,
    OnRemove,
    OnNameChanged,
    OnChangeSkin,
    Unknown,
}

fn action_id(action: &str) -> PacketId {
    match action {
        "quit" => PacketId::Quit,
        "quit_to_exit" => PacketId::QuitToExit,
        "join_request" => PacketId::JoinRequest,
        "validate_world" => PacketId::ValidateWorld,
        "input" => PacketId::Input,
        "log" => PacketId::Log,
        _ => PacketId::Unknown,
    }
}

fn function_id(function: &str) -> PacketId {
    match function {
        "OnSendToServer" => PacketId::OnSendToServer,
        "OnSpawn" => PacketId::OnSpawn,
        "OnRemove" => PacketId::OnRemove,
        "OnNameChanged" => PacketId::OnNameChanged,
        "OnChangeSkin" => PacketId::OnChangeSkin,
        _ => PacketId::Unknown,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextPacket {
    pub kind: u32,
    /// Raw UTF-8 body after the message-type word, NUL excluded.
    pub text: String,
    pub record: TextRecord,
    /// For `Input` frames: the `text` key's first value, falling back to
    /// the second token of the first empty-key record.
    pub input_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TankFrame {
    pub packet: TankPacket,
    /// Decoded argument list of a `CALL_FUNCTION` packet; `None` when the
    /// extra buffer did not decode (the frame is forwarded untouched).
    pub variants: Option<VariantList>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    Text(TextPacket),
    Tank(TankFrame),
    Raw,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub id: PacketId,
    pub body: PacketBody,
    pub trailing_nul: bool,
}

impl Classified {
    pub fn as_text(&self) -> Option<&TextPacket> {
        match &self.body {
            PacketBody::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_tank(&self) -> Option<&TankFrame> {
        match &self.body {
            PacketBody::Tank(tank) => Some(tank),
            _ => None,
        }
    }
}

/// Emits a text frame: message-type word, UTF-8 body, trailing NUL.
pub fn encode_text_frame(kind: u32, text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + text.len() + 1);
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(text.as_bytes());
    out.push(0);
    out
}

/// Strips at most one trailing NUL, reads the leading message-type word,
/// and dispatches on it. Anything that does not parse cleanly is tagged
/// `Raw`/`Unknown` and will pass through the relay untouched.
pub fn classify(raw: &[u8]) -> Classified {
    let trailing_nul = raw.last() == Some(&0);
    let stripped = if trailing_nul {
        &raw[..raw.len() - 1]
    } else {
        raw
    };

    if stripped.len() < 4 {
        return Classified {
            id: PacketId::Unknown,
            body: PacketBody::Raw,
            trailing_nul,
        };
    }

    let kind = LittleEndian::read_u32(&stripped[..4]);
    match kind {
        MSG_SERVER_HELLO | MSG_GENERIC_TEXT | MSG_GAME_MESSAGE => {
            classify_text(kind, &stripped[4..], trailing_nul)
        }
        MSG_GAME_PACKET => classify_tank(stripped, trailing_nul),
        _ => Classified {
            id: PacketId::Unknown,
            body: PacketBody::Raw,
            trailing_nul,
        },
    }
}

fn classify_text(kind: u32, body: &[u8], trailing_nul: bool) -> Classified {
    let Ok(text) = std::str::from_utf8(body) else {
        return Classified {
            id: PacketId::Unknown,
            body: PacketBody::Raw,
            trailing_nul,
        };
    };
    let record = TextRecord::parse(text);

    let id = if kind == MSG_SERVER_HELLO {
        PacketId::ServerHello
    } else {
        action_id(record.get("action", 0))
    };

    let input_text = if id == PacketId::Input {
        if record.contains("text") {
            Some(record.get("text", 0).to_string())
        } else {
            record
                .iter()
                .find(|(key, values)| key.is_empty() && !values.is_empty())
                .map(|(_, values)| values[0].clone())
        }
    } else {
        None
    };

    Classified {
        id,
        body: PacketBody::Text(TextPacket {
            kind,
            text: text.to_string(),
            record,
            input_text,
        }),
        trailing_nul,
    }
}

fn classify_tank(stripped: &[u8], trailing_nul: bool) -> Classified {
    if stripped.len() < TANK_HEADER_LEN {
        return Classified {
            id: PacketId::Unknown,
            body: PacketBody::Raw,
            trailing_nul,
        };
    }
    let Ok(packet) = TankPacket::parse(stripped, trailing_nul) else {
        return Classified {
            id: PacketId::Unknown,
            body: PacketBody::Raw,
            trailing_nul,
        };
    };

    let mut id = PacketId::Unknown;
    let mut variants = None;
    match packet.header.packet_type {
        PACKET_DISCONNECT => id = PacketId::Disconnect,
        PACKET_CALL_FUNCTION => {
            if let Ok(list) = VariantList::decode(&packet.extra) {
                if let Some(function) = list.function_name() {
                    id = function_id(function);
                }
                variants = Some(list);
            }
        }
        _ => {}
    }

    Classified {
        id,
        body: PacketBody::Tank(TankFrame { packet, variants }),
        trailing_nul,
    }
}
