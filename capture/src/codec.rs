use base64::engine::general_purpose;
use base64::Engine;

use crate::error::CodecError;
use crate::event::EventRecord;

/// Turns records into stored values and back. `decode(encode(x)) == x` is the
/// only requirement; an encryption-at-rest codec can replace these without the
/// rest of the pipeline noticing.
pub trait Codec: Send + Sync {
    fn encode(&self, record: &EventRecord) -> Result<String, CodecError>;
    fn decode(&self, encoded: &str) -> Result<EventRecord, CodecError>;
}

/// Plain JSON, handy when inspecting the store by hand.
#[derive(Clone, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, record: &EventRecord) -> Result<String, CodecError> {
        Ok(serde_json::to_string(record)?)
    }

    fn decode(&self, encoded: &str) -> Result<EventRecord, CodecError> {
        Ok(serde_json::from_str(encoded)?)
    }
}

/// JSON wrapped in standard base64. This is an encoding, not a security control.
#[derive(Clone, Default)]
pub struct Base64JsonCodec;

impl Codec for Base64JsonCodec {
    fn encode(&self, record: &EventRecord) -> Result<String, CodecError> {
        let json = serde_json::to_vec(record)?;
        Ok(general_purpose::STANDARD.encode(json))
    }

    fn decode(&self, encoded: &str) -> Result<EventRecord, CodecError> {
        let bytes = general_purpose::STANDARD.decode(encoded)?;
        let json = String::from_utf8(bytes)?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum CodecKind {
    Base64Json,
    Json,
}

impl CodecKind {
    pub fn build(&self) -> Box<dyn Codec> {
        match self {
            CodecKind::Base64Json => Box::new(Base64JsonCodec),
            CodecKind::Json => Box::new(JsonCodec),
        }
    }
}

impl std::str::FromStr for CodecKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "base64_json" | "base64" => Ok(CodecKind::Base64Json),
            "json" => Ok(CodecKind::Json),
            _ => Err(format!("Unknown store codec: {s}")),
        }
    }
}
