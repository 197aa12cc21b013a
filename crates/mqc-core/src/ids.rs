use thiserror::Error;

pub const CLAIM_ID_MASK: i64 = 0x63c9_a59c;
pub const MESSAGE_ID_MASK: i64 = 0x5c69_3a53;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed id: {0:?}")]
pub struct MalformedId(pub String);

/// Converts between internal row ids and the opaque ids handed to callers.
pub trait IdCodec {
    fn encode(&self, id: i64) -> String;
    fn decode(&self, encoded: &str) -> Result<i64, MalformedId>;
}

/// Lowercase hex of the row id XOR a fixed mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HexMaskCodec {
    mask: i64,
}

impl HexMaskCodec {
    pub const fn new(mask: i64) -> Self {
        Self { mask }
    }

    pub const fn claims() -> Self {
        Self::new(CLAIM_ID_MASK)
    }

    pub const fn messages() -> Self {
        Self::new(MESSAGE_ID_MASK)
    }
}

impl IdCodec for HexMaskCodec {
    fn encode(&self, id: i64) -> String {
        format!("{:x}", id ^ self.mask)
    }

    fn decode(&self, encoded: &str) -> Result<i64, MalformedId> {
        let malformed = || MalformedId(encoded.to_string());
        if encoded.is_empty()
            || encoded.len() > 16
            || !encoded.bytes().all(|byte| byte.is_ascii_hexdigit())
        {
            return Err(malformed());
        }
        let raw = u64::from_str_radix(encoded, 16).map_err(|_| malformed())?;
        let raw = i64::try_from(raw).map_err(|_| malformed())?;
        Ok(raw ^ self.mask)
    }
}
