use {
    borsh::BorshDeserialize,
    serde::{
        Deserialize,
        Deserializer,
        Serialize,
        Serializer,
    },
    std::{
        fmt,
        str::FromStr,
    },
    thiserror::Error,
};

/// Unix timestamp in seconds.
pub type UnixTimestamp = i64;

/// Identifier of a single price feed. Rendered as 64 lowercase hex characters
/// without a leading `0x`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, BorshDeserialize)]
pub struct PriceId([u8; 32]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PriceIdError {
    #[error("price id must be 64 lowercase hex characters, optionally prefixed with 0x: {0:?}")]
    Malformed(String),
}

impl PriceId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex form with a leading `0x`, as Hermes and the EVM contracts expect it.
    pub fn to_prefixed_hex(&self) -> String {
        format!("0x{self}")
    }
}

impl FromStr for PriceId {
    type Err = PriceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let well_formed = digits.len() == 64
            && digits
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(PriceIdError::Malformed(s.to_string()));
        }

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|_| PriceIdError::Malformed(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for PriceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for PriceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PriceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A point-in-time observation of a price feed, either from the source or
/// from a target chain. `price` and `conf` share the feed's exponent.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PriceInfo {
    pub price:        i64,
    pub conf:         u64,
    pub publish_time: UnixTimestamp,
}
