//! Edits, the unit records of the log.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Globally unique identifier of a single edit.
///
/// Ids are 16 random bytes. They identify an edit across replicas regardless
/// of the index it was appended at.
#[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct EditId([u8; 16]);

impl EditId {
    /// Create a new random id.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Create an `EditId` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Bytes of the id.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Convert the id to a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Convert to a hex string limited to the first 5 bytes for a friendly
    /// string representation of the id.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl fmt::Debug for EditId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EditId({})", self.to_hex())
    }
}

impl fmt::Display for EditId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for EditId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| anyhow::anyhow!("invalid hex"))?;
        Ok(Self(bytes))
    }
}

impl From<[u8; 16]> for EditId {
    fn from(value: [u8; 16]) -> Self {
        Self(value)
    }
}

impl From<EditId> for [u8; 16] {
    fn from(value: EditId) -> Self {
        value.0
    }
}

impl Serialize for EditId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for EditId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            let bytes = <[u8; 16]>::deserialize(deserializer)?;
            Ok(Self(bytes))
        }
    }
}

/// A single record of the log.
///
/// The payload is opaque to this crate. Equality of two edits compares the id
/// and the payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edit {
    id: EditId,
    payload: Bytes,
}

impl Edit {
    /// Create an edit with a fresh random id.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: EditId::generate(),
            payload: payload.into(),
        }
    }

    /// Create an edit with the given id.
    ///
    /// Use this when the edit was created elsewhere, e.g. received from
    /// another replica.
    pub fn with_id(id: EditId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    /// The id of this edit.
    pub fn id(&self) -> EditId {
        self.id
    }

    /// The payload of this edit.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display_parse_roundtrip() {
        for i in 0..20u8 {
            let id = EditId::from_bytes([i; 16]);
            let text = id.to_string();
            let id1 = text.parse::<EditId>().unwrap();
            assert_eq!(id, id1);
        }
    }

    #[test]
    fn test_id_generate_unique() {
        let a = EditId::generate();
        let b = EditId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_id_postcard() {
        let id = EditId::from_bytes([7u8; 16]);
        let ser = postcard::to_stdvec(&id).unwrap();
        assert_eq!(ser.len(), 16);
        let de: EditId = postcard::from_bytes(&ser).unwrap();
        assert_eq!(id, de);
    }

    #[test]
    fn test_id_json() {
        let id = EditId::from_bytes([0xab; 16]);
        let ser = serde_json::to_string(&id).unwrap();
        assert_eq!(ser, "\"abababababababababababababababab\"");
        let de: EditId = serde_json::from_str(&ser).unwrap();
        assert_eq!(id, de);
    }

    #[test]
    fn test_edit_postcard() {
        let edit = Edit::new(&b"open file"[..]);
        let ser = postcard::to_stdvec(&edit).unwrap();
        let de: Edit = postcard::from_bytes(&ser).unwrap();
        assert_eq!(edit, de);
    }
}
