use bytes::Bytes;
use std::fmt;

/// Identity of a voice destination (e.g. a guild's voice channel).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DestinationId(String);

impl DestinationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DestinationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DestinationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// What to play and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    /// Opaque source reference handed to the fetch tool.
    pub source: String,
    pub destination: DestinationId,
}

impl MediaRequest {
    pub fn new(source: impl Into<String>, destination: impl Into<DestinationId>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

/// A complete codec frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Bytes,
    /// Zero-based position in the reassembled stream.
    pub index: u64,
}

impl Packet {
    pub fn new(index: u64, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            index,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_displays_its_id() {
        let id = DestinationId::from("guild/42");
        assert_eq!(id.to_string(), "guild/42");
        assert_eq!(id.as_str(), "guild/42");
    }

    #[test]
    fn request_converts_destination() {
        let request = MediaRequest::new("song", "room");
        assert_eq!(request.destination, DestinationId::new("room"));
    }
}
