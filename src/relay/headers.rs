//! Opus-in-Ogg header packets.
//!
//! The first two packets of an Opus stream are `OpusHead` and `OpusTags`.
//! They describe the stream but are not audio, so they never go to the sink.

use crate::relay::types::Packet;

pub const OPUS_HEAD_MAGIC: &[u8; 8] = b"OpusHead";
pub const OPUS_TAGS_MAGIC: &[u8; 8] = b"OpusTags";

/// Identification header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpusHead {
    pub version: u8,
    pub channels: u8,
    pub pre_skip: u16,
    pub input_sample_rate: u32,
    /// Q7.8 dB.
    pub output_gain: i16,
    pub mapping_family: u8,
}

impl OpusHead {
    pub const MIN_LEN: usize = 19;

    /// Parses an identification header, or `None` if `data` is not one.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::MIN_LEN || !data.starts_with(OPUS_HEAD_MAGIC) {
            return None;
        }
        Some(Self {
            version: data[8],
            channels: data[9],
            pre_skip: u16::from_le_bytes([data[10], data[11]]),
            input_sample_rate: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
            output_gain: i16::from_le_bytes([data[16], data[17]]),
            mapping_family: data[18],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    ExpectHead,
    ExpectTags,
    Audio,
}

/// Drops the leading header packets of an Opus stream.
///
/// When the first packet is not `OpusHead` the stream is treated as raw
/// audio and everything passes through.
#[derive(Debug, Clone)]
pub struct HeaderFilter {
    enabled: bool,
    stage: Stage,
    head: Option<OpusHead>,
    dropped: u64,
}

impl HeaderFilter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            stage: Stage::ExpectHead,
            head: None,
            dropped: 0,
        }
    }

    /// The stream's identification header, once seen.
    pub fn head(&self) -> Option<&OpusHead> {
        self.head.as_ref()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Returns whether `packet` should be forwarded.
    pub fn accept(&mut self, packet: &Packet) -> bool {
        if !self.enabled {
            return true;
        }
        match self.stage {
            Stage::ExpectHead => match OpusHead::parse(&packet.data) {
                Some(head) => {
                    tracing::debug!(
                        version = head.version,
                        channels = head.channels,
                        pre_skip = head.pre_skip,
                        input_sample_rate = head.input_sample_rate,
                        output_gain = head.output_gain,
                        mapping_family = head.mapping_family,
                        "Opus identification header"
                    );
                    self.head = Some(head);
                    self.stage = Stage::ExpectTags;
                    self.dropped += 1;
                    false
                }
                None => {
                    tracing::debug!("stream has no OpusHead, passing packets through");
                    self.stage = Stage::Audio;
                    true
                }
            },
            Stage::ExpectTags => {
                self.stage = Stage::Audio;
                if packet.data.starts_with(OPUS_TAGS_MAGIC) {
                    tracing::debug!(bytes = packet.len(), "skipping OpusTags");
                    self.dropped += 1;
                    false
                } else {
                    tracing::warn!("OpusHead not followed by OpusTags");
                    true
                }
            }
            Stage::Audio => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opus_head() -> Vec<u8> {
        let mut head = OPUS_HEAD_MAGIC.to_vec();
        head.push(1);
        head.push(2);
        head.extend_from_slice(&312u16.to_le_bytes());
        head.extend_from_slice(&44100u32.to_le_bytes());
        head.extend_from_slice(&(-256i16).to_le_bytes());
        head.push(0);
        head
    }

    #[test]
    fn parses_identification_header() {
        let head = OpusHead::parse(&opus_head()).unwrap();
        assert_eq!(
            head,
            OpusHead {
                version: 1,
                channels: 2,
                pre_skip: 312,
                input_sample_rate: 44100,
                output_gain: -256,
                mapping_family: 0,
            }
        );
    }

    #[test]
    fn short_or_foreign_packets_are_not_headers() {
        assert!(OpusHead::parse(&opus_head()[..18]).is_none());
        assert!(OpusHead::parse(b"OpusTagsxxxxxxxxxxxxxxx").is_none());
    }

    #[test]
    fn filter_drops_head_and_tags() {
        let mut filter = HeaderFilter::new(true);
        let mut tags = OPUS_TAGS_MAGIC.to_vec();
        tags.extend_from_slice(b"vendor");

        assert!(!filter.accept(&Packet::new(0, opus_head())));
        assert!(!filter.accept(&Packet::new(1, tags)));
        assert!(filter.accept(&Packet::new(2, b"audio".to_vec())));
        assert_eq!(filter.dropped(), 2);
        assert_eq!(filter.head().map(|h| h.channels), Some(2));
    }

    #[test]
    fn filter_passes_streams_without_head() {
        let mut filter = HeaderFilter::new(true);
        assert!(filter.accept(&Packet::new(0, b"audio".to_vec())));
        assert!(filter.accept(&Packet::new(1, OPUS_TAGS_MAGIC.to_vec())));
        assert_eq!(filter.dropped(), 0);
    }

    #[test]
    fn disabled_filter_passes_everything() {
        let mut filter = HeaderFilter::new(false);
        assert!(filter.accept(&Packet::new(0, opus_head())));
    }
}
