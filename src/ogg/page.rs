//! Page and fragment types, header parsing and lacing.

use crate::error::{RelayError, Result};
use bytes::Bytes;

/// Every page starts with this capture pattern.
pub const CAPTURE_PATTERN: &[u8; 4] = b"OggS";

/// Fixed header length, excluding the segment table.
pub const HEADER_LEN: usize = 27;

/// A page carries at most this many lacing values.
pub const MAX_SEGMENTS: usize = 255;

/// Lacing value that means "this packet continues in the next segment".
pub const FULL_SEGMENT: u8 = 255;

/// Header type flag: first packet on the page continues one from the previous page.
pub const FLAG_CONTINUED: u8 = 0x01;
/// Header type flag: first page of a logical stream.
pub const FLAG_BEGIN: u8 = 0x02;
/// Header type flag: last page of a logical stream.
pub const FLAG_END: u8 = 0x04;

const KNOWN_FLAGS: u8 = FLAG_CONTINUED | FLAG_BEGIN | FLAG_END;

/// Offset of the checksum field inside the header.
pub(crate) const CHECKSUM_OFFSET: usize = 22;

/// A contiguous byte run belonging to exactly one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub data: Bytes,
    /// True when this fragment ends its packet.
    pub terminal: bool,
}

impl Fragment {
    /// A fragment that completes its packet.
    pub fn terminal(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            terminal: true,
        }
    }

    /// A fragment whose packet continues past it.
    pub fn partial(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            terminal: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One demuxed unit of the container stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub sequence: u32,
    pub serial: u32,
    pub granule_position: i64,
    /// The first fragment continues a packet begun on the previous page.
    pub continued: bool,
    /// Beginning-of-stream page.
    pub first: bool,
    /// End-of-stream page.
    pub last: bool,
    pub fragments: Vec<Fragment>,
}

impl Page {
    /// Creates a page on serial 0 with no stream boundary flags.
    pub fn new(sequence: u32, continued: bool, fragments: Vec<Fragment>) -> Self {
        Self {
            sequence,
            serial: 0,
            granule_position: 0,
            continued,
            first: false,
            last: false,
            fragments,
        }
    }

    pub fn with_serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    pub fn with_granule_position(mut self, granule_position: i64) -> Self {
        self.granule_position = granule_position;
        self
    }

    pub fn with_first(mut self, first: bool) -> Self {
        self.first = first;
        self
    }

    pub fn with_last(mut self, last: bool) -> Self {
        self.last = last;
        self
    }

    /// Header type byte for this page.
    pub fn header_type(&self) -> u8 {
        let mut flags = 0;
        if self.continued {
            flags |= FLAG_CONTINUED;
        }
        if self.first {
            flags |= FLAG_BEGIN;
        }
        if self.last {
            flags |= FLAG_END;
        }
        flags
    }

    /// Total payload bytes carried by the page.
    pub fn body_len(&self) -> usize {
        self.fragments.iter().map(Fragment::len).sum()
    }

    /// True when the last fragment runs on into the next page.
    pub fn ends_mid_packet(&self) -> bool {
        self.fragments.last().is_some_and(|f| !f.terminal)
    }

    /// Lacing values describing this page's fragments.
    ///
    /// Fails for fragments the container cannot express: a non-terminal
    /// fragment must be a whole number of 255-byte segments.
    pub fn lacing(&self) -> Result<Vec<u8>> {
        let mut lacing = Vec::new();
        for (index, fragment) in self.fragments.iter().enumerate() {
            let full = fragment.len() / FULL_SEGMENT as usize;
            let rest = fragment.len() % FULL_SEGMENT as usize;
            lacing.extend(std::iter::repeat_n(FULL_SEGMENT, full));
            if fragment.terminal {
                lacing.push(rest as u8);
            } else if rest != 0 || full == 0 {
                return Err(RelayError::demux(format!(
                    "page {}: open fragment {} is {} bytes, not a multiple of 255",
                    self.sequence,
                    index,
                    fragment.len()
                )));
            } else if index + 1 != self.fragments.len() {
                return Err(RelayError::demux(format!(
                    "page {}: open fragment {} is not the last on the page",
                    self.sequence, index
                )));
            }
        }
        if lacing.len() > MAX_SEGMENTS {
            return Err(RelayError::demux(format!(
                "page {} needs {} segments, limit is {}",
                self.sequence,
                lacing.len(),
                MAX_SEGMENTS
            )));
        }
        Ok(lacing)
    }
}

/// Parsed fixed-size page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageHeader {
    pub header_type: u8,
    pub granule_position: i64,
    pub serial: u32,
    pub sequence: u32,
    pub checksum: u32,
    pub segment_count: u8,
}

impl PageHeader {
    pub(crate) fn parse(raw: &[u8; HEADER_LEN]) -> Result<Self> {
        if &raw[0..4] != CAPTURE_PATTERN {
            return Err(RelayError::demux(format!(
                "bad capture pattern {:02x?}",
                &raw[0..4]
            )));
        }
        if raw[4] != 0 {
            return Err(RelayError::demux(format!(
                "unsupported stream structure version {}",
                raw[4]
            )));
        }
        let header_type = raw[5];
        if header_type & !KNOWN_FLAGS != 0 {
            return Err(RelayError::demux(format!(
                "unknown header type bits {:#04x}",
                header_type
            )));
        }

        Ok(Self {
            header_type,
            granule_position: i64::from_le_bytes(le_array(&raw[6..14])),
            serial: u32::from_le_bytes(le_array(&raw[14..18])),
            sequence: u32::from_le_bytes(le_array(&raw[18..22])),
            checksum: u32::from_le_bytes(le_array(&raw[22..26])),
            segment_count: raw[26],
        })
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(CAPTURE_PATTERN);
        out.push(0);
        out.push(self.header_type);
        out.extend_from_slice(&self.granule_position.to_le_bytes());
        out.extend_from_slice(&self.serial.to_le_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out.push(self.segment_count);
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Split a page body into fragments according to its lacing values.
///
/// `body` must be exactly as long as the lacing values add up to.
pub(crate) fn split_fragments(lacing: &[u8], body: Bytes) -> Vec<Fragment> {
    let mut fragments = Vec::new();
    let mut start = 0usize;
    let mut end = 0usize;
    let mut open = false;

    for &value in lacing {
        end += value as usize;
        open = true;
        if value < FULL_SEGMENT {
            fragments.push(Fragment::terminal(body.slice(start..end)));
            start = end;
            open = false;
        }
    }
    if open {
        fragments.push(Fragment::partial(body.slice(start..end)));
    }

    fragments
}
