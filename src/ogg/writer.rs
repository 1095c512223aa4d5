//! Page encoder.
//!
//! Lays packets out over pages the way a muxer does (255-byte lacing,
//! packets split across page boundaries, continuation flags) and serializes
//! pages with valid checksums. Used to build streams for the fake
//! transformer, fixtures and benchmarks.

use crate::error::Result;
use crate::ogg::crc;
use crate::ogg::page::{
    CHECKSUM_OFFSET, FULL_SEGMENT, MAX_SEGMENTS, Page, PageHeader, split_fragments,
};
use bytes::BytesMut;

/// Serializes one page, computing its checksum.
pub fn encode_page(page: &Page) -> Result<Vec<u8>> {
    let lacing = page.lacing()?;
    let header = PageHeader {
        header_type: page.header_type(),
        granule_position: page.granule_position,
        serial: page.serial,
        sequence: page.sequence,
        checksum: 0,
        segment_count: lacing.len() as u8,
    };

    let mut out = Vec::with_capacity(27 + lacing.len() + page.body_len());
    header.write(&mut out);
    out.extend_from_slice(&lacing);
    for fragment in &page.fragments {
        out.extend_from_slice(&fragment.data);
    }

    let checksum = crc::checksum(&out);
    out[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
    Ok(out)
}

/// Splits a packet sequence into the pages of one logical stream.
#[derive(Debug, Clone)]
pub struct PageWriter {
    serial: u32,
    next_sequence: u32,
    max_segments: usize,
}

impl PageWriter {
    pub fn new(serial: u32) -> Self {
        Self {
            serial,
            next_sequence: 0,
            max_segments: MAX_SEGMENTS,
        }
    }

    /// Caps lacing values per page (clamped to 1..=255). Small values force
    /// packets to straddle pages.
    pub fn with_max_segments(mut self, max_segments: usize) -> Self {
        self.max_segments = max_segments.clamp(1, MAX_SEGMENTS);
        self
    }

    /// Lays out `packets` as a complete stream: the first page is marked
    /// beginning-of-stream and the last end-of-stream.
    pub fn paginate<P: AsRef<[u8]>>(&mut self, packets: &[P]) -> Vec<Page> {
        let mut pages = Vec::new();
        let mut lacing: Vec<u8> = Vec::new();
        let mut body = BytesMut::new();
        let mut continued = false;
        let mut mid_packet = false;
        let mut completed: i64 = 0;

        for packet in packets {
            let mut remaining = packet.as_ref();
            loop {
                if lacing.len() == self.max_segments {
                    pages.push(self.build_page(&lacing, &mut body, continued, completed));
                    lacing.clear();
                    continued = mid_packet;
                }

                let take = remaining.len().min(FULL_SEGMENT as usize);
                lacing.push(take as u8);
                body.extend_from_slice(&remaining[..take]);
                remaining = &remaining[take..];

                if take < FULL_SEGMENT as usize {
                    mid_packet = false;
                    completed += 1;
                    break;
                }
                mid_packet = true;
            }
        }
        pages.push(self.build_page(&lacing, &mut body, continued, completed));

        if let Some(first) = pages.first_mut() {
            first.first = true;
        }
        if let Some(last) = pages.last_mut() {
            last.last = true;
        }
        pages
    }

    /// Lays out `packets` and serializes the resulting pages back to back.
    pub fn write_stream<P: AsRef<[u8]>>(&mut self, packets: &[P]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for page in self.paginate(packets) {
            out.extend(encode_page(&page)?);
        }
        Ok(out)
    }

    fn build_page(
        &mut self,
        lacing: &[u8],
        body: &mut BytesMut,
        continued: bool,
        completed: i64,
    ) -> Page {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let body = body.split().freeze();
        Page::new(sequence, continued, split_fragments(lacing, body))
            .with_serial(self.serial)
            .with_granule_position(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ogg::page::Fragment;

    #[test]
    fn small_packets_share_a_page() {
        let pages = PageWriter::new(1).paginate(&[b"ab".to_vec(), b"cde".to_vec()]);

        assert_eq!(pages.len(), 1);
        let page = &pages[0];
        assert!(page.first && page.last && !page.continued);
        assert_eq!(
            page.fragments,
            vec![Fragment::terminal(&b"ab"[..]), Fragment::terminal(&b"cde"[..])]
        );
        assert_eq!(page.granule_position, 2);
    }

    #[test]
    fn large_packet_straddles_pages() {
        let packet = vec![9u8; 700];
        let pages = PageWriter::new(1).with_max_segments(2).paginate(&[packet]);

        // 700 = 255 + 255 + 190 -> lacing [255, 255] [190]
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].fragments, vec![Fragment::partial(vec![9u8; 510])]);
        assert!(!pages[0].continued);
        assert!(pages[1].continued);
        assert_eq!(pages[1].fragments, vec![Fragment::terminal(vec![9u8; 190])]);
        assert_eq!(pages[0].sequence, 0);
        assert_eq!(pages[1].sequence, 1);
    }

    #[test]
    fn packet_of_exactly_255_bytes_gets_zero_terminator() {
        let pages = PageWriter::new(1).paginate(&[vec![3u8; 255]]);
        assert_eq!(pages[0].lacing().unwrap(), vec![255, 0]);
    }

    #[test]
    fn empty_packet_list_yields_single_empty_page() {
        let pages = PageWriter::new(1).paginate::<Vec<u8>>(&[]);
        assert_eq!(pages.len(), 1);
        assert!(pages[0].fragments.is_empty());
        assert!(pages[0].first && pages[0].last);
    }

    #[test]
    fn encoded_page_has_valid_checksum() {
        let page = Page::new(5, false, vec![Fragment::terminal(&b"hello"[..])]);
        let mut bytes = encode_page(&page).unwrap();

        let stored = u32::from_le_bytes([bytes[22], bytes[23], bytes[24], bytes[25]]);
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].fill(0);
        assert_eq!(crc::checksum(&bytes), stored);
        assert_eq!(&bytes[..4], b"OggS");
        assert_eq!(bytes.len(), 27 + 1 + 5);
    }

    #[test]
    fn sequence_continues_across_calls() {
        let mut writer = PageWriter::new(1);
        writer.paginate(&[b"a".to_vec()]);
        let pages = writer.paginate(&[b"b".to_vec()]);
        assert_eq!(pages[0].sequence, 1);
    }
}
