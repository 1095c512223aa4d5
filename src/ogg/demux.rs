//! Streaming page demultiplexer.
//!
//! Reads pages from any [`Read`] (normally the transcoder's stdout), verifies
//! framing and checksums, follows one logical stream and enforces strictly
//! consecutive page sequence numbers.
//!
//! The followed stream is chosen from the leading beginning-of-stream pages:
//! the one whose identification packet is `OpusHead` wins. Without one, the
//! first stream seen is followed.

use crate::error::{RelayError, Result};
use crate::ogg::crc;
use crate::ogg::page::{
    CHECKSUM_OFFSET, FLAG_BEGIN, FLAG_CONTINUED, FLAG_END, HEADER_LEN, Page, PageHeader,
    split_fragments,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::io::{self, Read};

const OPUS_MAGIC: &[u8] = b"OpusHead";

/// Lazy page sequence over a byte stream.
///
/// The sequence can only be restarted by building a new demuxer over the
/// stream from its beginning.
pub struct Demuxer<R> {
    reader: R,
    verify_checksum: bool,
    serial: Option<u32>,
    /// Beginning-of-stream pages read before a stream was chosen.
    candidates: Vec<Page>,
    /// Pages of the followed stream read ahead during selection.
    pending: VecDeque<Page>,
    next_sequence: Option<u32>,
    ended: bool,
    pages: u64,
    foreign_pages: u64,
}

impl<R: Read> Demuxer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            verify_checksum: true,
            serial: None,
            candidates: Vec::new(),
            pending: VecDeque::new(),
            next_sequence: None,
            ended: false,
            pages: 0,
            foreign_pages: 0,
        }
    }

    /// Enables or disables page checksum verification (on by default).
    pub fn with_checksum_verification(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    /// Serial number of the logical stream being followed, once known.
    pub fn serial(&self) -> Option<u32> {
        self.serial
    }

    /// Pages delivered from the followed stream.
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// Pages skipped because they belong to another logical stream.
    pub fn foreign_pages(&self) -> u64 {
        self.foreign_pages
    }

    /// Reads the next page of the followed stream.
    ///
    /// Returns `Ok(None)` at a clean end of stream: no bytes left at a page
    /// boundary, or the followed stream's end-of-stream page already seen.
    pub fn next_page(&mut self) -> Result<Option<Page>> {
        loop {
            if self.ended {
                return Ok(None);
            }
            if let Some(page) = self.pending.pop_front() {
                return self.accept(page).map(Some);
            }

            match (self.serial, self.read_page()?) {
                (Some(serial), Some(page)) => {
                    if page.serial == serial {
                        return self.accept(page).map(Some);
                    }
                    self.skip(&page, serial);
                }
                (Some(_), None) => {
                    tracing::debug!(
                        pages = self.pages,
                        "stream closed without an end-of-stream page"
                    );
                    self.ended = true;
                }
                (None, Some(page)) => self.select(page),
                (None, None) if self.candidates.is_empty() => self.ended = true,
                (None, None) => self.settle(None),
            }
        }
    }

    /// Handles a page read while no stream is followed yet.
    fn select(&mut self, page: Page) {
        let repeated = self.candidates.iter().any(|c| c.serial == page.serial);
        if !page.first || repeated {
            // The beginning-of-stream section is over.
            self.settle(Some(page));
            return;
        }
        let is_opus = page
            .fragments
            .first()
            .is_some_and(|f| f.data.starts_with(OPUS_MAGIC));
        if is_opus {
            self.lock(page.serial);
            self.pending.push_back(page);
        } else {
            self.candidates.push(page);
        }
    }

    /// Falls back to the first stream seen, then routes `next`.
    fn settle(&mut self, next: Option<Page>) {
        let Some(serial) = self
            .candidates
            .first()
            .or(next.as_ref())
            .map(|page| page.serial)
        else {
            return;
        };
        self.lock(serial);
        if let Some(page) = next {
            if page.serial == serial {
                self.pending.push_back(page);
            } else {
                self.skip(&page, serial);
            }
        }
    }

    fn lock(&mut self, serial: u32) {
        tracing::debug!(
            serial,
            streams = self.candidates.len() + 1,
            "following logical stream"
        );
        self.serial = Some(serial);
        for page in std::mem::take(&mut self.candidates) {
            if page.serial == serial {
                self.pending.push_back(page);
            } else {
                self.skip(&page, serial);
            }
        }
    }

    fn skip(&mut self, page: &Page, followed: u32) {
        self.foreign_pages += 1;
        tracing::debug!(
            serial = page.serial,
            followed,
            sequence = page.sequence,
            "skipping page from another logical stream"
        );
    }

    /// Sequence check and bookkeeping for a page of the followed stream.
    fn accept(&mut self, page: Page) -> Result<Page> {
        if let Some(expected) = self.next_sequence
            && page.sequence != expected
        {
            return Err(RelayError::demux(format!(
                "page sequence gap: expected {}, found {}",
                expected, page.sequence
            )));
        }
        self.next_sequence = Some(page.sequence.wrapping_add(1));
        self.pages += 1;
        if page.last {
            self.ended = true;
            self.pending.clear();
        }
        Ok(page)
    }

    /// Reads and verifies one page of any logical stream.
    fn read_page(&mut self) -> Result<Option<Page>> {
        let mut raw = [0u8; HEADER_LEN];
        let got = read_full(&mut self.reader, &mut raw)?;
        if got == 0 {
            return Ok(None);
        }
        if got < HEADER_LEN {
            return Err(RelayError::demux(format!(
                "truncated page header: {} of {} bytes",
                got, HEADER_LEN
            )));
        }

        let header = PageHeader::parse(&raw)?;

        let mut lacing = vec![0u8; header.segment_count as usize];
        let got = read_full(&mut self.reader, &mut lacing)?;
        if got < lacing.len() {
            return Err(RelayError::demux(format!(
                "page {}: truncated segment table: {} of {} bytes",
                header.sequence,
                got,
                lacing.len()
            )));
        }

        let body_len: usize = lacing.iter().map(|&v| v as usize).sum();
        let mut body = vec![0u8; body_len];
        let got = read_full(&mut self.reader, &mut body)?;
        if got < body_len {
            return Err(RelayError::demux(format!(
                "page {}: truncated body: {} of {} bytes",
                header.sequence, got, body_len
            )));
        }

        if self.verify_checksum {
            raw[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].fill(0);
            let computed = crc::update(crc::update(crc::checksum(&raw), &lacing), &body);
            if computed != header.checksum {
                return Err(RelayError::demux(format!(
                    "page {}: checksum mismatch (stored {:#010x}, computed {:#010x})",
                    header.sequence, header.checksum, computed
                )));
            }
        }

        Ok(Some(Page {
            sequence: header.sequence,
            serial: header.serial,
            granule_position: header.granule_position,
            continued: header.header_type & FLAG_CONTINUED != 0,
            first: header.header_type & FLAG_BEGIN != 0,
            last: header.header_type & FLAG_END != 0,
            fragments: split_fragments(&lacing, Bytes::from(body)),
        }))
    }
}

impl<R: Read> Iterator for Demuxer<R> {
    type Item = Result<Page>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_page() {
            Ok(Some(page)) => Some(Ok(page)),
            Ok(None) => None,
            Err(e) => {
                self.ended = true;
                Some(Err(e))
            }
        }
    }
}

/// Fills `buf` as far as the stream allows; returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::ogg::page::Fragment;
    use crate::ogg::writer::{PageWriter, encode_page};
    use crate::relay::packets;
    use std::io::Cursor;

    fn encode_all(pages: &[Page]) -> Vec<u8> {
        pages
            .iter()
            .flat_map(|p| encode_page(p).unwrap())
            .collect()
    }

    fn three_pages() -> Vec<Page> {
        vec![
            Page::new(0, false, vec![Fragment::terminal(&b"head"[..])]).with_first(true),
            Page::new(1, false, vec![Fragment::terminal(&b"one"[..])]),
            Page::new(2, false, vec![Fragment::terminal(&b"two"[..])]).with_last(true),
        ]
    }

    #[test]
    fn reads_pages_in_order() {
        let bytes = encode_all(&three_pages());
        let pages: Vec<Page> = Demuxer::new(Cursor::new(bytes))
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(pages, three_pages());
    }

    #[test]
    fn empty_stream_is_clean_end() {
        let mut demuxer = Demuxer::new(Cursor::new(Vec::new()));
        assert!(demuxer.next_page().unwrap().is_none());
        assert!(demuxer.next().is_none());
    }

    #[test]
    fn stops_after_end_of_stream_page() {
        let mut bytes = encode_all(&three_pages());
        // Trailing garbage after the end-of-stream page is never read.
        bytes.extend_from_slice(b"garbage");
        let mut demuxer = Demuxer::new(Cursor::new(bytes));
        assert_eq!(demuxer.by_ref().count(), 3);
        assert!(demuxer.next_page().unwrap().is_none());
    }

    #[test]
    fn partial_header_is_error() {
        let mut bytes = encode_all(&three_pages()[..2]);
        bytes.extend_from_slice(b"OggS\0");
        let mut demuxer = Demuxer::new(Cursor::new(bytes));

        assert!(demuxer.next().unwrap().is_ok());
        assert!(demuxer.next().unwrap().is_ok());
        let err = demuxer.next().unwrap().unwrap_err();
        assert_eq!(err.kind(), FailureKind::Demux);
        assert!(err.to_string().contains("truncated page header"));
        assert!(demuxer.next().is_none());
    }

    #[test]
    fn page_cut_mid_body_is_error() {
        let mut bytes = encode_all(&three_pages());
        bytes.truncate(bytes.len() - 2);
        let results: Vec<Result<Page>> = Demuxer::new(Cursor::new(bytes)).collect();

        assert_eq!(results.len(), 3);
        let err = results[2].as_ref().unwrap_err();
        assert!(err.to_string().contains("truncated body"));
    }

    #[test]
    fn checksum_mismatch_is_error() {
        let mut bytes = encode_all(&three_pages()[..1]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let err = Demuxer::new(Cursor::new(bytes.clone()))
            .next_page()
            .unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));

        // Same bytes pass with verification off.
        let page = Demuxer::new(Cursor::new(bytes))
            .with_checksum_verification(false)
            .next_page()
            .unwrap()
            .unwrap();
        assert_eq!(page.sequence, 0);
    }

    #[test]
    fn sequence_gap_is_error() {
        let mut pages = three_pages();
        pages[2].sequence = 3;
        let results: Vec<Result<Page>> =
            Demuxer::new(Cursor::new(encode_all(&pages))).collect();

        let err = results[2].as_ref().unwrap_err();
        assert_eq!(err.kind(), FailureKind::Demux);
        assert!(err.to_string().contains("expected 2, found 3"));
    }

    #[test]
    fn reordered_pages_are_error() {
        let pages = three_pages();
        let reordered = vec![pages[0].clone(), pages[2].clone(), pages[1].clone()];
        let results: Vec<Result<Page>> =
            Demuxer::new(Cursor::new(encode_all(&reordered))).collect();
        assert!(results[1].is_err());
    }

    #[test]
    fn sequence_may_start_anywhere() {
        let pages: Vec<Page> = (40..43)
            .map(|seq| Page::new(seq, false, vec![Fragment::terminal(&b"x"[..])]))
            .collect();
        let read: Vec<Page> = Demuxer::new(Cursor::new(encode_all(&pages)))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(read.len(), 3);
    }

    #[test]
    fn foreign_streams_are_filtered() {
        let ours = three_pages();
        let theirs: Vec<Page> = (0..3)
            .map(|seq| {
                Page::new(seq, false, vec![Fragment::terminal(&b"video"[..])]).with_serial(99)
            })
            .collect();
        let interleaved = vec![
            ours[0].clone(),
            theirs[0].clone(),
            ours[1].clone(),
            theirs[1].clone(),
            theirs[2].clone(),
            ours[2].clone(),
        ];

        let mut demuxer = Demuxer::new(Cursor::new(encode_all(&interleaved)));
        let pages: Vec<Page> = demuxer.by_ref().collect::<Result<_>>().unwrap();

        assert_eq!(pages, ours);
        assert_eq!(demuxer.serial(), Some(0));
        assert_eq!(demuxer.foreign_pages(), 3);
        assert_eq!(demuxer.pages(), 3);
    }

    fn opus_packets() -> Vec<Vec<u8>> {
        vec![
            b"OpusHead\x01\x02\x38\x01\x80\xbb\x00\x00\x00\x00\x00".to_vec(),
            b"OpusTags\x00\x00\x00\x00".to_vec(),
            b"audio1".to_vec(),
            b"audio2".to_vec(),
        ]
    }

    fn video_page(sequence: u32, data: &'static [u8]) -> Page {
        Page::new(sequence, false, vec![Fragment::terminal(data)]).with_serial(99)
    }

    #[test]
    fn opus_stream_wins_over_earlier_foreign_stream() {
        let opus = PageWriter::new(7).with_max_segments(1).paginate(&opus_packets());
        let mut pages = vec![video_page(0, b"\x80theora-header").with_first(true)];
        pages.push(opus[0].clone());
        pages.push(video_page(1, b"\x81theora-comment"));
        pages.extend(opus[1..].iter().cloned());
        pages.push(video_page(2, b"frame"));

        let mut demuxer = Demuxer::new(Cursor::new(encode_all(&pages)));
        let packets: Vec<Vec<u8>> = packets(demuxer.by_ref())
            .map(|p| p.map(|p| p.data.to_vec()))
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(packets, opus_packets());
        assert_eq!(demuxer.serial(), Some(7));
        assert_eq!(demuxer.pages(), opus.len() as u64);
        // The trailing video page follows the Opus end-of-stream page and is never read.
        assert_eq!(demuxer.foreign_pages(), 2);
    }

    #[test]
    fn foreign_header_before_whole_opus_stream_is_skipped() {
        let mut bytes = encode_all(&[video_page(0, b"\x80theora-header").with_first(true)]);
        bytes.extend(PageWriter::new(7).write_stream(&opus_packets()).unwrap());

        let packets: Vec<Vec<u8>> = packets(Demuxer::new(Cursor::new(bytes)))
            .map(|p| p.map(|p| p.data.to_vec()))
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(packets, opus_packets());
    }

    #[test]
    fn first_stream_is_followed_without_opus_header() {
        let ours = three_pages();
        let pages = vec![
            ours[0].clone(),
            video_page(0, b"\x80theora-header").with_first(true),
            ours[1].clone(),
            video_page(1, b"frame"),
            ours[2].clone(),
        ];

        let mut demuxer = Demuxer::new(Cursor::new(encode_all(&pages)));
        let read: Vec<Page> = demuxer.by_ref().collect::<Result<_>>().unwrap();

        assert_eq!(read, ours);
        assert_eq!(demuxer.serial(), Some(0));
        assert_eq!(demuxer.foreign_pages(), 2);
    }

    #[test]
    fn lone_header_page_is_delivered_at_end_of_input() {
        let page = video_page(0, b"\x80theora-header").with_first(true);
        let mut demuxer = Demuxer::new(Cursor::new(encode_all(std::slice::from_ref(&page))));

        assert_eq!(demuxer.next_page().unwrap(), Some(page));
        assert_eq!(demuxer.serial(), Some(99));
        assert!(demuxer.next_page().unwrap().is_none());
    }

    #[test]
    fn garbage_instead_of_header_is_error() {
        let bytes = vec![0x42u8; 64];
        let err = Demuxer::new(Cursor::new(bytes)).next_page().unwrap_err();
        assert!(err.to_string().contains("capture pattern"));
    }

    #[test]
    fn paginated_stream_round_trips() {
        let packets: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 100 + i as usize * 40]).collect();
        let pages = PageWriter::new(7).with_max_segments(4).paginate(&packets);
        let read: Vec<Page> = Demuxer::new(Cursor::new(encode_all(&pages)))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(read, pages);
    }

    struct InterruptingReader {
        inner: Cursor<Vec<u8>>,
        interrupt_next: bool,
    }

    impl Read for InterruptingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt_next = !self.interrupt_next;
            if self.interrupt_next {
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            // Dribble one byte at a time to exercise short reads.
            let len = buf.len().min(1);
            self.inner.read(&mut buf[..len])
        }
    }

    #[test]
    fn short_and_interrupted_reads_are_retried() {
        let reader = InterruptingReader {
            inner: Cursor::new(encode_all(&three_pages())),
            interrupt_next: false,
        };
        let pages: Vec<Page> = Demuxer::new(reader).collect::<Result<_>>().unwrap();
        assert_eq!(pages, three_pages());
    }
}
