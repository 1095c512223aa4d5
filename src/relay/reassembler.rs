//! Fragment-aware packet reassembly.
//!
//! Pages do not map one-to-one onto packets: a page may carry several whole
//! packets, and a packet may straddle any number of pages. The reassembler
//! keeps at most one carried fragment between pages and decides its fate
//! when the next page's continuation flag is known.

use crate::error::{RelayError, Result};
use crate::ogg::{Fragment, Page};
use crate::relay::types::Packet;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Fragment held between two pages.
#[derive(Debug, Default)]
enum Carry {
    #[default]
    Empty,
    /// Bytes collected for a packet that has not been terminated yet.
    Pending(BytesMut),
    /// The sole, open fragment of a page. Whether it is a packet on its own
    /// depends on the next page's continuation flag.
    Lagged(Bytes),
}

impl Carry {
    fn into_bytes_mut(self) -> BytesMut {
        match self {
            Carry::Empty => BytesMut::new(),
            Carry::Pending(buf) => buf,
            Carry::Lagged(data) => BytesMut::from(&data[..]),
        }
    }
}

/// Turns an ordered page sequence into complete packets.
#[derive(Debug, Default)]
pub struct Reassembler {
    carry: Carry,
    next_sequence: Option<u32>,
    emitted: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a fragment is held for the next page.
    pub fn has_carry(&self) -> bool {
        !matches!(self.carry, Carry::Empty)
    }

    pub fn packets_emitted(&self) -> u64 {
        self.emitted
    }

    /// Consumes one page and returns the packets it completes, in order.
    pub fn push(&mut self, page: Page) -> Result<Vec<Packet>> {
        if let Some(expected) = self.next_sequence
            && page.sequence != expected
        {
            return Err(RelayError::demux(format!(
                "page sequence gap: expected {}, found {}",
                expected, page.sequence
            )));
        }
        self.next_sequence = Some(page.sequence.wrapping_add(1));

        let sequence = page.sequence;
        let sole_fragment = page.fragments.len() == 1;
        let mut out = Vec::new();
        let mut fragments = page.fragments.into_iter().peekable();

        match std::mem::take(&mut self.carry) {
            Carry::Empty if page.continued => {
                return Err(RelayError::reassembly(format!(
                    "page {sequence} continues a packet but no fragment is pending"
                )));
            }
            Carry::Empty => {}
            carry if page.continued => {
                let mut buf = carry.into_bytes_mut();
                match fragments.next() {
                    Some(fragment) => {
                        buf.extend_from_slice(&fragment.data);
                        if fragment.terminal {
                            out.push(self.emit(buf.freeze()));
                        } else if fragments.peek().is_some() {
                            return Err(open_fragment_not_last(sequence));
                        } else {
                            self.carry = Carry::Pending(buf);
                        }
                    }
                    // A continued page without lacing keeps the packet open.
                    None => self.carry = Carry::Pending(buf),
                }
            }
            Carry::Lagged(data) => {
                tracing::debug!(
                    sequence,
                    bytes = data.len(),
                    "lagged fragment resolved as a complete packet"
                );
                out.push(self.emit(data));
            }
            Carry::Pending(buf) => {
                tracing::warn!(
                    sequence,
                    bytes = buf.len(),
                    "page does not continue the open packet, emitting it as is"
                );
                out.push(self.emit(buf.freeze()));
            }
        }

        while let Some(Fragment { data, terminal }) = fragments.next() {
            if terminal {
                out.push(self.emit(data));
            } else if fragments.peek().is_some() {
                return Err(open_fragment_not_last(sequence));
            } else if sole_fragment && !page.continued {
                self.carry = Carry::Lagged(data);
            } else {
                self.carry = Carry::Pending(BytesMut::from(&data[..]));
            }
        }

        Ok(out)
    }

    /// Flushes a held fragment at normal end of stream.
    pub fn finish(&mut self) -> Option<Packet> {
        match std::mem::take(&mut self.carry) {
            Carry::Empty => None,
            carry => {
                let data = carry.into_bytes_mut().freeze();
                tracing::debug!(bytes = data.len(), "flushing held fragment at end of stream");
                Some(self.emit(data))
            }
        }
    }

    /// Drops a held fragment; used when the stream is aborted.
    pub fn discard(&mut self) {
        self.carry = Carry::Empty;
    }

    fn emit(&mut self, data: Bytes) -> Packet {
        let packet = Packet::new(self.emitted, data);
        self.emitted += 1;
        packet
    }
}

fn open_fragment_not_last(sequence: u32) -> RelayError {
    RelayError::reassembly(format!(
        "page {sequence} has an open fragment before its last segment"
    ))
}

/// Iterator adapter from pages to packets.
///
/// Ends after the first error; the held fragment is discarded in that case,
/// and flushed when the page source ends normally.
pub struct Packets<I> {
    pages: I,
    reassembler: Reassembler,
    ready: VecDeque<Packet>,
    done: bool,
}

impl<I> Packets<I> {
    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }
}

impl<I: Iterator<Item = Result<Page>>> Iterator for Packets<I> {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(packet) = self.ready.pop_front() {
                return Some(Ok(packet));
            }
            if self.done {
                return None;
            }
            match self.pages.next() {
                Some(Ok(page)) => match self.reassembler.push(page) {
                    Ok(packets) => self.ready.extend(packets),
                    Err(e) => return Some(Err(self.abort(e))),
                },
                Some(Err(e)) => return Some(Err(self.abort(e))),
                None => {
                    self.done = true;
                    self.ready.extend(self.reassembler.finish());
                }
            }
        }
    }
}

impl<I> Packets<I> {
    fn abort(&mut self, error: RelayError) -> RelayError {
        self.done = true;
        self.ready.clear();
        self.reassembler.discard();
        error
    }
}

/// Reassembles packets from a page sequence.
pub fn packets<I>(pages: I) -> Packets<I::IntoIter>
where
    I: IntoIterator<Item = Result<Page>>,
{
    Packets {
        pages: pages.into_iter(),
        reassembler: Reassembler::new(),
        ready: VecDeque::new(),
        done: false,
    }
}
