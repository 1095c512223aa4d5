//! Property tests: whatever way packets are laid out over pages, and
//! however the byte stream is chunked or cut, reassembly recovers them.

use proptest::prelude::*;
use std::io::{Cursor, Read};
use voxrelay::ogg::{Demuxer, PageWriter};
use voxrelay::relay::packets;

/// Serves at most `chunk` bytes per read.
struct Trickle<R> {
    inner: R,
    chunk: usize,
}

impl<R: Read> Read for Trickle<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = buf.len().min(self.chunk);
        self.inner.read(&mut buf[..n])
    }
}

fn packet_lists() -> impl Strategy<Value = Vec<Vec<u8>>> {
    proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..1200), 0..24)
}

proptest! {
    #[test]
    fn pages_round_trip_to_packets(
        input in packet_lists(),
        max_segments in 1usize..=255,
        chunk in 1usize..4096,
    ) {
        let stream = PageWriter::new(3)
            .with_max_segments(max_segments)
            .write_stream(&input)
            .unwrap();
        let reader = Trickle { inner: Cursor::new(stream), chunk };

        let output: Vec<Vec<u8>> = packets(Demuxer::new(reader))
            .map(|p| p.map(|p| p.data.to_vec()))
            .collect::<voxrelay::Result<_>>()
            .unwrap();

        prop_assert_eq!(output, input);
    }

    #[test]
    fn truncated_stream_yields_a_prefix(
        input in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..700), 1..12),
        max_segments in 1usize..=16,
        cut in any::<prop::sample::Index>(),
    ) {
        let stream = PageWriter::new(3)
            .with_max_segments(max_segments)
            .write_stream(&input)
            .unwrap();
        let cut = cut.index(stream.len());

        let mut output = Vec::new();
        for packet in packets(Demuxer::new(Cursor::new(&stream[..cut]))) {
            match packet {
                Ok(packet) => output.push(packet.data.to_vec()),
                Err(_) => break,
            }
        }

        prop_assert!(output.len() <= input.len());
        if let Some((last, complete)) = output.split_last() {
            prop_assert_eq!(complete, &input[..complete.len()]);
            // The final packet may be a flushed partial one.
            prop_assert!(input[complete.len()].starts_with(last));
        }
    }
}
