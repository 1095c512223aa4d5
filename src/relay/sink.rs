//! Voice transport boundary.
//!
//! The relay only writes packets to a [`VoiceSink`] and flips its speaking
//! indicator. Acquiring a sink for a destination is the job of a
//! [`VoiceGateway`] supplied by the embedding application.

use crate::error::{RelayError, Result};
use crate::relay::types::{DestinationId, Packet};
use bytes::Bytes;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Outbound side of a joined voice destination.
pub trait VoiceSink: Send + 'static {
    /// Toggles the externally visible "is speaking" indicator.
    fn set_speaking(&mut self, speaking: bool) -> Result<()>;

    /// Hands one packet to the transport. May block to pace delivery.
    fn send_packet(&mut self, packet: &Packet) -> Result<()>;

    /// Name for logging/debugging.
    fn name(&self) -> &'static str {
        "sink"
    }
}

impl VoiceSink for Box<dyn VoiceSink> {
    fn set_speaking(&mut self, speaking: bool) -> Result<()> {
        (**self).set_speaking(speaking)
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        (**self).send_packet(packet)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Joins voice destinations.
pub trait VoiceGateway: Send + Sync {
    /// Fails with [`RelayError::Join`] when the destination cannot be joined.
    fn join(&self, destination: &DestinationId) -> Result<Box<dyn VoiceSink>>;
}

impl<F> VoiceGateway for F
where
    F: Fn(&DestinationId) -> Result<Box<dyn VoiceSink>> + Send + Sync,
{
    fn join(&self, destination: &DestinationId) -> Result<Box<dyn VoiceSink>> {
        self(destination)
    }
}

/// Something a [`CollectorSink`] observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Speaking(bool),
    Packet(Bytes),
}

#[derive(Debug, Default)]
struct Collected {
    events: Vec<SinkEvent>,
    sent: usize,
}

/// Records everything it receives. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct CollectorSink {
    collected: Arc<Mutex<Collected>>,
    fail_after: Option<usize>,
    delay: Option<Duration>,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every packet after the first `packets`.
    pub fn fail_after(mut self, packets: usize) -> Self {
        self.fail_after = Some(packets);
        self
    }

    /// Sleeps this long per packet, like a transport pacing at the frame rate.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Collected> {
        self.collected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.lock().events.clone()
    }

    pub fn packets(&self) -> Vec<Bytes> {
        self.lock()
            .events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Packet(data) => Some(data.clone()),
                SinkEvent::Speaking(_) => None,
            })
            .collect()
    }

    /// Speaking toggles, in order.
    pub fn speaking(&self) -> Vec<bool> {
        self.lock()
            .events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Speaking(on) => Some(*on),
                SinkEvent::Packet(_) => None,
            })
            .collect()
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking().last().copied().unwrap_or(false)
    }
}

impl VoiceSink for CollectorSink {
    fn set_speaking(&mut self, speaking: bool) -> Result<()> {
        self.lock().events.push(SinkEvent::Speaking(speaking));
        Ok(())
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let mut collected = self.lock();
        if let Some(limit) = self.fail_after
            && collected.sent >= limit
        {
            return Err(RelayError::Sink {
                message: format!("transport closed after {limit} packets"),
            });
        }
        collected.sent += 1;
        collected.events.push(SinkEvent::Packet(packet.data.clone()));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "collector"
    }
}

/// Writes packets as `u32` little-endian length records followed by payload.
pub struct PacketFileSink<W: Write + Send + 'static = BufWriter<File>> {
    writer: W,
    packets: u64,
}

impl PacketFileSink<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Send + 'static> PacketFileSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, packets: 0 }
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send + 'static> VoiceSink for PacketFileSink<W> {
    fn set_speaking(&mut self, speaking: bool) -> Result<()> {
        if !speaking {
            self.writer.flush()?;
        }
        Ok(())
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let len = u32::try_from(packet.len()).map_err(|_| RelayError::Sink {
            message: format!("packet of {} bytes does not fit a dump record", packet.len()),
        })?;
        let write = |writer: &mut W| -> std::io::Result<()> {
            writer.write_all(&len.to_le_bytes())?;
            writer.write_all(&packet.data)
        };
        write(&mut self.writer).map_err(|e| RelayError::Sink {
            message: e.to_string(),
        })?;
        self.packets += 1;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "packet-file"
    }
}

/// Reads back a packet dump written by [`PacketFileSink`].
pub fn read_packet_dump<R: Read>(mut reader: R) -> Result<Vec<Bytes>> {
    let mut packets = Vec::new();
    loop {
        let mut len = [0u8; 4];
        match reader.read_exact(&mut len) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let mut data = vec![0u8; u32::from_le_bytes(len) as usize];
        reader.read_exact(&mut data)?;
        packets.push(Bytes::from(data));
    }
    Ok(packets)
}

/// Discards packets.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl VoiceSink for NullSink {
    fn set_speaking(&mut self, _speaking: bool) -> Result<()> {
        Ok(())
    }

    fn send_packet(&mut self, _packet: &Packet) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}
