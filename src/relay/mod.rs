//! The relay core: packets from a container stream to a voice sink.
//!
//! Data flow for one session:
//!
//! ```text
//! MediaPipeline ─bytes─▶ Demuxer ─pages─▶ Reassembler ─packets─▶ HeaderFilter
//!                                                                    │
//!                         VoiceSink ◀── PacedSender ◀── bounded queue┘
//! ```

pub mod cancel;
pub mod headers;
pub mod reassembler;
pub mod registry;
pub mod sender;
pub mod session;
pub mod sink;
pub mod types;

pub use cancel::CancelToken;
pub use headers::{HeaderFilter, OpusHead};
pub use reassembler::{Packets, Reassembler, packets};
pub use registry::{SessionHandle, SessionRegistry};
pub use sender::{PacedSender, Pacer, SendReport};
pub use session::{PlaybackReport, Session, SessionState, SessionStatus};
pub use sink::{
    CollectorSink, NullSink, PacketFileSink, SinkEvent, VoiceGateway, VoiceSink, read_packet_dump,
};
pub use types::{DestinationId, MediaRequest, Packet};
