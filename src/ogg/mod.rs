//! Ogg container framing.
//!
//! The transcoder wraps Opus packets in Ogg pages. This module reads those
//! pages back ([`Demuxer`]) and can also produce them ([`PageWriter`]).

pub mod crc;
pub mod demux;
pub mod page;
pub mod writer;

pub use demux::Demuxer;
pub use page::{Fragment, Page};
pub use writer::{PageWriter, encode_page};
