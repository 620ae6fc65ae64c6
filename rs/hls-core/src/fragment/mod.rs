//! Fragment processing (C4): decrypt, typefind, and extract an internal
//! timestamp from a downloaded segment/partial so it can be mapped to
//! stream time (spec.md §4.4).

pub mod decrypt;
pub mod id3;
pub mod isobmff;
pub mod processor;
pub mod ts;
pub mod typefind;
pub mod webvtt;

pub use decrypt::Decryptor;
pub use processor::{FragmentProcessor, FragmentTimestamp, ProcessOutcome};
pub use typefind::{ParserKind, PROBE_BUDGET};
