//! Segment walking (C3): per-stream cursor over a Media Playlist's segments.

pub mod walker;

pub use walker::{AdvanceOutcome, Position, SeekFlags, SegmentWalker, SnapMode};
