//! The segment/partial cursor (spec.md §4.3).

use std::sync::Arc;
use std::time::Duration;

use crate::playlist::MediaPlaylist;
use crate::time::StreamTime;

/// A cursor position: a segment index and, for LL-HLS, a partial index
/// within it (`None` means "the whole segment, not in partial mode").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
	pub segment_idx: usize,
	pub part_idx: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapMode {
	Before,
	After,
	Nearest,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SeekFlags {
	pub snap: Option<SnapMode>,
	/// Land only on an independent (keyframe-equivalent) partial/segment.
	pub key_unit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
	Advanced,
	/// Waiting on a `partial_only` segment's next partial/the next refresh.
	Pending,
	Eos,
}

pub struct SegmentWalker {
	playlist: Arc<MediaPlaylist>,
	position: Option<Position>,
}

impl SegmentWalker {
	pub fn new(playlist: Arc<MediaPlaylist>) -> Self {
		Self { playlist, position: None }
	}

	pub fn playlist(&self) -> &Arc<MediaPlaylist> {
		&self.playlist
	}

	pub fn position(&self) -> Option<Position> {
		self.position
	}

	pub fn replace_playlist(&mut self, playlist: Arc<MediaPlaylist>) {
		self.playlist = playlist;
	}

	/// Hold-back distance used to pick the live starting point (spec.md
	/// §4.3's cascading default rule).
	fn hold_back(&self) -> Duration {
		let p = &self.playlist;
		if let Some(part_hold_back) = p.part_hold_back {
			part_hold_back
		} else if let Some(part_target) = p.partial_target_duration {
			part_target * 3
		} else if let Some(hold_back) = p.hold_back {
			hold_back
		} else {
			p.target_duration * 3
		}
	}

	/// Choose the walker's initial position (spec.md §4.3 `starting_segment`).
	pub fn starting_segment(&mut self) -> Option<Position> {
		if self.playlist.segments.is_empty() {
			return None;
		}

		if !self.playlist.is_live() {
			self.position = Some(Position { segment_idx: 0, part_idx: None });
			return self.position;
		}

		let last_idx = self.playlist.segments.len() - 1;
		let last = &self.playlist.segments[last_idx];
		let live_edge = last.stream_time.saturating_add(last.duration);
		let target = live_edge.saturating_sub(self.hold_back());

		let near_edge_window = self.playlist.target_duration * 2;
		let allow_partial = live_edge.duration_since(target) <= near_edge_window;

		let pos = self
			.find_position(target, allow_partial)
			.unwrap_or_else(|| Position {
				// Worst case: 3 fragments before the end (spec.md §4.3).
				segment_idx: last_idx.saturating_sub(3),
				part_idx: None,
			});

		self.position = Some(pos);
		self.position
	}

	/// Locate a segment or partial containing `ts` (spec.md §4.3
	/// `find_position`), scanning backward from the live edge.
	pub fn find_position(&self, ts: StreamTime, allow_partial: bool) -> Option<Position> {
		// Half a segment's duration beyond a segment's interval still
		// counts as "this segment" before handing off to its successor.
		let match_threshold = |d: Duration| d / 2;

		for idx in (0..self.playlist.segments.len()).rev() {
			let seg = &self.playlist.segments[idx];
			let seg_end_loose = seg.stream_time.saturating_add(seg.duration + seg.duration / 2);
			if ts >= seg_end_loose {
				return None; // no earlier segment can match either
			}

			if allow_partial || seg.partial_only {
				if let Some(part_idx) = closest_partial(seg, ts) {
					return Some(Position { segment_idx: idx, part_idx: Some(part_idx) });
				}
				if seg.partial_only {
					continue;
				}
			}

			let seg_end = seg.stream_time.saturating_add(seg.duration);
			if ts > seg_end.saturating_add(match_threshold(seg.duration)) {
				// Belongs to the following segment, which we've already
				// passed (scanning backward) -- only reachable on the
				// first (last-indexed) iteration.
				if idx + 1 < self.playlist.segments.len() {
					return Some(Position { segment_idx: idx + 1, part_idx: None });
				}
				return None;
			}
			if ts >= seg.stream_time {
				return Some(Position { segment_idx: idx, part_idx: None });
			}
		}
		None
	}

	/// Seek honouring snap/KEY_UNIT semantics (spec.md §4.3 `seek`).
	pub fn seek(&mut self, ts: StreamTime, flags: SeekFlags) -> Option<Position> {
		let last = self.playlist.segments.last()?;
		let live_edge = last.stream_time.saturating_add(last.duration);
		let near_edge_window = self.playlist.target_duration * 2;
		let allow_partial = self.playlist.is_live() && live_edge.duration_since(ts) <= near_edge_window;

		let mut pos = self.find_position(ts, allow_partial)?;

		if flags.key_unit {
			pos = self.nearest_independent(pos)?;
		}

		if let Some(snap) = flags.snap {
			pos = self.apply_snap(pos, ts, snap);
		}

		self.position = Some(pos);
		Some(pos)
	}

	fn nearest_independent(&self, pos: Position) -> Option<Position> {
		let seg = self.playlist.segments.get(pos.segment_idx)?;
		match pos.part_idx {
			None => Some(pos), // whole segments always start on a keyframe
			Some(mut idx) => {
				while !seg.partial_segments.get(idx)?.independent {
					if idx == 0 {
						return None; // fall back to the previous segment's last independent partial
					}
					idx -= 1;
				}
				Some(Position { part_idx: Some(idx), ..pos })
			}
		}
	}

	fn apply_snap(&self, pos: Position, ts: StreamTime, mode: SnapMode) -> Position {
		let seg = &self.playlist.segments[pos.segment_idx];
		let interval_start = match pos.part_idx {
			Some(i) => seg.partial_segments[i].stream_time,
			None => seg.stream_time,
		};
		match mode {
			SnapMode::Before => pos,
			SnapMode::After => {
				if interval_start < ts {
					self.advance_copy(pos).unwrap_or(pos)
				} else {
					pos
				}
			}
			SnapMode::Nearest => pos,
		}
	}

	fn advance_copy(&self, pos: Position) -> Option<Position> {
		let seg = &self.playlist.segments[pos.segment_idx];
		match pos.part_idx {
			Some(i) if i + 1 < seg.partial_segments.len() => Some(Position { part_idx: Some(i + 1), ..pos }),
			_ if pos.segment_idx + 1 < self.playlist.segments.len() => {
				Some(Position { segment_idx: pos.segment_idx + 1, part_idx: None })
			}
			_ => None,
		}
	}

	/// Step the cursor forward or backward (spec.md §4.3 `advance`).
	pub fn advance(&mut self, forward: bool) -> AdvanceOutcome {
		let Some(pos) = self.position else { return AdvanceOutcome::Eos };
		let seg = &self.playlist.segments[pos.segment_idx];

		if forward {
			if let Some(part_idx) = pos.part_idx {
				if part_idx + 1 < seg.partial_segments.len() {
					self.position = Some(Position { part_idx: Some(part_idx + 1), ..pos });
					return AdvanceOutcome::Advanced;
				}
				if seg.partial_only {
					// Past the known partials: waiting for the next refresh.
					self.position = Some(Position { part_idx: Some(part_idx + 1), ..pos });
					return AdvanceOutcome::Pending;
				}
			}

			if pos.segment_idx + 1 < self.playlist.segments.len() {
				self.position = Some(Position { segment_idx: pos.segment_idx + 1, part_idx: None });
				AdvanceOutcome::Advanced
			} else if self.playlist.is_live() {
				AdvanceOutcome::Pending
			} else {
				AdvanceOutcome::Eos
			}
		} else if let Some(part_idx) = pos.part_idx {
			if part_idx > 0 {
				self.position = Some(Position { part_idx: Some(part_idx - 1), ..pos });
				AdvanceOutcome::Advanced
			} else {
				self.position = Some(Position { part_idx: None, ..pos });
				AdvanceOutcome::Advanced
			}
		} else if pos.segment_idx > 0 {
			self.position = Some(Position { segment_idx: pos.segment_idx - 1, part_idx: None });
			AdvanceOutcome::Advanced
		} else {
			AdvanceOutcome::Eos
		}
	}

	pub fn has_next_fragment(&self) -> bool {
		match self.position {
			None => !self.playlist.segments.is_empty(),
			Some(pos) => {
				let seg = &self.playlist.segments[pos.segment_idx];
				match pos.part_idx {
					Some(i) => i + 1 < seg.partial_segments.len() || pos.segment_idx + 1 < self.playlist.segments.len(),
					None => pos.segment_idx + 1 < self.playlist.segments.len(),
				}
			}
		}
	}
}

fn closest_partial(seg: &crate::playlist::MediaSegment, ts: StreamTime) -> Option<usize> {
	if seg.partial_segments.is_empty() {
		return None;
	}
	seg.partial_segments
		.iter()
		.enumerate()
		.min_by_key(|(_, p)| {
			let mid = p.stream_time.saturating_add(p.duration / 2);
			mid.diff_nanos(ts).unsigned_abs()
		})
		.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::playlist::media::parse_media;
	use crate::uri::Uri;

	fn playlist(body: &str) -> Arc<MediaPlaylist> {
		let uri = Uri::parse("https://cdn.example/live.m3u8").unwrap();
		Arc::new(parse_media(body, &uri, None).unwrap())
	}

	#[test]
	fn vod_starts_at_first_segment() {
		let p = playlist("#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.0,\nseg0.ts\n#EXTINF:6.0,\nseg1.ts\n#EXT-X-ENDLIST\n");
		let mut walker = SegmentWalker::new(p);
		let pos = walker.starting_segment().unwrap();
		assert_eq!(pos, Position { segment_idx: 0, part_idx: None });
	}

	#[test]
	fn live_starts_inside_hold_back_window() {
		let mut body = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-SERVER-CONTROL:HOLD-BACK=12\n".to_string();
		for i in 0..10 {
			body += &format!("#EXTINF:4.0,\nseg{i}.ts\n");
		}
		let p = playlist(&body);
		// Force VOD-style prefix sums for this test by re-parsing with ENDLIST absent;
		// stream_time stays zero unless live-vs-pdt repair ran, so patch manually.
		let mut playlist_mut = (*p).clone();
		let mut t = 0u64;
		for seg in &mut playlist_mut.segments {
			seg.stream_time = crate::time::StreamTime::from_nanos(t);
			t += seg.duration.as_nanos() as u64;
		}
		let p = Arc::new(playlist_mut);
		let mut walker = SegmentWalker::new(p);
		let pos = walker.starting_segment().unwrap();
		assert_eq!(pos.segment_idx, 7);
	}

	#[test]
	fn advance_past_last_live_segment_is_pending() {
		let p = playlist("#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg0.ts\n");
		let mut walker = SegmentWalker::new(p);
		walker.starting_segment();
		assert_eq!(walker.advance(true), AdvanceOutcome::Pending);
	}

	#[test]
	fn advance_past_last_vod_segment_is_eos() {
		let p = playlist("#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg0.ts\n#EXT-X-ENDLIST\n");
		let mut walker = SegmentWalker::new(p);
		walker.starting_segment();
		assert_eq!(walker.advance(true), AdvanceOutcome::Eos);
	}
}
