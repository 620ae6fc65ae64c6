//! Time mapping and resynchronization (part of C5, spec.md §4.5).
//!
//! Each discontinuity sequence owns a `TimeMap` pinning one internal-clock
//! reading to a stream-time/PDT pair. Non-discontinuity fragments drift
//! against that pin over a playback session (clock skew, encoder jitter);
//! this module absorbs small drift, relocates the walker on larger drift,
//! and repairs a freshly-loaded playlist's DSNs/stream-times against a
//! known-good anchor segment from the previous one.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::fragment::FragmentTimestamp;
use crate::playlist::{MediaPlaylist, MediaSegment};
use crate::stream::{Position, SegmentWalker};
use crate::time::StreamTime;

/// `{stream_time, internal_time, pdt?}` pinned to one DSN (spec.md §3).
#[derive(Debug, Clone, Copy)]
pub struct TimeMap {
	pub stream_time: StreamTime,
	pub internal_nanos: u64,
	pub pdt: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
	NoOp,
	/// Drift absorbed into the current segment/partial's `stream_time`.
	Adjusted { stream_time: StreamTime },
	/// Drift large enough that the walker moved to a new position.
	Resync { position: Position },
	/// Drift large enough to relocate, but `find_position` landed on the
	/// same spot; accept `real_stream_time` as ground truth and mark the
	/// buffer discontinuous instead of moving the cursor.
	Discontinuity { stream_time: StreamTime },
}

const NOOP_THRESHOLD: Duration = Duration::from_millis(10);

/// Per-DSN time map registry, owned by the variant/rendition controller.
#[derive(Debug, Default)]
pub struct TimeMapRegistry {
	maps: std::collections::HashMap<u64, TimeMap>,
}

impl TimeMapRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, dsn: u64) -> Option<TimeMap> {
		self.maps.get(&dsn).copied()
	}

	/// Resolve a raw [`FragmentTimestamp`] to nanoseconds on this DSN's
	/// internal clock, unwrapping 90 kHz wraparound against the existing
	/// map (if any) as the reference. Returns `None` for WebVTT, which
	/// carries its own cue-relative timing rather than a single internal
	/// clock reading.
	pub fn resolve_internal_nanos(&self, dsn: u64, ts: &FragmentTimestamp) -> Option<u64> {
		match ts {
			FragmentTimestamp::MpegTs(ticks) | FragmentTimestamp::Id3(ticks) => {
				let reference = self.maps.get(&dsn).map(|m| m.internal_nanos).unwrap_or(0);
				Some(crate::time::unwrap_90k(*ticks, reference))
			}
			FragmentTimestamp::IsoBmff(nanos) => Some(*nanos),
			FragmentTimestamp::WebVtt(_) => None,
		}
	}

	/// Seed a map that doesn't exist yet, or overwrite one unconditionally
	/// when `force` is set (discontinuity segments always force). Only the
	/// variant stream may seed a brand-new map; rendition streams pass
	/// `is_variant_stream: false` and get `None` back until the variant has
	/// seeded one for this DSN.
	pub fn seed_or_overwrite(
		&mut self,
		dsn: u64,
		stream_time: StreamTime,
		internal_nanos: u64,
		pdt: Option<DateTime<Utc>>,
		is_variant_stream: bool,
		force: bool,
	) -> Option<TimeMap> {
		let exists = self.maps.contains_key(&dsn);
		if !exists && !is_variant_stream {
			return None;
		}
		if force || !exists {
			let map = TimeMap {
				stream_time,
				internal_nanos,
				pdt,
			};
			self.maps.insert(dsn, map);
			return Some(map);
		}
		self.maps.get(&dsn).copied()
	}

	/// Non-discontinuity drift reconciliation (spec.md §4.5).
	pub fn reconcile(
		&self,
		walker: &SegmentWalker,
		dsn: u64,
		current_stream_time: StreamTime,
		internal_nanos: u64,
		interval_duration: Duration,
		allow_partial: bool,
	) -> Reconciliation {
		let Some(map) = self.maps.get(&dsn) else {
			return Reconciliation::NoOp;
		};

		let delta_nanos = internal_nanos as i64 - map.internal_nanos as i64;
		let real_stream_time = if delta_nanos >= 0 {
			map.stream_time.saturating_add(Duration::from_nanos(delta_nanos as u64))
		} else {
			map.stream_time.saturating_sub(Duration::from_nanos((-delta_nanos) as u64))
		};

		let drift = current_stream_time.diff_nanos(real_stream_time);
		if drift.unsigned_abs() <= NOOP_THRESHOLD.as_nanos() as u64 {
			return Reconciliation::NoOp;
		}

		let adjust_threshold = interval_duration.as_nanos() as u64 / 2;
		if drift.unsigned_abs() <= adjust_threshold {
			return Reconciliation::Adjusted {
				stream_time: real_stream_time,
			};
		}

		match walker.find_position(real_stream_time, allow_partial) {
			Some(position) if Some(position) != walker.position() => Reconciliation::Resync { position },
			_ => Reconciliation::Discontinuity {
				stream_time: real_stream_time,
			},
		}
	}
}

/// DSN repair: propagate `anchor_dsn` from `anchor_idx` across `playlist`,
/// incrementing forward and decrementing backward on each `discont` flag
/// (spec.md §4.5 "DSN repair"), for a playlist that arrived without its own
/// `EXT-X-DISCONTINUITY-SEQUENCE`.
pub fn repair_dsn(playlist: &mut MediaPlaylist, anchor_idx: usize, anchor_dsn: u64) {
	if playlist.segments.is_empty() {
		return;
	}
	playlist.segments[anchor_idx].discont_sequence = anchor_dsn;

	let mut dsn = anchor_dsn;
	for i in anchor_idx + 1..playlist.segments.len() {
		if playlist.segments[i].discont {
			dsn += 1;
		}
		playlist.segments[i].discont_sequence = dsn;
	}

	let mut dsn = anchor_dsn;
	for i in (0..anchor_idx).rev() {
		if playlist.segments[i + 1].discont {
			dsn = dsn.saturating_sub(1);
		}
		playlist.segments[i].discont_sequence = dsn;
	}

	playlist.discont_sequence = playlist.segments[0].discont_sequence;
}

/// Stream-time repair: pin `anchor_idx` to `anchor_stream_time` and
/// recompute every other segment (and its partials) by prefix sum forward
/// and backward from that anchor (spec.md §4.5 "Stream-time repair").
pub fn repair_stream_time(playlist: &mut MediaPlaylist, anchor_idx: usize, anchor_stream_time: StreamTime) {
	if playlist.segments.is_empty() {
		return;
	}
	playlist.segments[anchor_idx].stream_time = anchor_stream_time;
	stamp_partials(&mut playlist.segments[anchor_idx], anchor_stream_time);

	let mut cursor = anchor_stream_time.saturating_add(playlist.segments[anchor_idx].duration);
	for i in anchor_idx + 1..playlist.segments.len() {
		playlist.segments[i].stream_time = cursor;
		stamp_partials(&mut playlist.segments[i], cursor);
		cursor = cursor.saturating_add(playlist.segments[i].duration);
	}

	let mut cursor = anchor_stream_time;
	for i in (0..anchor_idx).rev() {
		cursor = cursor.saturating_sub(playlist.segments[i].duration);
		playlist.segments[i].stream_time = cursor;
		stamp_partials(&mut playlist.segments[i], cursor);
	}
}

fn stamp_partials(segment: &mut MediaSegment, start: StreamTime) {
	let mut cursor = start;
	for part in &mut segment.partial_segments {
		part.stream_time = cursor;
		cursor = cursor.saturating_add(part.duration);
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMethod {
	Identity,
	Pdt,
	StreamTime,
	Msn,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOutcome {
	pub new_idx: usize,
	pub method: SyncMethod,
	/// True when `anchor` matched just before `new.segments[0]` rather than
	/// an existing index (spec.md §4.5 step 2's "virtual preceding segment").
	pub virtual_preceding: bool,
}

/// Locate `anchor` (a segment from the previously-loaded playlist, typically
/// the walker's current segment) inside `new`, trying each method of
/// spec.md §4.5 "Synchronizing playlists to one another" in order. `None`
/// means lost sync.
pub fn synchronize(anchor: &MediaSegment, new: &MediaPlaylist) -> Option<SyncOutcome> {
	if let Some(idx) = new
		.segments
		.iter()
		.position(|s| s.uri == anchor.uri && s.sequence == anchor.sequence && s.discont_sequence == anchor.discont_sequence)
	{
		return Some(SyncOutcome {
			new_idx: idx,
			method: SyncMethod::Identity,
			virtual_preceding: false,
		});
	}

	if let Some(anchor_pdt) = anchor.datetime {
		for (idx, seg) in new.segments.iter().enumerate() {
			let Some(pdt) = seg.datetime else { continue };
			let tolerance = seg.duration / 3;
			if pdt_delta(anchor_pdt, pdt) <= tolerance {
				return Some(SyncOutcome {
					new_idx: idx,
					method: SyncMethod::Pdt,
					virtual_preceding: false,
				});
			}
		}
		if let Some(first) = new.segments.first() {
			if let Some(first_pdt) = first.datetime {
				if pdt_delta(anchor_pdt, first_pdt) <= Duration::from_millis(20) {
					return Some(SyncOutcome {
						new_idx: 0,
						method: SyncMethod::Pdt,
						virtual_preceding: true,
					});
				}
			}
		}
	}

	if !new.is_live() {
		if let Some(idx) = new.segments.iter().position(|s| {
			let end = s.stream_time.saturating_add(s.duration);
			anchor.stream_time >= s.stream_time && anchor.stream_time < end
		}) {
			return Some(SyncOutcome {
				new_idx: idx,
				method: SyncMethod::StreamTime,
				virtual_preceding: false,
			});
		}
	}

	if let Some(idx) = new.segments.iter().position(|s| {
		s.sequence == anchor.sequence && (!new.has_ext_x_dsn || s.discont_sequence == anchor.discont_sequence)
	}) {
		return Some(SyncOutcome {
			new_idx: idx,
			method: SyncMethod::Msn,
			virtual_preceding: false,
		});
	}

	None
}

fn pdt_delta(a: DateTime<Utc>, b: DateTime<Utc>) -> Duration {
	Duration::from_millis((a - b).num_milliseconds().unsigned_abs())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::playlist::media::parse_media;
	use crate::uri::Uri;
	use std::sync::Arc;

	fn playlist(body: &str) -> MediaPlaylist {
		let uri = Uri::parse("https://cdn.example/live.m3u8").unwrap();
		parse_media(body, &uri, None).unwrap()
	}

	#[test]
	fn small_drift_is_a_noop() {
		let mut registry = TimeMapRegistry::new();
		registry.seed_or_overwrite(0, StreamTime::from_nanos(0), 0, None, true, true);
		let p = Arc::new(playlist("#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.0,\nseg0.ts\n"));
		let walker = SegmentWalker::new(p);
		let outcome = registry.reconcile(&walker, 0, StreamTime::from_nanos(1_000_000), 1_005_000, Duration::from_secs(6), false);
		assert_eq!(outcome, Reconciliation::NoOp);
	}

	#[test]
	fn moderate_drift_adjusts_in_place() {
		let mut registry = TimeMapRegistry::new();
		registry.seed_or_overwrite(0, StreamTime::from_nanos(0), 0, None, true, true);
		let p = Arc::new(playlist("#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.0,\nseg0.ts\n"));
		let walker = SegmentWalker::new(p);
		// real_stream_time = 0 + 1_000_000_000ns; current stream_time is 0 -> drift 1s, within 3s (half of 6s).
		let outcome = registry.reconcile(&walker, 0, StreamTime::ZERO, 1_000_000_000, Duration::from_secs(6), false);
		assert_eq!(outcome, Reconciliation::Adjusted { stream_time: StreamTime::from_nanos(1_000_000_000) });
	}

	#[test]
	fn dsn_repair_propagates_from_anchor() {
		let mut p = playlist(
			"#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg0.ts\n#EXT-X-DISCONTINUITY\n#EXTINF:4.0,\nseg1.ts\n#EXTINF:4.0,\nseg2.ts\n#EXT-X-ENDLIST\n",
		);
		repair_dsn(&mut p, 0, 5);
		assert_eq!(p.segments[0].discont_sequence, 5);
		assert_eq!(p.segments[1].discont_sequence, 6);
		assert_eq!(p.segments[2].discont_sequence, 6);
	}

	#[test]
	fn stream_time_repair_recomputes_forward_and_backward() {
		let mut p = playlist(
			"#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg0.ts\n#EXTINF:4.0,\nseg1.ts\n#EXTINF:4.0,\nseg2.ts\n#EXT-X-ENDLIST\n",
		);
		repair_stream_time(&mut p, 1, StreamTime::from_nanos(100_000_000_000));
		assert_eq!(p.segments[0].stream_time, StreamTime::from_nanos(96_000_000_000));
		assert_eq!(p.segments[1].stream_time, StreamTime::from_nanos(100_000_000_000));
		assert_eq!(p.segments[2].stream_time, StreamTime::from_nanos(104_000_000_000));
	}

	#[test]
	fn synchronize_falls_back_to_msn_when_uri_changed() {
		let prev = playlist("#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:5\n#EXTINF:4.0,\nold5.ts\n");
		let new = playlist("#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:5\n#EXTINF:4.0,\nnew5.ts\n");
		let outcome = synchronize(&prev.segments[0], &new).unwrap();
		assert_eq!(outcome.method, SyncMethod::Msn);
		assert_eq!(outcome.new_idx, 0);
	}

	#[test]
	fn synchronize_returns_none_on_total_mismatch() {
		let prev = playlist("#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:5\n#EXTINF:4.0,\nold5.ts\n");
		let new = playlist("#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:99\n#EXTINF:4.0,\nnew99.ts\n");
		assert!(synchronize(&prev.segments[0], &new).is_none());
	}
}
