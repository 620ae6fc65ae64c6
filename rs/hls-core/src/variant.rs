//! Variant/rendition controller (part of C5, spec.md §4.6): which variant
//! plays, when it switches, and how rendition groups and fallback URIs
//! follow along.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::playlist::master::{MasterPlaylist, RenditionType, VariantStream};
use crate::playlist::MediaPlaylist;
use crate::time::StreamTime;
use crate::uri::Uri;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantKind {
	Normal,
	IFrame,
}

/// A decision to move playback to a different variant stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchDecision {
	pub kind: VariantKind,
	pub index: usize,
	/// The next buffer on the new variant must be tagged `discont`.
	pub mark_discont: bool,
}

/// A decision to retarget one rendition group's loader.
#[derive(Debug, Clone)]
pub struct RenditionSwitch {
	pub rendition_type: RenditionType,
	pub group_id: String,
	pub uri: Uri,
}

pub struct VariantController {
	master: std::sync::Arc<MasterPlaylist>,
	current: usize,
	kind: VariantKind,
	failed: HashSet<String>,
	fallback_cursor: HashMap<String, usize>,
	bound_groups: HashMap<RenditionType, String>,
}

impl VariantController {
	pub fn new(master: std::sync::Arc<MasterPlaylist>, config: &RuntimeConfig) -> Self {
		let current = pick_initial(&master, config);
		let mut controller = Self {
			master,
			current,
			kind: VariantKind::Normal,
			failed: HashSet::new(),
			fallback_cursor: HashMap::new(),
			bound_groups: HashMap::new(),
		};
		controller.bind_groups_for_current();
		controller
	}

	pub fn current_variant(&self) -> &VariantStream {
		let list = match self.kind {
			VariantKind::Normal => &self.master.variants,
			VariantKind::IFrame => &self.master.iframe_variants,
		};
		&list[self.current]
	}

	fn bind_groups_for_current(&mut self) {
		let v = self.current_variant();
		let mut bound = HashMap::new();
		if let Some(g) = &v.audio_group {
			bound.insert(RenditionType::Audio, g.clone());
		}
		if let Some(g) = &v.video_group {
			bound.insert(RenditionType::Video, g.clone());
		}
		if let Some(g) = &v.subtitles_group {
			bound.insert(RenditionType::Subtitles, g.clone());
		}
		if let Some(g) = &v.closed_captions_group {
			bound.insert(RenditionType::ClosedCaptions, g.clone());
		}
		self.bound_groups = bound;
	}

	/// Bitrate-adaptive switching (spec.md §4.6). `at_segment_boundary` is
	/// true when the walker sits on a whole segment or `part_idx == 0`; a
	/// switch mid-partial-segment otherwise is refused.
	pub fn select_for_bandwidth(&mut self, measured_bps: u64, play_rate: f64, at_segment_boundary: bool) -> Option<SwitchDecision> {
		if self.kind != VariantKind::Normal || !at_segment_boundary {
			return None;
		}
		let budget = (measured_bps as f64 / play_rate.abs().max(f64::EPSILON)) as u64;

		let best = self
			.master
			.variants
			.iter()
			.enumerate()
			.filter(|(_, v)| !self.failed.contains(&v.name) && v.bandwidth <= budget)
			.max_by_key(|(_, v)| v.bandwidth)
			.or_else(|| {
				self.master
					.variants
					.iter()
					.enumerate()
					.filter(|(_, v)| !self.failed.contains(&v.name))
					.min_by_key(|(_, v)| v.bandwidth)
			})?;

		if best.0 == self.current {
			return None;
		}

		self.current = best.0;
		self.bind_groups_for_current();
		Some(SwitchDecision {
			kind: VariantKind::Normal,
			index: best.0,
			mark_discont: true,
		})
	}

	/// Trick-mode switching: `|rate| > 1` moves to the I-frame variant list;
	/// returning to `|rate| <= 1` moves back to the same-bandwidth normal
	/// variant (spec.md §4.6).
	pub fn set_play_rate(&mut self, rate: f64) -> Option<SwitchDecision> {
		let want_iframe = rate.abs() > 1.0;
		match (self.kind, want_iframe) {
			(VariantKind::Normal, true) => {
				if self.master.iframe_variants.is_empty() {
					return None;
				}
				let current_bandwidth = self.current_variant().bandwidth;
				let index = self
					.master
					.iframe_variants
					.iter()
					.enumerate()
					.min_by_key(|(_, v)| v.bandwidth.abs_diff(current_bandwidth))
					.map(|(i, _)| i)?;
				self.kind = VariantKind::IFrame;
				self.current = index;
				Some(SwitchDecision {
					kind: VariantKind::IFrame,
					index,
					mark_discont: true,
				})
			}
			(VariantKind::IFrame, false) => {
				let current_bandwidth = self.current_variant().bandwidth;
				let index = self
					.master
					.variants
					.iter()
					.enumerate()
					.min_by_key(|(_, v)| v.bandwidth.abs_diff(current_bandwidth))
					.map(|(i, _)| i)?;
				self.kind = VariantKind::Normal;
				self.current = index;
				self.bind_groups_for_current();
				Some(SwitchDecision {
					kind: VariantKind::Normal,
					index,
					mark_discont: true,
				})
			}
			_ => None,
		}
	}

	/// Compute rendition retargets needed after a variant switch: any group
	/// the new variant binds that differs from what's currently bound.
	pub fn rendition_switches(&mut self) -> Vec<RenditionSwitch> {
		let v = self.current_variant();
		let wanted: [(RenditionType, &Option<String>); 4] = [
			(RenditionType::Audio, &v.audio_group),
			(RenditionType::Video, &v.video_group),
			(RenditionType::Subtitles, &v.subtitles_group),
			(RenditionType::ClosedCaptions, &v.closed_captions_group),
		];

		let mut switches = Vec::new();
		for (kind, group) in wanted {
			let Some(group_id) = group else { continue };
			if self.bound_groups.get(&kind) == Some(group_id) {
				continue;
			}
			let Some(rendition) = self
				.master
				.renditions
				.iter()
				.find(|r| r.kind == kind && &r.group_id == group_id)
			else {
				continue;
			};
			let Some(uri) = &rendition.uri else { continue }; // muxed: nothing to retarget
			switches.push(RenditionSwitch {
				rendition_type: kind,
				group_id: group_id.clone(),
				uri: uri.clone(),
			});
		}

		self.bind_groups_for_current();
		switches
	}

	/// On a playlist load error for the current variant, try its next
	/// fallback URI before declaring the variant failed (spec.md §4.6).
	pub fn next_fallback_uri(&mut self) -> Option<Uri> {
		let v = self.current_variant();
		let name = v.name.clone();
		let next_idx = *self.fallback_cursor.get(&name).unwrap_or(&0);
		let uri = v.fallback_uris.get(next_idx).cloned();
		if uri.is_some() {
			self.fallback_cursor.insert(name, next_idx + 1);
		}
		uri
	}

	/// Mark the current variant unselectable and pick a replacement, or
	/// `None` if none remain (spec.md §7's `NoVariantRemains`).
	pub fn mark_current_failed(&mut self) -> Option<SwitchDecision> {
		let name = self.current_variant().name.clone();
		self.failed.insert(name);

		let list = match self.kind {
			VariantKind::Normal => &self.master.variants,
			VariantKind::IFrame => &self.master.iframe_variants,
		};
		let index = list.iter().enumerate().find(|(_, v)| !self.failed.contains(&v.name)).map(|(i, _)| i)?;

		self.current = index;
		self.bind_groups_for_current();
		Some(SwitchDecision {
			kind: self.kind,
			index,
			mark_discont: true,
		})
	}

	pub fn all_variants_failed(&self) -> bool {
		let list = match self.kind {
			VariantKind::Normal => &self.master.variants,
			VariantKind::IFrame => &self.master.iframe_variants,
		};
		list.iter().all(|v| self.failed.contains(&v.name))
	}
}

/// Initial variant pick (spec.md §4.6): the highest variant at or under
/// `start_bitrate` and above `min_bitrate`, or the master's default variant
/// when `start_bitrate == 0`.
fn pick_initial(master: &MasterPlaylist, config: &RuntimeConfig) -> usize {
	if config.start_bitrate == 0 {
		return master.default_variant;
	}
	master
		.variants
		.iter()
		.enumerate()
		.filter(|(_, v)| v.bandwidth <= config.start_bitrate as u64 && v.bandwidth >= config.min_bitrate as u64)
		.max_by_key(|(_, v)| v.bandwidth)
		.map(|(i, _)| i)
		.unwrap_or(master.default_variant)
}

/// Live seek range (spec.md §4.6): `[first.stream_time, last.stream_time +
/// last.duration - hold_back]`, the right endpoint being the same live-edge
/// target the walker's `starting_segment` computes.
pub fn live_seek_range(playlist: &MediaPlaylist, hold_back: Duration) -> Option<(StreamTime, StreamTime)> {
	let first = playlist.segments.first()?;
	let last = playlist.segments.last()?;
	let live_edge = last.stream_time.saturating_add(last.duration);
	Some((first.stream_time, live_edge.saturating_sub(hold_back)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::playlist::master::parse_master;

	fn master(body: &str) -> std::sync::Arc<MasterPlaylist> {
		let base = Uri::parse("https://cdn.example/master.m3u8").unwrap();
		std::sync::Arc::new(parse_master(body, &base).unwrap())
	}

	fn three_variants() -> std::sync::Arc<MasterPlaylist> {
		master(
			"#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=200000\nlow.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000\nmid.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=3000000\nhigh.m3u8\n",
		)
	}

	#[test]
	fn initial_pick_honours_start_bitrate() {
		let m = three_variants();
		let config = RuntimeConfig {
			start_bitrate: 1_000_000,
			..Default::default()
		};
		let controller = VariantController::new(m, &config);
		assert_eq!(controller.current_variant().bandwidth, 800_000);
	}

	#[test]
	fn zero_start_bitrate_uses_default_variant() {
		let m = three_variants();
		let controller = VariantController::new(m, &RuntimeConfig::default());
		assert_eq!(controller.current_variant().bandwidth, 3_000_000);
	}

	#[test]
	fn bandwidth_switch_picks_highest_affordable_variant() {
		let m = three_variants();
		let mut controller = VariantController::new(m, &RuntimeConfig::default());
		let decision = controller.select_for_bandwidth(900_000, 1.0, true).unwrap();
		assert_eq!(decision.index, 1); // mid, 800k <= 900k budget
		assert_eq!(controller.current_variant().bandwidth, 800_000);
	}

	#[test]
	fn bandwidth_switch_is_refused_mid_partial_segment() {
		let m = three_variants();
		let mut controller = VariantController::new(m, &RuntimeConfig::default());
		assert!(controller.select_for_bandwidth(100_000, 1.0, false).is_none());
	}

	#[test]
	fn mark_failed_advances_to_next_variant() {
		let m = three_variants();
		let config = RuntimeConfig {
			start_bitrate: 3_000_000,
			..Default::default()
		};
		let mut controller = VariantController::new(m, &config);
		assert_eq!(controller.current_variant().bandwidth, 3_000_000);
		let decision = controller.mark_current_failed().unwrap();
		assert_eq!(controller.current_variant().bandwidth, controller.master.variants[decision.index].bandwidth);
		assert_ne!(controller.current_variant().bandwidth, 3_000_000);
	}

	#[test]
	fn live_seek_range_subtracts_hold_back() {
		let uri = Uri::parse("https://cdn.example/live.m3u8").unwrap();
		let body = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg0.ts\n#EXTINF:4.0,\nseg1.ts\n#EXT-X-ENDLIST\n";
		let playlist = crate::playlist::media::parse_media(body, &uri, None).unwrap();
		let (start, end) = live_seek_range(&playlist, Duration::from_secs(2)).unwrap();
		assert_eq!(start, StreamTime::ZERO);
		assert_eq!(end, StreamTime::from_nanos(6_000_000_000));
	}
}
