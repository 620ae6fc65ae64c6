//! Media (rendition) playlist model and single-pass parser (spec.md §3, §4.1).

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::attrs::Attributes;
use crate::error::{Error, Result};
use crate::time::StreamTime;
use crate::uri::{self, Uri};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMethod {
	None,
	Aes128,
}

#[derive(Debug, Clone)]
pub struct Key {
	pub method: KeyMethod,
	pub uri: Option<Uri>,
	pub iv: [u8; 16],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistType {
	Undefined,
	Event,
	Vod,
}

/// Equality is by `(uri, offset, size)` per spec.md §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitFile {
	pub uri: Uri,
	pub offset: u64,
	pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadHintKind {
	Map,
	Part,
}

#[derive(Debug, Clone)]
pub struct PreloadHint {
	pub kind: PreloadHintKind,
	pub uri: Uri,
	pub offset: u64,
	pub size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PartialSegment {
	pub uri: Uri,
	pub offset: u64,
	pub size: Option<u64>,
	pub duration: Duration,
	pub stream_time: StreamTime,
	pub independent: bool,
	pub is_gap: bool,
}

#[derive(Debug, Clone)]
pub struct MediaSegment {
	pub sequence: u64,
	pub discont_sequence: u64,
	pub uri: Uri,
	pub title: Option<String>,
	pub duration: Duration,
	pub stream_time: StreamTime,
	pub datetime: Option<DateTime<Utc>>,
	pub discont: bool,
	pub is_gap: bool,
	pub partial_only: bool,
	pub key: Option<Key>,
	pub offset: u64,
	pub size: Option<u64>,
	pub init_file: Option<InitFile>,
	pub partial_segments: Vec<PartialSegment>,
}

#[derive(Debug, Clone)]
pub struct MediaPlaylist {
	pub uri: Uri,
	pub base_uri: Uri,
	/// Wall-clock instant the response was received, used by the loader's
	/// reload-interval math (spec.md §4.2). Opaque to the parser: always
	/// `None` immediately after `parse_media`, set by the loader.
	pub request_time: Option<std::time::Instant>,
	pub version: Option<u32>,
	pub target_duration: Duration,
	pub partial_target_duration: Option<Duration>,
	pub media_sequence: u64,
	pub discont_sequence: u64,
	pub has_ext_x_dsn: bool,
	pub endlist: bool,
	pub playlist_type: PlaylistType,
	pub i_frame_only: bool,
	pub allow_cache: bool,
	pub ext_x_key_present: bool,
	pub ext_x_pdt_present: bool,
	pub independent_segments: bool,
	pub segments: Vec<MediaSegment>,
	pub preload_hints: Vec<PreloadHint>,
	pub duration: Duration,
	pub reloaded: bool,
	pub skip_boundary: Option<Duration>,
	pub can_skip_dateranges: bool,
	pub hold_back: Option<Duration>,
	pub part_hold_back: Option<Duration>,
	pub can_block_reload: bool,
	pub skipped_segments: u64,
}

impl MediaPlaylist {
	pub fn is_live(&self) -> bool {
		!self.endlist
	}

	pub fn last_segment(&self) -> Option<&MediaSegment> {
		self.segments.last()
	}
}

#[derive(Default)]
struct Staged {
	duration: Option<Duration>,
	title: Option<String>,
	discont: bool,
	datetime: Option<DateTime<Utc>>,
	key: Option<Key>,
	offset: Option<u64>,
	size: Option<u64>,
	is_gap: bool,
	init_file: Option<InitFile>,
	partials: Vec<PartialSegment>,
}

impl Staged {
	fn take(&mut self) -> Self {
		std::mem::replace(
			self,
			Staged {
				key: self.key.clone(),
				init_file: self.init_file.clone(),
				..Default::default()
			},
		)
	}
}

fn parse_byterange(raw: &str, prev_offset: u64, prev_size: Option<u64>) -> Option<(u64, u64)> {
	let (size, offset) = match raw.split_once('@') {
		Some((size, offset)) => (size.parse().ok()?, Some(offset.parse().ok()?)),
		None => (raw.parse().ok()?, None),
	};
	let offset = match offset {
		Some(o) => o,
		None => prev_offset + prev_size.unwrap_or(0),
	};
	Some((offset, size))
}

fn parse_iv(hex_str: &str) -> [u8; 16] {
	let hex_str = hex_str.trim_start_matches("0x").trim_start_matches("0X");
	let mut iv = [0u8; 16];
	if let Ok(bytes) = hex::decode(hex_str) {
		let n = bytes.len().min(16);
		iv[16 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
	}
	iv
}

fn msn_as_iv(msn: u64) -> [u8; 16] {
	let mut iv = [0u8; 16];
	iv[12..].copy_from_slice(&(msn as u32).to_be_bytes());
	iv
}

/// Parse a media playlist. `uri`/`base_uri` are both the playlist's own
/// location unless the caller overrides `base_uri` (spec.md §6).
pub fn parse_media(body: &str, uri: &Uri, base_uri: Option<&Uri>) -> Result<MediaPlaylist> {
	let base_uri = base_uri.unwrap_or(uri).clone();

	let mut version = None;
	let mut target_duration = Duration::ZERO;
	let mut partial_target_duration = None;
	let mut media_sequence = 0u64;
	let mut discont_sequence = 0u64;
	let mut has_ext_x_dsn = false;
	let mut endlist = false;
	let mut playlist_type = PlaylistType::Undefined;
	let mut i_frame_only = false;
	let mut allow_cache = true;
	let mut ext_x_key_present = false;
	let mut ext_x_pdt_present = false;
	let mut independent_segments = false;
	let mut skip_boundary = None;
	let mut can_skip_dateranges = false;
	let mut hold_back = None;
	let mut part_hold_back = None;
	let mut can_block_reload = false;
	let mut skipped_segments = 0u64;
	let mut preload_hints = Vec::new();

	let mut segments: Vec<MediaSegment> = Vec::new();
	let mut staged = Staged::default();
	let mut next_sequence: Option<u64> = None;
	let mut cur_discont_sequence = 0u64;

	for line in body.lines() {
		let line = line.trim_end_matches('\r');
		if line.is_empty() {
			continue;
		}

		if let Some(rest) = line.strip_prefix("#EXTINF:") {
			let (dur_str, title) = rest.split_once(',').unwrap_or((rest, ""));
			let secs: f64 = dur_str.trim().parse().unwrap_or(0.0);
			staged.duration = Some(Duration::from_secs_f64(secs.max(0.0)));
			staged.title = if title.is_empty() { None } else { Some(title.to_string()) };
		} else if let Some(rest) = line.strip_prefix("#EXT-X-BYTERANGE:") {
			let prev = segments.last();
			let (prev_offset, prev_size) = match prev {
				Some(s) => (s.offset, s.size),
				None => (0, None),
			};
			if let Some((offset, size)) = parse_byterange(rest.trim(), prev_offset, prev_size) {
				staged.offset = Some(offset);
				staged.size = Some(size);
			} else {
				tracing::warn!("EXT-X-BYTERANGE without a preceding segment, skipping");
			}
		} else if let Some(rest) = line.strip_prefix("#EXT-X-KEY:") {
			ext_x_key_present = true;
			let attrs = Attributes::parse(rest);
			match attrs.get("METHOD") {
				Some("NONE") => staged.key = Some(Key { method: KeyMethod::None, uri: None, iv: [0; 16] }),
				Some("AES-128") => {
					let key_uri = attrs.get("URI").and_then(|u| uri::resolve(&base_uri, u).ok());
					let iv = attrs.get("IV").map(parse_iv);
					staged.key = Some(Key {
						method: KeyMethod::Aes128,
						uri: key_uri,
						// Filled with the owning segment's MSN if IV was absent.
						iv: iv.unwrap_or([0; 16]),
					});
					if attrs.get("IV").is_none() {
						// Marker: real IV computed from MSN when segment is emitted.
					}
				}
				Some(other) => tracing::warn!(method = other, "ignoring unsupported EXT-X-KEY method"),
				None => {}
			}
		} else if let Some(rest) = line.strip_prefix("#EXT-X-MAP:") {
			let attrs = Attributes::parse(rest);
			if let Some(u) = attrs.get("URI") {
				let resolved = uri::resolve(&base_uri, u)?;
				let (offset, size) = attrs
					.get("BYTERANGE")
					.and_then(|r| parse_byterange(r, 0, None))
					.map(|(o, s)| (o, Some(s)))
					.unwrap_or((0, None));
				staged.init_file = Some(InitFile { uri: resolved, offset, size });
			}
		} else if let Some(rest) = line.strip_prefix("#EXT-X-PART:") {
			let attrs = Attributes::parse(rest);
			if let Some(u) = attrs.get("URI") {
				let resolved = uri::resolve(&base_uri, u)?;
				let dur = Duration::from_secs_f64(attrs.get_f64("DURATION").unwrap_or(0.0));
				let (offset, size) = attrs
					.get("BYTERANGE")
					.and_then(|r| parse_byterange(r, 0, None))
					.map(|(o, s)| (o, Some(s)))
					.unwrap_or((0, None));
				staged.partials.push(PartialSegment {
					uri: resolved,
					offset,
					size,
					duration: dur,
					stream_time: StreamTime::ZERO,
					independent: attrs.get_bool("INDEPENDENT"),
					is_gap: attrs.get_bool("GAP"),
				});
			}
		} else if let Some(rest) = line.strip_prefix("#EXT-X-PART-INF:") {
			let attrs = Attributes::parse(rest);
			partial_target_duration = attrs.get_f64("PART-TARGET").map(Duration::from_secs_f64);
		} else if let Some(rest) = line.strip_prefix("#EXT-X-SERVER-CONTROL:") {
			let attrs = Attributes::parse(rest);
			skip_boundary = attrs.get_f64("CAN-SKIP-UNTIL").map(Duration::from_secs_f64);
			can_skip_dateranges = attrs.get_bool("CAN-SKIP-DATERANGES");
			hold_back = attrs.get_f64("HOLD-BACK").map(Duration::from_secs_f64);
			part_hold_back = attrs.get_f64("PART-HOLD-BACK").map(Duration::from_secs_f64);
			can_block_reload = attrs.get_bool("CAN-BLOCK-RELOAD");
		} else if let Some(rest) = line.strip_prefix("#EXT-X-PRELOAD-HINT:") {
			let attrs = Attributes::parse(rest);
			if let Some(u) = attrs.get("URI") {
				let kind = match attrs.get("TYPE") {
					Some("PART") => PreloadHintKind::Part,
					_ => PreloadHintKind::Map,
				};
				if !preload_hints.iter().any(|h: &PreloadHint| h.kind == kind) {
					preload_hints.push(PreloadHint {
						kind,
						uri: uri::resolve(&base_uri, u)?,
						offset: attrs.get_u64("BYTERANGE-START").unwrap_or(0),
						size: attrs.get_u64("BYTERANGE-LENGTH"),
					});
				}
			}
		} else if let Some(rest) = line.strip_prefix("#EXT-X-SKIP:") {
			let attrs = Attributes::parse(rest);
			skipped_segments = attrs.get_u64("SKIPPED-SEGMENTS").unwrap_or(0);
			next_sequence = Some(next_sequence.unwrap_or(media_sequence) + skipped_segments);
		} else if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
			media_sequence = rest.trim().parse().unwrap_or(0);
			next_sequence.get_or_insert(media_sequence);
		} else if let Some(rest) = line.strip_prefix("#EXT-X-DISCONTINUITY-SEQUENCE:") {
			discont_sequence = rest.trim().parse().unwrap_or(0);
			cur_discont_sequence = discont_sequence;
			has_ext_x_dsn = true;
		} else if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
			target_duration = Duration::from_secs(rest.trim().parse().unwrap_or(0));
		} else if let Some(rest) = line.strip_prefix("#EXT-X-PLAYLIST-TYPE:") {
			playlist_type = match rest.trim() {
				"EVENT" => PlaylistType::Event,
				"VOD" => PlaylistType::Vod,
				_ => PlaylistType::Undefined,
			};
		} else if let Some(rest) = line.strip_prefix("#EXT-X-VERSION:") {
			version = rest.trim().parse().ok();
		} else if line == "#EXT-X-ENDLIST" {
			endlist = true;
		} else if line == "#EXT-X-I-FRAMES-ONLY" {
			i_frame_only = true;
		} else if line == "#EXT-X-DISCONTINUITY" {
			staged.discont = true;
		} else if line == "#EXT-X-GAP" {
			staged.is_gap = true;
		} else if line == "#EXT-X-INDEPENDENT-SEGMENTS" {
			independent_segments = true;
		} else if let Some(rest) = line.strip_prefix("#EXT-X-ALLOW-CACHE:") {
			// Deprecated (RFC 8216 §4.3.2.3, "removed in protocol version 7")
			// but still emitted by some encoders; parsed-and-stored only.
			allow_cache = rest.trim().eq_ignore_ascii_case("YES");
		} else if let Some(rest) = line.strip_prefix("#EXT-X-PROGRAM-DATE-TIME:") {
			ext_x_pdt_present = true;
			staged.datetime = DateTime::parse_from_rfc3339(rest.trim()).ok().map(|d| d.with_timezone(&Utc));
		} else if line.starts_with("#EXT-X-PROGRAM-ID") || line.starts_with("#EXT-X-START") {
			// Recognised-but-inert for a media playlist context.
		} else if let Some(trimmed) = line.strip_prefix('#') {
			if !trimmed.starts_with("EXT") {
				// Comment line, not a tag.
			} else {
				tracing::debug!(tag = trimmed, "ignoring unrecognised tag");
			}
		} else {
			// A URI line. Only meaningful when preceded by EXTINF.
			let Some(duration) = staged.duration else {
				tracing::warn!(line, "URI line without preceding EXTINF, skipping");
				continue;
			};
			let resolved = uri::resolve(&base_uri, line.trim())?;
			let sequence = next_sequence.unwrap_or(media_sequence);
			next_sequence = Some(sequence + 1);

			if staged.discont {
				cur_discont_sequence += 1;
			}

			// Duplicate (same URI, same offset, no intervening discontinuity).
			if let Some(prev) = segments.last() {
				if !staged.discont && prev.uri == resolved && prev.offset == staged.offset.unwrap_or(0) {
					staged = staged.take();
					continue;
				}
			}

			let mut taken = staged.take();
			let key = taken.key.take().map(|mut k| {
				if k.method == KeyMethod::Aes128 && k.iv == [0; 16] {
					k.iv = msn_as_iv(sequence);
				}
				k
			});

			segments.push(MediaSegment {
				sequence,
				discont_sequence: cur_discont_sequence,
				uri: resolved,
				title: taken.title,
				duration,
				stream_time: StreamTime::ZERO,
				datetime: taken.datetime,
				discont: taken.discont,
				is_gap: taken.is_gap,
				partial_only: false,
				key,
				offset: taken.offset.unwrap_or(0),
				size: taken.size,
				init_file: taken.init_file,
				partial_segments: taken.partials,
			});
		}
	}

	// Trailing staged partials with no following EXTINF: synthetic last segment.
	if !staged.partials.is_empty() {
		let sequence = next_sequence.unwrap_or(media_sequence);
		let duration = staged.partials.iter().map(|p| p.duration).sum();
		segments.push(MediaSegment {
			sequence,
			discont_sequence: cur_discont_sequence,
			uri: staged.partials[0].uri.clone(),
			title: None,
			duration,
			stream_time: StreamTime::ZERO,
			datetime: staged.datetime,
			discont: staged.discont,
			is_gap: false,
			partial_only: true,
			key: staged.key.clone(),
			offset: 0,
			size: None,
			init_file: staged.init_file.clone(),
			partial_segments: staged.partials,
		});
	}

	if segments.is_empty() {
		return Err(Error::ManifestMalformed("media playlist with no segments".into()));
	}

	if let Some(n) = next_sequence {
		media_sequence = n.saturating_sub(segments.len() as u64);
	}

	if !has_ext_x_dsn {
		for s in &mut segments {
			s.discont_sequence = 0;
		}
		discont_sequence = 0;
	}

	if ext_x_pdt_present {
		repair_pdt(&mut segments);
	}

	let is_vod = endlist;
	if is_vod {
		compute_prefix_sums(&mut segments);
	}

	let total_duration = segments.iter().map(|s| s.duration).sum();

	Ok(MediaPlaylist {
		uri: uri.clone(),
		base_uri,
		request_time: None,
		version,
		target_duration,
		partial_target_duration,
		media_sequence,
		discont_sequence,
		has_ext_x_dsn,
		endlist,
		playlist_type,
		i_frame_only,
		allow_cache,
		ext_x_key_present,
		ext_x_pdt_present,
		independent_segments,
		segments,
		preload_hints,
		duration: total_duration,
		reloaded: false,
		skip_boundary,
		can_skip_dateranges,
		hold_back,
		part_hold_back,
		can_block_reload,
		skipped_segments,
	})
}

/// Forward-then-backward PDT gap repair (spec.md §4.1 post-processing #1).
fn repair_pdt(segments: &mut [MediaSegment]) {
	const TOLERANCE: Duration = Duration::from_millis(500);

	for i in 1..segments.len() {
		if segments[i].discont {
			continue;
		}
		let Some(prev_pdt) = segments[i - 1].datetime else { continue };
		let expected = prev_pdt + chrono::Duration::from_std(segments[i - 1].duration).unwrap_or_default();
		match segments[i].datetime {
			None => segments[i].datetime = Some(expected),
			Some(actual) => {
				let delta = (actual - expected).num_milliseconds().unsigned_abs();
				if Duration::from_millis(delta) > TOLERANCE {
					segments[i].datetime = Some(expected);
				}
			}
		}
	}

	if let Some(first_known) = segments.iter().position(|s| s.datetime.is_some()) {
		for i in (0..first_known).rev() {
			let next_pdt = segments[i + 1].datetime.unwrap();
			segments[i].datetime = Some(next_pdt - chrono::Duration::from_std(segments[i].duration).unwrap_or_default());
		}
	}
}

/// VOD-only: absolute `stream_time` by prefix sum from zero (spec.md §4.1
/// post-processing #3), including per-partial prefix sums within a segment.
fn compute_prefix_sums(segments: &mut [MediaSegment]) {
	let mut cursor = StreamTime::ZERO;
	for segment in segments.iter_mut() {
		segment.stream_time = cursor;
		let mut part_cursor = cursor;
		for part in segment.partial_segments.iter_mut() {
			part.stream_time = part_cursor;
			part_cursor = part_cursor.saturating_add(part.duration);
		}
		cursor = cursor.saturating_add(segment.duration);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn uri(s: &str) -> Uri {
		Uri::parse(s).unwrap()
	}

	#[test]
	fn basic_vod_stream_times_are_prefix_sums() {
		let body = "#EXTM3U\n\
#EXT-X-TARGETDURATION:6\n\
#EXT-X-MEDIA-SEQUENCE:0\n\
#EXTINF:6.0,\n\
seg0.ts\n\
#EXTINF:6.0,\n\
seg1.ts\n\
#EXTINF:4.0,\n\
seg2.ts\n\
#EXT-X-ENDLIST\n";
		let u = uri("https://cdn.example/low.m3u8");
		let playlist = parse_media(body, &u, None).unwrap();
		assert_eq!(playlist.segments.len(), 3);
		assert_eq!(playlist.segments[0].stream_time, StreamTime::ZERO);
		assert_eq!(playlist.segments[1].stream_time, StreamTime::from_nanos(6_000_000_000));
		assert_eq!(playlist.segments[2].stream_time, StreamTime::from_nanos(12_000_000_000));
		assert_eq!(playlist.duration, Duration::from_secs(16));
	}

	#[test]
	fn missing_discontinuity_sequence_forces_dsn_zero() {
		let body = "#EXTM3U\n\
#EXT-X-TARGETDURATION:4\n\
#EXTINF:4.0,\n\
seg0.ts\n\
#EXT-X-DISCONTINUITY\n\
#EXTINF:4.0,\n\
seg1.ts\n\
#EXT-X-ENDLIST\n";
		let u = uri("https://cdn.example/low.m3u8");
		let playlist = parse_media(body, &u, None).unwrap();
		assert!(!playlist.has_ext_x_dsn);
		assert_eq!(playlist.segments[0].discont_sequence, 0);
		assert_eq!(playlist.segments[1].discont_sequence, 0);
		assert!(playlist.segments[1].discont);
	}

	#[test]
	fn trailing_partials_become_partial_only_segment() {
		let body = "#EXTM3U\n\
#EXT-X-TARGETDURATION:4\n\
#EXT-X-PART-INF:PART-TARGET=1.0\n\
#EXT-X-MEDIA-SEQUENCE:10\n\
#EXTINF:4.0,\n\
seg10.ts\n\
#EXT-X-PART:DURATION=1.0,URI=\"seg11.0.ts\"\n\
#EXT-X-PART:DURATION=1.0,URI=\"seg11.1.ts\"\n";
		let u = uri("https://cdn.example/live.m3u8");
		let playlist = parse_media(body, &u, None).unwrap();
		assert_eq!(playlist.segments.len(), 2);
		let last = &playlist.segments[1];
		assert!(last.partial_only);
		assert_eq!(last.sequence, 11);
		assert_eq!(last.partial_segments.len(), 2);
	}

	#[test]
	fn byterange_without_offset_chains_from_previous() {
		let body = "#EXTM3U\n\
#EXT-X-TARGETDURATION:4\n\
#EXTINF:4.0,\n\
#EXT-X-BYTERANGE:1000@0\n\
seg.ts\n\
#EXTINF:4.0,\n\
#EXT-X-BYTERANGE:500\n\
seg.ts\n\
#EXT-X-ENDLIST\n";
		let u = uri("https://cdn.example/live.m3u8");
		let playlist = parse_media(body, &u, None).unwrap();
		assert_eq!(playlist.segments[1].offset, 1000);
		assert_eq!(playlist.segments[1].size, Some(500));
	}

	#[test]
	fn aes128_key_without_iv_uses_msn() {
		let body = "#EXTM3U\n\
#EXT-X-TARGETDURATION:4\n\
#EXT-X-MEDIA-SEQUENCE:7\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"key\"\n\
#EXTINF:4.0,\n\
seg7.ts\n\
#EXT-X-ENDLIST\n";
		let u = uri("https://cdn.example/live.m3u8");
		let playlist = parse_media(body, &u, None).unwrap();
		let key = playlist.segments[0].key.as_ref().unwrap();
		assert_eq!(key.iv, msn_as_iv(7));
	}

	#[test]
	fn pdt_gap_is_repaired_when_drift_exceeds_tolerance() {
		let body = "#EXTM3U\n\
#EXT-X-TARGETDURATION:4\n\
#EXT-X-PROGRAM-DATE-TIME:2024-01-01T00:00:00.000Z\n\
#EXTINF:4.0,\n\
seg0.ts\n\
#EXT-X-PROGRAM-DATE-TIME:2024-01-01T00:00:10.000Z\n\
#EXTINF:4.0,\n\
seg1.ts\n\
#EXT-X-ENDLIST\n";
		let u = uri("https://cdn.example/live.m3u8");
		let playlist = parse_media(body, &u, None).unwrap();
		let expected = playlist.segments[0].datetime.unwrap() + chrono::Duration::seconds(4);
		assert_eq!(playlist.segments[1].datetime.unwrap(), expected);
	}

	#[test]
	fn empty_playlist_is_manifest_malformed() {
		let u = uri("https://cdn.example/empty.m3u8");
		assert!(parse_media("#EXTM3U\n#EXT-X-ENDLIST\n", &u, None).is_err());
	}
}
