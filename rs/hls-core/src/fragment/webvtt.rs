//! WebVTT cue scan and timestamp-map resolution (spec.md §4.4 step 3,
//! §9's open question on `X-TIMESTAMP-MAP` consistency across a rendition).

use crate::time::StreamTime;

/// The `X-TIMESTAMP-MAP` header: an MPEG-TS clock value paired with the
/// local (in-file) cue time it corresponds to. Attributes may appear in
/// either order, per RFC 8216 §3.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampMap {
	pub mpegts_ticks: u64,
	pub local: std::time::Duration,
}

/// A single cue's local timing, ignoring cue settings and payload text
/// beyond whether it carries any non-whitespace content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cue {
	pub start: std::time::Duration,
	pub end: std::time::Duration,
	pub has_text: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedVtt {
	pub timestamp_map: Option<TimestampMap>,
	pub cues: Vec<Cue>,
}

/// Parse a WebVTT document body, extracting the header's timestamp map (if
/// present) and every cue's timing.
pub fn parse(body: &str) -> ParsedVtt {
	let mut out = ParsedVtt::default();
	for block in body.split("\n\n").flat_map(|b| b.split("\r\n\r\n")) {
		for line in block.lines() {
			if let Some(rest) = line.strip_prefix("X-TIMESTAMP-MAP=") {
				out.timestamp_map = parse_timestamp_map(rest);
			}
		}
		if let Some(cue) = parse_cue_block(block) {
			out.cues.push(cue);
		}
	}
	out
}

fn parse_timestamp_map(attrs: &str) -> Option<TimestampMap> {
	let mut mpegts = None;
	let mut local = None;
	for field in attrs.split(',') {
		let field = field.trim();
		if let Some(v) = field.strip_prefix("MPEGTS:") {
			mpegts = v.trim().parse::<u64>().ok();
		} else if let Some(v) = field.strip_prefix("LOCAL:") {
			local = parse_vtt_timestamp(v.trim());
		}
	}
	Some(TimestampMap {
		mpegts_ticks: mpegts?,
		local: local?,
	})
}

fn parse_cue_block(block: &str) -> Option<Cue> {
	let mut lines = block.lines();
	let mut timing_line = None;
	for line in lines.by_ref() {
		if line.contains("-->") {
			timing_line = Some(line);
			break;
		}
	}
	let timing_line = timing_line?;
	let mut parts = timing_line.splitn(2, "-->");
	let start = parse_vtt_timestamp(parts.next()?.trim())?;
	let rest = parts.next()?.trim();
	let end_token = rest.split_whitespace().next()?;
	let end = parse_vtt_timestamp(end_token)?;

	let has_text = lines.any(|l| !l.trim().is_empty());

	Some(Cue { start, end, has_text })
}

/// Parse `HH:MM:SS.mmm` or `MM:SS.mmm`.
fn parse_vtt_timestamp(s: &str) -> Option<std::time::Duration> {
	let (secs_field, millis_field) = s.split_once('.')?;
	let millis: u64 = millis_field.parse().ok()?;
	let fields: Vec<&str> = secs_field.split(':').collect();
	let (hours, minutes, seconds) = match fields.as_slice() {
		[h, m, s] => (h.parse().ok()?, m.parse::<u64>().ok()?, s.parse::<u64>().ok()?),
		[m, s] => (0u64, m.parse().ok()?, s.parse::<u64>().ok()?),
		_ => return None,
	};
	let total_millis = ((hours * 3600 + minutes * 60 + seconds) * 1000) + millis;
	Some(std::time::Duration::from_millis(total_millis))
}

/// Map a cue's local time into stream time using the fragment's timestamp
/// map and the active 90 kHz-to-stream-time offset established by the time
/// map registry (`origin` is that offset expressed as a `StreamTime`).
///
/// `stream_time(cue) = origin + (cue.start - map.local)`, clamped to zero if
/// the subtraction would underflow (a cue timed before the map's anchor).
pub fn cue_stream_time(cue: &Cue, map: &TimestampMap, origin: StreamTime) -> StreamTime {
	if cue.start >= map.local {
		origin.saturating_add(cue.start - map.local)
	} else {
		origin.saturating_sub(map.local - cue.start)
	}
}

/// Whether a cue's mapped stream time falls far enough outside `[seg_start,
/// seg_end]` to warrant a resync rather than simple drift absorption
/// (spec.md §4.5's non-discontinuity drift handling applied to subtitles).
pub fn needs_resync(mapped: StreamTime, seg_start: StreamTime, seg_end: std::time::Duration) -> bool {
	let seg_end_ts = seg_start.saturating_add(seg_end);
	mapped < seg_start || mapped > seg_end_ts.saturating_add(seg_end)
}

/// True if none of the parsed cues carry displayable text -- the fragment
/// should still synthesize an empty buffer spanning the segment so gaps in
/// the subtitle track stay explicit rather than silently absent.
pub fn is_empty_of_text(parsed: &ParsedVtt) -> bool {
	!parsed.cues.iter().any(|c| c.has_text)
}
