//! Multivariant (master) playlist model and parser (spec.md §3, §4.1).

use sha1::{Digest, Sha1};
use std::collections::HashSet;

use super::attrs::Attributes;
use crate::error::{Error, Result};
use crate::uri::{self, Uri};

/// Which elementary stream kinds a set of `CODECS` tokens implies.
///
/// Mirrors `GstStreamType`'s audio/video/text bits in the original
/// `gsthlsdemux` (`gst_hls_get_stream_type_from_caps`), used both to decide
/// whether a variant is "audio-only" (§4.1 step 3) and to compute the
/// per-type caps handed to rendition groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamTypeMask {
	pub audio: bool,
	pub video: bool,
	pub subtitles: bool,
}

impl StreamTypeMask {
	pub fn union(self, other: Self) -> Self {
		Self {
			audio: self.audio || other.audio,
			video: self.video || other.video,
			subtitles: self.subtitles || other.subtitles,
		}
	}

	pub fn is_audio_only(self) -> bool {
		self.audio && !self.video && !self.subtitles
	}

	pub fn is_empty(self) -> bool {
		!self.audio && !self.video && !self.subtitles
	}
}

/// A codec intersection: the set of `CODECS` tokens belonging to one
/// elementary stream kind of one variant (spec.md §3's "caps").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caps {
	pub codecs: Vec<String>,
}

impl Caps {
	fn is_empty(&self) -> bool {
		self.codecs.is_empty()
	}

	/// Remove the tokens of `other` from `self`, the Rust equivalent of the
	/// original's `gst_caps_subtract` call when a rendition owns its own URI.
	fn subtract(&mut self, other: &Caps) {
		self.codecs.retain(|c| !other.codecs.contains(c));
	}
}

fn classify_codec(token: &str) -> StreamTypeMask {
	let token = token.trim();
	if token.starts_with("avc1")
		|| token.starts_with("avc3")
		|| token.starts_with("hev1")
		|| token.starts_with("hvc1")
		|| token.starts_with("vp09")
		|| token.starts_with("vp9")
		|| token.starts_with("av01")
	{
		StreamTypeMask { video: true, ..Default::default() }
	} else if token.starts_with("mp4a") || token.starts_with("ac-3") || token.starts_with("ec-3") || token.starts_with("opus") {
		StreamTypeMask { audio: true, ..Default::default() }
	} else if token.starts_with("wvtt") || token.starts_with("stpp") {
		StreamTypeMask { subtitles: true, ..Default::default() }
	} else {
		StreamTypeMask::default()
	}
}

fn caps_for_mask(codecs: &[String], want: impl Fn(StreamTypeMask) -> bool) -> Caps {
	Caps {
		codecs: codecs.iter().filter(|c| want(classify_codec(c))).cloned().collect(),
	}
}

/// One bandwidth/resolution option described by `#EXT-X-STREAM-INF`.
#[derive(Debug, Clone)]
pub struct VariantStream {
	/// Stable synthetic name: `variant-<bandwidth>-<sha1(uri)[..8]>`.
	pub name: String,
	pub uri: Uri,
	/// Alternate URIs for the same rendered content, tried in order on
	/// playlist-load failure (spec.md §4.6, original_source `variant->fallback`).
	pub fallback_uris: Vec<Uri>,
	pub bandwidth: u64,
	pub average_bandwidth: Option<u64>,
	pub program_id: Option<u64>,
	pub codecs: Vec<String>,
	pub width: Option<u64>,
	pub height: Option<u64>,
	pub iframe: bool,
	pub audio_group: Option<String>,
	pub video_group: Option<String>,
	pub subtitles_group: Option<String>,
	pub closed_captions_group: Option<String>,
	pub stream_type: StreamTypeMask,
	pub caps: Caps,
}

impl VariantStream {
	fn matches_for_fallback(&self, other: &VariantStream) -> bool {
		self.bandwidth == other.bandwidth
			&& self.width == other.width
			&& self.height == other.height
			&& self.iframe == other.iframe
			&& self.codecs == other.codecs
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenditionType {
	Audio,
	Video,
	Subtitles,
	ClosedCaptions,
}

/// An alternate rendition described by `#EXT-X-MEDIA`.
#[derive(Debug, Clone)]
pub struct RenditionStream {
	pub kind: RenditionType,
	pub group_id: String,
	pub name: String,
	pub lang: Option<String>,
	/// `None` when the rendition is muxed into the variant's own stream
	/// rather than served from its own playlist.
	pub uri: Option<Uri>,
	pub caps: Option<Caps>,
	pub is_default: bool,
	pub autoselect: bool,
	pub forced: bool,
}

impl RenditionStream {
	fn dedup_key(&self) -> (RenditionType, &str, &str) {
		(self.kind, self.group_id.as_str(), self.name.as_str())
	}
}

/// An immutable multivariant playlist, parsed once at startup (spec.md §3).
#[derive(Debug, Clone)]
pub struct MasterPlaylist {
	pub version: Option<u32>,
	/// True when the caller handed the parser a media playlist directly; in
	/// that case a single synthetic variant wraps it.
	pub is_simple: bool,
	pub variants: Vec<VariantStream>,
	pub iframe_variants: Vec<VariantStream>,
	pub renditions: Vec<RenditionStream>,
	pub default_variant: usize,
	/// True if every variant carries a recognised `CODECS` stream type;
	/// gates the audio-only pruning rule (§4.1 step 3, SPEC_FULL §10.6).
	pub have_codecs: bool,
	pub independent_segments: bool,
}

impl MasterPlaylist {
	pub fn default_variant(&self) -> Option<&VariantStream> {
		self.variants.get(self.default_variant)
	}
}

fn synthetic_name(bandwidth: u64, uri: &Uri) -> String {
	let mut hasher = Sha1::new();
	hasher.update(uri.as_str().as_bytes());
	let digest = hasher.finalize();
	let hex = hex::encode(digest);
	format!("variant-{bandwidth}-{}", &hex[..8])
}

/// Parse a multivariant playlist. `base_uri` is the playlist's own URI,
/// used to resolve relative variant/rendition URIs (spec.md §6).
pub fn parse_master(body: &str, base_uri: &Uri) -> Result<MasterPlaylist> {
	let mut version = None;
	let mut variants: Vec<VariantStream> = Vec::new();
	let mut iframe_variants: Vec<VariantStream> = Vec::new();
	let mut renditions: Vec<RenditionStream> = Vec::new();
	let mut independent_segments = false;

	let mut pending: Option<VariantStream> = None;

	for line in body.lines() {
		let line = line.trim_end_matches('\r');
		if let Some(rest) = line.strip_prefix("#EXT-X-VERSION:") {
			version = rest.trim().parse().ok();
		} else if let Some(rest) = line
			.strip_prefix("#EXT-X-STREAM-INF:")
			.or_else(|| line.strip_prefix("#EXT-X-I-FRAME-STREAM-INF:"))
		{
			let iframe = line.starts_with("#EXT-X-I-FRAME-STREAM-INF:");
			let attrs = Attributes::parse(rest);
			let codecs: Vec<String> = attrs
				.get("CODECS")
				.map(|c| c.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
				.unwrap_or_default();
			let stream_type = codecs.iter().fold(StreamTypeMask::default(), |m, c| m.union(classify_codec(c)));
			let (width, height) = attrs
				.get("RESOLUTION")
				.and_then(|r| r.split_once('x'))
				.and_then(|(w, h)| Some((w.parse().ok()?, h.parse().ok()?)))
				.unzip();

			let caps = Caps { codecs: codecs.clone() };
			let bandwidth = attrs.get_u64("BANDWIDTH").unwrap_or(0);

			let mut variant = VariantStream {
				name: String::new(),
				uri: base_uri.clone(),
				fallback_uris: Vec::new(),
				bandwidth,
				average_bandwidth: attrs.get_u64("AVERAGE-BANDWIDTH"),
				program_id: attrs.get_u64("PROGRAM-ID"),
				codecs,
				width,
				height,
				iframe,
				audio_group: attrs.get("AUDIO").map(String::from),
				video_group: attrs.get("VIDEO").map(String::from),
				subtitles_group: attrs.get("SUBTITLES").map(String::from),
				closed_captions_group: attrs.get("CLOSED-CAPTIONS").map(String::from),
				stream_type,
				caps,
			};

			if iframe {
				// The URI is an attribute for I-frame variants, not a following line.
				if let Some(u) = attrs.get("URI") {
					variant.uri = uri::resolve(base_uri, u)?;
					variant.name = synthetic_name(variant.bandwidth, &variant.uri);
					if !iframe_variants.iter().any(|v: &VariantStream| v.uri == variant.uri) {
						iframe_variants.push(variant);
					}
				}
			} else {
				if pending.is_some() {
					tracing::warn!("EXT-X-STREAM-INF without URI, dropping");
				}
				pending = Some(variant);
			}
		} else if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA:") {
			if let Some(rendition) = parse_rendition(rest, base_uri)? {
				if !renditions.iter().any(|r| r.dedup_key() == rendition.dedup_key()) {
					renditions.push(rendition);
				} else {
					tracing::debug!(name = %rendition.name, "dropping duplicate rendition");
				}
			}
		} else if line == "#EXT-X-INDEPENDENT-SEGMENTS" {
			independent_segments = true;
		} else if let Some(mut variant) = pending.take() {
			// Non-tag, non-empty line following EXT-X-STREAM-INF is the URI.
			let trimmed = line.trim();
			if !trimmed.is_empty() && !trimmed.starts_with('#') {
				variant.uri = uri::resolve(base_uri, trimmed)?;
				variant.name = synthetic_name(variant.bandwidth, &variant.uri);

				if let Some(existing) = variants.iter_mut().find(|v| v.uri == variant.uri) {
					let _ = existing; // exact duplicate URI: keep first, drop second silently
				} else if let Some(existing) = variants.iter_mut().find(|v| v.matches_for_fallback(&variant)) {
					existing.fallback_uris.push(variant.uri);
				} else {
					variants.push(variant);
				}
			} else {
				// Blank/comment line before the URI arrived; keep waiting.
				pending = Some(variant);
			}
		}
	}

	if pending.is_some() {
		tracing::warn!("trailing EXT-X-STREAM-INF without URI, dropping");
	}

	if variants.is_empty() {
		return Err(Error::ManifestMalformed("master playlist without any media playlists".into()));
	}

	variants.sort_by_key(|v| v.bandwidth);
	iframe_variants.sort_by_key(|v| v.bandwidth);

	let most_seen_types = variants.iter().fold(StreamTypeMask::default(), |m, v| m.union(v.stream_type));
	let have_codecs = !most_seen_types.is_empty();

	if have_codecs && !most_seen_types.is_audio_only() {
		variants.retain(|v| !(v.stream_type.is_audio_only() && v.stream_type != most_seen_types));
	}

	assign_rendition_caps(&mut variants, &mut renditions);

	let default_variant = variants.len() - 1;

	Ok(MasterPlaylist {
		version,
		is_simple: false,
		variants,
		iframe_variants,
		renditions,
		default_variant,
		have_codecs,
		independent_segments,
	})
}

/// For each variant's rendition-group references, hand the matching
/// rendition(s) the variant's per-type caps, and subtract those caps from
/// the variant when the rendition serves its own playlist (spec.md §4.1
/// final two bullets; original_source `m3u8.c` lines ~3270-3320).
fn assign_rendition_caps(variants: &mut [VariantStream], renditions: &mut [RenditionStream]) {
	for variant in variants.iter_mut() {
		let groups: [(RenditionType, &Option<String>); 4] = [
			(RenditionType::Audio, &variant.audio_group),
			(RenditionType::Video, &variant.video_group),
			(RenditionType::Subtitles, &variant.subtitles_group),
			(RenditionType::ClosedCaptions, &variant.closed_captions_group),
		];

		for (kind, group) in groups {
			let Some(group_id) = group else { continue };
			let media_caps = match kind {
				RenditionType::Audio => caps_for_mask(&variant.caps.codecs, |m| m.audio),
				RenditionType::Video => caps_for_mask(&variant.caps.codecs, |m| m.video),
				RenditionType::Subtitles => caps_for_mask(&variant.caps.codecs, |m| m.subtitles),
				RenditionType::ClosedCaptions => continue, // CC never muxes codecs into the variant
			};
			if media_caps.is_empty() {
				continue;
			}

			let mut muxed_in_variant = false;
			for rendition in renditions.iter_mut() {
				if rendition.kind != kind || rendition.group_id != *group_id {
					continue;
				}
				if rendition.uri.is_none() {
					muxed_in_variant = true;
				} else {
					rendition.caps = Some(media_caps.clone());
				}
			}

			if !muxed_in_variant {
				variant.caps.subtract(&media_caps);
			}
		}
	}
}

fn parse_rendition(rest: &str, base_uri: &Uri) -> Result<Option<RenditionStream>> {
	let attrs = Attributes::parse(rest);
	let kind = match attrs.get("TYPE") {
		Some("AUDIO") => RenditionType::Audio,
		Some("VIDEO") => RenditionType::Video,
		Some("SUBTITLES") => RenditionType::Subtitles,
		Some("CLOSED-CAPTIONS") => RenditionType::ClosedCaptions,
		_ => return Ok(None),
	};
	let group_id = attrs.get("GROUP-ID").unwrap_or_default().to_string();
	let name = attrs.get("NAME").unwrap_or_default().to_string();
	let uri = match (kind, attrs.get("URI")) {
		(RenditionType::ClosedCaptions, _) => None, // CC is always carried in-band
		(_, Some(u)) => Some(uri::resolve(base_uri, u)?),
		(_, None) => None,
	};

	Ok(Some(RenditionStream {
		kind,
		group_id,
		name,
		lang: attrs.get("LANGUAGE").map(String::from),
		uri,
		caps: None,
		is_default: attrs.get_bool("DEFAULT"),
		autoselect: attrs.get_bool("AUTOSELECT"),
		forced: attrs.get_bool("FORCED"),
	}))
}

// Allow comparing masks for equality in the pruning filter above.
#[cfg(test)]
mod tests {
	use super::*;

	fn uri(s: &str) -> Uri {
		Uri::parse(s).unwrap()
	}

	#[test]
	fn parses_basic_master_and_sorts_by_bandwidth() {
		let body = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=3000000,CODECS=\"avc1.4d401f,mp4a.40.2\"\n\
high.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,CODECS=\"avc1.4d401f,mp4a.40.2\"\n\
low.m3u8\n";
		let base = uri("https://cdn.example/master.m3u8");
		let master = parse_master(body, &base).unwrap();
		assert_eq!(master.variants.len(), 2);
		assert_eq!(master.variants[0].bandwidth, 800_000);
		assert_eq!(master.variants[1].bandwidth, 3_000_000);
		assert!(master.have_codecs);
	}

	#[test]
	fn duplicate_uri_becomes_fallback() {
		let body = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000\n\
low.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000\n\
low.m3u8\n";
		let base = uri("https://cdn.example/master.m3u8");
		let master = parse_master(body, &base).unwrap();
		assert_eq!(master.variants.len(), 1);
	}

	#[test]
	fn same_shape_different_uri_becomes_fallback_list() {
		let body = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,CODECS=\"avc1.4d401f\"\n\
primary.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,CODECS=\"avc1.4d401f\"\n\
backup.m3u8\n";
		let base = uri("https://cdn.example/master.m3u8");
		let master = parse_master(body, &base).unwrap();
		assert_eq!(master.variants.len(), 1);
		assert_eq!(master.variants[0].fallback_uris.len(), 1);
		assert!(master.variants[0].fallback_uris[0].as_str().ends_with("backup.m3u8"));
	}

	#[test]
	fn audio_only_variants_are_pruned_when_mixed_present() {
		let body = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=3000000,CODECS=\"avc1.4d401f,mp4a.40.2\"\n\
av.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=100000,CODECS=\"mp4a.40.2\"\n\
audio-only.m3u8\n";
		let base = uri("https://cdn.example/master.m3u8");
		let master = parse_master(body, &base).unwrap();
		assert_eq!(master.variants.len(), 1);
		assert_eq!(master.variants[0].bandwidth, 3_000_000);
	}

	#[test]
	fn rendition_with_uri_gets_variant_caps_subtracted() {
		let body = "#EXTM3U\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aac\",NAME=\"English\",URI=\"audio.m3u8\",DEFAULT=YES\n\
#EXT-X-STREAM-INF:BANDWIDTH=3000000,CODECS=\"avc1.4d401f,mp4a.40.2\",AUDIO=\"aac\"\n\
video.m3u8\n";
		let base = uri("https://cdn.example/master.m3u8");
		let master = parse_master(body, &base).unwrap();
		let variant = &master.variants[0];
		assert!(variant.caps.codecs.iter().all(|c| !c.starts_with("mp4a")));
		let rendition = &master.renditions[0];
		assert_eq!(rendition.caps.as_ref().unwrap().codecs, vec!["mp4a.40.2".to_string()]);
	}

	#[test]
	fn empty_master_is_manifest_malformed() {
		let base = uri("https://cdn.example/master.m3u8");
		assert!(parse_master("#EXTM3U\n", &base).is_err());
	}
}
