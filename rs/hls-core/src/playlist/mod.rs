//! Playlist parsing (C1): dispatch between multivariant and media playlists.

pub mod attrs;
pub mod master;
pub mod media;

pub use master::{Caps, MasterPlaylist, RenditionStream, RenditionType, StreamTypeMask, VariantStream};
pub use media::{InitFile, Key, KeyMethod, MediaPlaylist, MediaSegment, PartialSegment, PlaylistType, PreloadHint, PreloadHintKind};

use crate::error::{Error, Result};
use crate::uri::Uri;

/// The result of parsing a playlist body whose kind wasn't known up front
/// (spec.md §4.1 dispatch rule).
#[derive(Debug, Clone)]
pub enum Playlist {
	Master(MasterPlaylist),
	Media(MediaPlaylist),
}

impl Playlist {
	pub fn as_master(&self) -> Option<&MasterPlaylist> {
		match self {
			Playlist::Master(m) => Some(m),
			Playlist::Media(_) => None,
		}
	}

	pub fn as_media(&self) -> Option<&MediaPlaylist> {
		match self {
			Playlist::Media(m) => Some(m),
			Playlist::Master(_) => None,
		}
	}
}

/// Parse a playlist whose kind is unknown: a master playlist if any
/// `#EXT-X-STREAM-INF` line is present, a media playlist if any `#EXTINF`
/// line is present. A body with neither (a single variant with no segments
/// of its own) is accepted as a simple, single-variant master wrapping the
/// same bytes as a media playlist (spec.md §4.1, "is_simple").
pub fn parse(body: &str, uri: &Uri) -> Result<Playlist> {
	if !body.trim_start().starts_with("#EXTM3U") {
		return Err(Error::ManifestMalformed("missing #EXTM3U".into()));
	}

	let is_master = body.lines().any(|l| l.trim_end_matches('\r').starts_with("#EXT-X-STREAM-INF:"));
	let is_media = body.lines().any(|l| l.trim_end_matches('\r').starts_with("#EXTINF:"));

	if is_master && is_media {
		return Err(Error::ManifestMalformed("playlist mixes EXT-X-STREAM-INF and EXTINF".into()));
	}

	if is_master {
		return Ok(Playlist::Master(master::parse_master(body, uri)?));
	}

	if is_media {
		return Ok(Playlist::Media(media::parse_media(body, uri, None)?));
	}

	// Neither a master marker nor a segment marker: a lone media playlist
	// (possibly segment-less so far, e.g. a fresh live playlist) handed
	// directly. Wrap it in a synthetic one-variant master flagged
	// `is_simple`; the variant's own URI is this same playlist, which the
	// loader fetches in the ordinary way to obtain its segments.
	let version = body
		.lines()
		.find_map(|l| l.trim_end_matches('\r').strip_prefix("#EXT-X-VERSION:"))
		.and_then(|v| v.trim().parse().ok());
	let independent_segments = body.lines().any(|l| l.trim_end_matches('\r') == "#EXT-X-INDEPENDENT-SEGMENTS");

	let variant = VariantStream {
		name: format!("variant-simple-{}", uri.as_str()),
		uri: uri.clone(),
		fallback_uris: Vec::new(),
		bandwidth: 0,
		average_bandwidth: None,
		program_id: None,
		codecs: Vec::new(),
		width: None,
		height: None,
		iframe: false,
		audio_group: None,
		video_group: None,
		subtitles_group: None,
		closed_captions_group: None,
		stream_type: StreamTypeMask::default(),
		caps: Caps::default(),
	};
	let master = MasterPlaylist {
		version,
		is_simple: true,
		variants: vec![variant],
		iframe_variants: Vec::new(),
		renditions: Vec::new(),
		default_variant: 0,
		have_codecs: false,
		independent_segments,
	};
	Ok(Playlist::Master(master))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn uri(s: &str) -> Uri {
		Uri::parse(s).unwrap()
	}

	#[test]
	fn dispatches_master_playlist() {
		let body = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nlow.m3u8\n";
		let u = uri("https://cdn.example/master.m3u8");
		assert!(matches!(parse(body, &u).unwrap(), Playlist::Master(_)));
	}

	#[test]
	fn dispatches_media_playlist() {
		let body = "#EXTM3U\n#EXTINF:4.0,\nseg.ts\n#EXT-X-ENDLIST\n";
		let u = uri("https://cdn.example/low.m3u8");
		assert!(matches!(parse(body, &u).unwrap(), Playlist::Media(_)));
	}

	#[test]
	fn single_variant_without_extinf_is_simple() {
		let body = "#EXTM3U\n#EXT-X-VERSION:3\n";
		let u = uri("https://cdn.example/low.m3u8");
		match parse(body, &u).unwrap() {
			Playlist::Master(m) => assert!(m.is_simple),
			Playlist::Media(_) => panic!("expected a wrapped simple master"),
		}
	}

	#[test]
	fn missing_extm3u_is_malformed() {
		let u = uri("https://cdn.example/bad.m3u8");
		assert!(parse("not a playlist", &u).is_err());
	}

	#[test]
	fn conflicting_markers_are_malformed() {
		let body = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nlow.m3u8\n#EXTINF:4.0,\nseg.ts\n";
		let u = uri("https://cdn.example/weird.m3u8");
		assert!(parse(body, &u).is_err());
	}
}
