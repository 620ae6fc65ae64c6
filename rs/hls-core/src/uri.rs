//! URI resolution and the LL-HLS query-directive rewriting of spec.md §4.2.

pub use url::Url as Uri;

use crate::error::Result;

/// Resolve a playlist-relative reference against a base URI.
///
/// `base` is `base_uri` if the playlist declared one (`EXT-X-BASE-URL` is not
/// part of RFC 8216 but some encoders emit a sibling mechanism; here `base`
/// is simply whatever the caller decided §4.1/§6 resolves against: the
/// playlist's own URI absent an override). Absolute references are returned
/// unparsed-and-reparsed so that scheme+host+query of a fully qualified URL
/// are preserved untouched; relative references resolve the normal way a
/// browser would, which already strips the base's last path segment and
/// keeps its own query string if present.
pub fn resolve(base: &Uri, reference: &str) -> Result<Uri> {
	if let Ok(absolute) = Uri::parse(reference) {
		return Ok(absolute);
	}
	Ok(base.join(reference)?)
}

/// Append (or replace) the LL-HLS delta-update directive.
///
/// `v2` requests `EXT-X-SKIP` to also omit recently-removed date ranges
/// (`can_skip_dateranges`); plain `YES` only skips segments.
pub fn with_skip_directive(uri: &Uri, can_skip_dateranges: bool) -> Uri {
	let mut out = uri.clone();
	{
		let mut pairs = collect_pairs(&out);
		pairs.retain(|(k, _)| k != "_HLS_skip");
		pairs.push(("_HLS_skip".to_string(), if can_skip_dateranges { "v2" } else { "YES" }.to_string()));
		sort_and_set(&mut out, pairs);
	}
	out
}

/// Append the LL-HLS blocking-reload directive for the given (MSN, part).
pub fn with_blocking_directive(uri: &Uri, msn: u64, part: Option<u64>) -> Uri {
	let mut out = uri.clone();
	{
		let mut pairs = collect_pairs(&out);
		pairs.retain(|(k, _)| k != "_HLS_msn" && k != "_HLS_part");
		pairs.push(("_HLS_msn".to_string(), msn.to_string()));
		if let Some(part) = part {
			pairs.push(("_HLS_part".to_string(), part.to_string()));
		}
		sort_and_set(&mut out, pairs);
	}
	out
}

fn collect_pairs(uri: &Uri) -> Vec<(String, String)> {
	uri.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect()
}

/// Re-sort query keys UTF-8 ascending and rewrite the URI's query string.
///
/// Required "always" by spec.md §4.2 so that CDNs caching on raw query
/// strings see a canonical order regardless of directive insertion order.
fn sort_and_set(uri: &mut Uri, mut pairs: Vec<(String, String)>) {
	pairs.sort_by(|a, b| a.0.cmp(&b.0));
	let mut serializer = url::form_urlencoded::Serializer::new(String::new());
	for (k, v) in &pairs {
		serializer.append_pair(k, v);
	}
	let query = serializer.finish();
	uri.set_query(if query.is_empty() { None } else { Some(&query) });
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolve_relative_strips_last_path_segment() {
		let base = Uri::parse("https://cdn.example/live/master.m3u8").unwrap();
		let resolved = resolve(&base, "low/index.m3u8").unwrap();
		assert_eq!(resolved.as_str(), "https://cdn.example/live/low/index.m3u8");
	}

	#[test]
	fn resolve_absolute_preserves_scheme_and_host() {
		let base = Uri::parse("https://cdn.example/live/master.m3u8").unwrap();
		let resolved = resolve(&base, "https://other.example/index.m3u8?x=1").unwrap();
		assert_eq!(resolved.as_str(), "https://other.example/index.m3u8?x=1");
	}

	#[test]
	fn resolve_is_idempotent_for_absolute_targets() {
		let base = Uri::parse("https://cdn.example/live/master.m3u8").unwrap();
		let once = resolve(&base, "low/index.m3u8").unwrap();
		let twice = resolve(&base, once.as_str()).unwrap();
		assert_eq!(once, twice);
	}

	#[test]
	fn query_keys_are_sorted_ascending() {
		let base = Uri::parse("https://cdn.example/live.m3u8?z=1&a=2").unwrap();
		let out = with_blocking_directive(&base, 42, Some(3));
		// Keys: _HLS_msn, _HLS_part, a, z — ASCII/UTF-8 ascending.
		assert_eq!(out.query(), Some("_HLS_msn=42&_HLS_part=3&a=2&z=1"));
	}

	#[test]
	fn skip_directive_replaces_existing_value() {
		let base = Uri::parse("https://cdn.example/live.m3u8?_HLS_skip=YES").unwrap();
		let out = with_skip_directive(&base, true);
		assert_eq!(out.query(), Some("_HLS_skip=v2"));
	}
}
