//! fMP4 `tfdt` scan for the fragment's internal decode time (spec.md §4.4
//! step 3), grounded on the atom-walking shape of an fMP4 importer elsewhere
//! in this workspace: a single forward pass over top-level boxes, `moov`
//! captured once for its per-track timescales, each `moof`/`traf`/`tfdt`
//! converted into nanoseconds via that track's `mdhd.timescale`, and the
//! smallest across tracks reported since §4.4 wants the earliest sample.

use mp4_atom::{Any, DecodeMaybe, Moov};

use crate::error::{Error, Result};

/// Walk `buf` for the first `moof` and report its tracks' earliest decode
/// time in nanoseconds. A `moov` appearing first supplies per-track
/// timescales (its `trak`s map `track_id -> mdhd.timescale`); without one,
/// a bare `tfdt` can't be converted and is skipped.
pub fn find_earliest_decode_time(buf: &[u8]) -> Result<Option<u64>> {
	let mut cursor = std::io::Cursor::new(buf);
	let mut timescales: std::collections::HashMap<u32, u64> = std::collections::HashMap::new();

	while let Some(atom) = Any::decode_maybe(&mut cursor).map_err(Error::Mp4)? {
		match atom {
			Any::Moov(moov) => {
				record_timescales(&moov, &mut timescales);
			}
			Any::Moof(moof) => {
				let mut earliest: Option<u64> = None;
				for traf in &moof.traf {
					let Some(tfdt) = traf.tfdt.as_ref() else { continue };
					let track_id = traf.tfhd.track_id;
					let Some(&timescale) = timescales.get(&track_id) else { continue };
					if timescale == 0 {
						continue;
					}
					let nanos = decode_time_nanos(tfdt.base_media_decode_time as u64, timescale);
					earliest = Some(match earliest {
						Some(current) => current.min(nanos),
						None => nanos,
					});
				}
				if earliest.is_some() {
					return Ok(earliest);
				}
			}
			Any::Mdat(_) => {
				// A fragment's media data follows its moof; nothing more to learn.
				break;
			}
			_ => {}
		}
	}

	Ok(None)
}

fn record_timescales(moov: &Moov, timescales: &mut std::collections::HashMap<u32, u64>) {
	for trak in &moov.trak {
		timescales.insert(trak.tkhd.track_id, trak.mdia.mdhd.timescale as u64);
	}
}

fn decode_time_nanos(ticks: u64, timescale: u64) -> u64 {
	(ticks as u128 * 1_000_000_000 / timescale as u128) as u64
}

#[cfg(test)]
mod tests {
	use super::*;
	use mp4_atom::{Encode, Mfhd, Moof, Tfdt, Tfhd, Traf};

	#[test]
	fn decode_time_nanos_converts_90khz_ticks() {
		assert_eq!(decode_time_nanos(90_000, 90_000), 1_000_000_000);
	}

	#[test]
	fn missing_moov_skips_unresolvable_tfdt() {
		let moof = Moof {
			mfhd: Mfhd { sequence_number: 1 },
			traf: vec![Traf {
				tfhd: Tfhd {
					track_id: 1,
					base_data_offset: None,
					sample_description_index: None,
					default_sample_duration: None,
					default_sample_size: None,
					default_sample_flags: None,
				},
				tfdt: Some(Tfdt {
					base_media_decode_time: 90_000,
				}),
				..Default::default()
			}],
		};
		let mut buf = Vec::new();
		moof.encode(&mut buf).unwrap();

		let result = find_earliest_decode_time(&buf).unwrap();
		assert_eq!(result, None);
	}
}
