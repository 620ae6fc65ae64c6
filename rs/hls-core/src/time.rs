//! Stream-time arithmetic shared by the parser, walker and time-mapping layer.
//!
//! The core works exclusively in nanoseconds so that MPEG-TS (90 kHz), ISOBMFF
//! (arbitrary trak timescale) and WebVTT (millisecond) clocks all land on a
//! common, lossless-enough grid. `std::time::Duration` already models an
//! unsigned nanosecond-resolution span, so it's reused directly rather than
//! inventing a parallel type.

use std::time::Duration;

/// Ticks of the 90 kHz MPEG-TS clock (PCR/PTS/DTS) per second.
pub const MPEGTS_CLOCK_HZ: u64 = 90_000;

/// `2^33`, the width of the MPEG-TS PTS/DTS/PCR-base field.
pub const MPEGTS_WRAP: u64 = 1 << 33;

/// A point on the demuxer's monotonic output timeline, in nanoseconds from
/// the start of the broadcast. Non-decreasing across a playlist's segments
/// per spec.md §3's invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct StreamTime(u64);

impl StreamTime {
	pub const ZERO: Self = Self(0);

	pub const fn from_nanos(nanos: u64) -> Self {
		Self(nanos)
	}

	pub const fn as_nanos(self) -> u64 {
		self.0
	}

	pub fn as_secs_f64(self) -> f64 {
		self.0 as f64 / 1_000_000_000.0
	}

	pub fn checked_add(self, dur: Duration) -> Option<Self> {
		self.0.checked_add(dur.as_nanos() as u64).map(Self)
	}

	pub fn saturating_add(self, dur: Duration) -> Self {
		Self(self.0.saturating_add(dur.as_nanos() as u64))
	}

	pub fn saturating_sub(self, dur: Duration) -> Self {
		Self(self.0.saturating_sub(dur.as_nanos() as u64))
	}

	/// Signed nanosecond delta `self - other`, used by the resync math of
	/// spec.md §4.5 where the sign of the drift matters.
	pub fn diff_nanos(self, other: Self) -> i64 {
		self.0 as i64 - other.0 as i64
	}

	pub fn duration_since(self, other: Self) -> Duration {
		Duration::from_nanos(self.0.saturating_sub(other.0))
	}
}

impl std::fmt::Display for StreamTime {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:.3}s", self.as_secs_f64())
	}
}

/// Convert a 90 kHz MPEG-TS tick count to nanoseconds.
///
/// `1e9 / 90_000 == 100_000 / 9`; multiplying before dividing keeps the
/// result exact for all `ticks < 2^64 / 100_000`, comfortably more than the
/// 33-bit field ever carries.
pub const fn ticks_90k_to_nanos(ticks: u64) -> u64 {
	ticks * 100_000 / 9
}

pub const fn nanos_to_ticks_90k(nanos: u64) -> u64 {
	nanos * 9 / 100_000
}

/// Resolve a 33-bit MPEG-TS timestamp that may have wrapped relative to a
/// known reference tick count on the same clock.
///
/// If `raw` looks like it wrapped (it's much smaller than `reference` modulo
/// the field width), one wrap period is added back, per spec.md §4.4's
/// MpegTs probe rule.
pub fn unwrap_90k(raw: u64, reference_nanos: u64) -> u64 {
	let raw = raw % MPEGTS_WRAP;
	let reference_ticks = nanos_to_ticks_90k(reference_nanos);

	// Compare in the same modulus: if `raw` sits more than half a wrap period
	// behind the reference, assume exactly one wrap occurred.
	let reference_phase = reference_ticks % MPEGTS_WRAP;
	let mut ticks = raw;
	if reference_phase > raw && reference_phase - raw > MPEGTS_WRAP / 2 {
		ticks += MPEGTS_WRAP;
	}

	// Restore the wrap count already present in the reference.
	let wraps_in_reference = reference_ticks / MPEGTS_WRAP;
	ticks_90k_to_nanos(ticks + wraps_in_reference * MPEGTS_WRAP)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ticks_roundtrip_are_exact_for_small_values() {
		for secs in 0..10u64 {
			let ticks = secs * MPEGTS_CLOCK_HZ;
			assert_eq!(ticks_90k_to_nanos(ticks), secs * 1_000_000_000);
		}
	}

	#[test]
	fn stream_time_diff_can_be_negative() {
		let a = StreamTime::from_nanos(5);
		let b = StreamTime::from_nanos(10);
		assert_eq!(a.diff_nanos(b), -5);
		assert_eq!(b.diff_nanos(a), 5);
	}

	#[test]
	fn unwrap_90k_adds_one_wrap_near_boundary() {
		// Reference just before the wrap, observed value just after it (small).
		let reference_nanos = ticks_90k_to_nanos(MPEGTS_WRAP - MPEGTS_CLOCK_HZ * 2);
		let raw = MPEGTS_CLOCK_HZ; // 1 second past the wrap
		let resolved = unwrap_90k(raw, reference_nanos);
		// Expect resolved time to be about 1s after the wrap boundary, i.e.
		// roughly reference + 3s, not a huge negative jump.
		assert!(resolved > reference_nanos);
		let delta = resolved - reference_nanos;
		assert!(delta < 4_000_000_000, "delta too large: {delta}");
	}
}
