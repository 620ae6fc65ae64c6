//! MPEG-TS PAT/PMT/PES scan for the first presentable PTS/DTS (spec.md §4.4).

const PACKET_LEN: usize = 188;
const SYNC_BYTE: u8 = 0x47;

/// Scan 188-byte TS packets: PAT -> PMT -> the first PES packet on any
/// elementary stream PID, preferring DTS over PTS (falling back to PTS if
/// `PTS < DTS` and they're within 1s of each other, a sign of a B-frame
/// reordering artifact rather than a real desync).
///
/// Returns 90 kHz ticks, not yet unwrapped against any time map (the caller
/// resolves wraparound via [`crate::time::unwrap_90k`]).
pub fn find_first_timestamp(data: &[u8]) -> Option<u64> {
	let sync_offset = find_sync(data)?;

	let mut pmt_pid: Option<u16> = None;
	let mut elementary_pids: Vec<u16> = Vec::new();

	let mut offset = sync_offset;
	while offset + PACKET_LEN <= data.len() {
		let packet = &data[offset..offset + PACKET_LEN];
		offset += PACKET_LEN;

		if packet[0] != SYNC_BYTE {
			break;
		}

		let pid = (((packet[1] & 0x1f) as u16) << 8) | packet[2] as u16;
		let payload_unit_start = packet[1] & 0x40 != 0;
		let adaptation_field_control = (packet[3] >> 4) & 0x3;

		let mut payload_start = 4;
		if adaptation_field_control == 2 {
			continue; // adaptation field only, no payload
		}
		if adaptation_field_control == 3 {
			let adaptation_len = packet[4] as usize;
			payload_start = 5 + adaptation_len;
		}
		if payload_start >= PACKET_LEN {
			continue;
		}
		let payload = &packet[payload_start..];

		if pid == 0 {
			if let Some(pmt) = parse_pat(payload, payload_unit_start) {
				pmt_pid = Some(pmt);
			}
			continue;
		}

		if Some(pid) == pmt_pid {
			elementary_pids = parse_pmt(payload, payload_unit_start);
			continue;
		}

		if elementary_pids.contains(&pid) && payload_unit_start {
			if let Some(ts) = parse_pes_timestamp(payload) {
				return Some(ts);
			}
		}
	}

	None
}

fn find_sync(data: &[u8]) -> Option<usize> {
	for offset in 0..data.len().min(PACKET_LEN) {
		if data.get(offset) == Some(&SYNC_BYTE)
			&& data.get(offset + PACKET_LEN) == Some(&SYNC_BYTE)
			&& data.get(offset + 2 * PACKET_LEN) == Some(&SYNC_BYTE)
		{
			return Some(offset);
		}
	}
	None
}

fn parse_pat(payload: &[u8], payload_unit_start: bool) -> Option<u16> {
	if !payload_unit_start || payload.is_empty() {
		return None;
	}
	let pointer = payload[0] as usize;
	let section = payload.get(pointer + 1..)?;
	if section.len() < 8 {
		return None;
	}
	let section_length = (((section[1] & 0x0f) as usize) << 8) | section[2] as usize;
	let program_data = section.get(8..3 + section_length)?;
	// Each program entry is 4 bytes: program_number(2) + pid(2).
	for entry in program_data.chunks_exact(4) {
		let program_number = ((entry[0] as u16) << 8) | entry[1] as u16;
		if program_number != 0 {
			let pid = (((entry[2] & 0x1f) as u16) << 8) | entry[3] as u16;
			return Some(pid);
		}
	}
	None
}

fn parse_pmt(payload: &[u8], payload_unit_start: bool) -> Vec<u16> {
	let mut pids = Vec::new();
	if !payload_unit_start || payload.is_empty() {
		return pids;
	}
	let pointer = payload[0] as usize;
	let Some(section) = payload.get(pointer + 1..) else { return pids };
	if section.len() < 12 {
		return pids;
	}
	let section_length = (((section[1] & 0x0f) as usize) << 8) | section[2] as usize;
	let program_info_length = (((section[10] & 0x0f) as usize) << 8) | section[11] as usize;
	let mut pos = 12 + program_info_length;
	let end = (3 + section_length).saturating_sub(4); // strip trailing CRC32
	while pos + 5 <= end && pos + 5 <= section.len() {
		let pid = (((section[pos + 1] & 0x1f) as u16) << 8) | section[pos + 2] as u16;
		let es_info_length = (((section[pos + 3] & 0x0f) as usize) << 8) | section[pos + 4] as usize;
		pids.push(pid);
		pos += 5 + es_info_length;
	}
	pids
}

/// Parse a PES packet header, preferring DTS over PTS per spec.md §4.4.
fn parse_pes_timestamp(payload: &[u8]) -> Option<u64> {
	if payload.len() < 9 || payload[0..3] != [0x00, 0x00, 0x01] {
		return None;
	}
	let pts_dts_flags = (payload[7] >> 6) & 0x3;
	if pts_dts_flags == 0 {
		return None;
	}

	let pts = read_timestamp(&payload[9..14]);
	let dts = if pts_dts_flags == 3 && payload.len() >= 19 {
		Some(read_timestamp(&payload[14..19]))
	} else {
		None
	};

	match (pts, dts) {
		(Some(pts), Some(dts)) => {
			if pts < dts && dts - pts < 90_000 {
				Some(pts)
			} else {
				Some(dts)
			}
		}
		(Some(pts), None) => Some(pts),
		(None, _) => None,
	}
}

fn read_timestamp(bytes: &[u8]) -> u64 {
	let b0 = bytes[0] as u64;
	let b1 = bytes[1] as u64;
	let b2 = bytes[2] as u64;
	let b3 = bytes[3] as u64;
	let b4 = bytes[4] as u64;

	((b0 >> 1) & 0x07) << 30 | (b1 << 22) | ((b2 >> 1) << 15) | (b3 << 7) | (b4 >> 1)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pes_packet_with_pts(pts: u64) -> Vec<u8> {
		let mut payload = vec![0x00, 0x00, 0x01, 0xe0, 0x00, 0x00, 0x80, 0x80, 0x05];
		payload.extend(encode_timestamp(0x2, pts));
		payload
	}

	fn encode_timestamp(marker: u8, ts: u64) -> [u8; 5] {
		[
			(marker << 4) | (((ts >> 30) as u8 & 0x07) << 1) | 1,
			((ts >> 22) & 0xff) as u8,
			(((ts >> 15) & 0x7f) as u8) << 1 | 1,
			((ts >> 7) & 0xff) as u8,
			(((ts & 0x7f) as u8) << 1) | 1,
		]
	}

	#[test]
	fn reads_pts_only_pes_header() {
		let ts = 5_400_000u64; // 60s @ 90kHz
		let payload = pes_packet_with_pts(ts);
		assert_eq!(parse_pes_timestamp(&payload), Some(ts));
	}

	#[test]
	fn prefers_dts_when_both_present() {
		let pts = 100u64;
		let dts = 100u64;
		let mut payload = vec![0x00, 0x00, 0x01, 0xe0, 0x00, 0x00, 0x80, 0xc0, 0x0a];
		payload.extend(encode_timestamp(0x3, pts));
		payload.extend(encode_timestamp(0x1, dts));
		assert_eq!(parse_pes_timestamp(&payload), Some(dts));
	}

	#[test]
	fn end_to_end_finds_timestamp_through_pat_pmt() {
		let mut data = Vec::new();

		// PAT: program 1 -> PMT pid 0x100.
		let mut pat = vec![0x47, 0x40, 0x00, 0x10];
		let mut section = vec![0x00, 0xb0, 0x0d, 0x00, 0x01, 0xc1, 0x00, 0x00];
		section.extend([0x00, 0x01, 0xe1, 0x00]); // program 1 -> pid 0x100
		section.extend([0x00, 0x00, 0x00, 0x00]); // dummy CRC
		pat.push(0x00); // pointer field
		pat.extend(section);
		pat.resize(PACKET_LEN, 0xff);
		data.extend(pat);

		// PMT at pid 0x100: one elementary stream at pid 0x101.
		let mut pmt = vec![0x47, 0x41, 0x00, 0x10];
		let mut pmt_section = vec![0x02, 0xb0, 0x12, 0x00, 0x01, 0xc1, 0x00, 0x00, 0xe1, 0x01, 0xf0, 0x00];
		pmt_section.extend([0x1b, 0xe1, 0x01, 0xf0, 0x00]); // stream_type, pid 0x101
		pmt_section.extend([0x00, 0x00, 0x00, 0x00]);
		pmt.push(0x00);
		pmt.extend(pmt_section);
		pmt.resize(PACKET_LEN, 0xff);
		data.extend(pmt);

		// PES on pid 0x101 with a PTS of 7_200_000 ticks.
		let mut pes = vec![0x47, 0x41, 0x01, 0x10];
		pes.extend(pes_packet_with_pts(7_200_000));
		pes.resize(PACKET_LEN, 0xff);
		data.extend(pes);

		assert_eq!(find_first_timestamp(&data), Some(7_200_000));
	}
}
