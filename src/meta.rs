// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of Parity.

// Parity is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Parity is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Parity.  If not, see <http://www.gnu.org/licenses/>.

// Meta file layout, little-endian, in this fixed order:
//
// [MAGIC: 4][VERSION: 4]
// [INITIAL_GROUPS: 4][MAX_DENSITY: 8][MIN_DENSITY: 8]
// [LEVEL: 4][SPLIT_POINTER: 4][GROUP_COUNT: 4][TOTAL_RECORDS: 8]
// [LEN_P: 4][PRIMARY_BLOCK_OF_GROUP: 4 * LEN_P]
// [LEN_F: 4][FIRST_OVERFLOW_OF_GROUP: 4 * LEN_F]   (i32, -1 = none)
// [LEN_O: 4][OVERFLOW_NEXT: 4 * LEN_O]             (i32, -1 = none)
// [CRC32: 4]                                       (of all preceding bytes)
//
// Rewritten as the final step of every mutating index operation; read once
// at open. Any structural mismatch refuses to decode.

use std::convert::TryInto;
use std::io::{Read, Seek, SeekFrom, Write};
use crate::error::{Error, Result};

const META_MAGIC: u32 = u32::from_le_bytes(*b"ELH1");
const META_VERSION: u32 = 1;
const NONE_LINK: i32 = -1;

/// Persistent linear-hash directory state.
#[derive(Debug, Clone, PartialEq)]
pub struct Meta {
	pub initial_groups: u32,
	pub max_density: f64,
	pub min_density: f64,
	pub level: u32,
	pub split_pointer: u32,
	pub total_records: u64,
	pub primary_block_of_group: Vec<u32>,
	pub first_overflow_of_group: Vec<Option<u32>>,
	pub overflow_next: Vec<Option<u32>>,
}

fn checksum(buf: &[u8]) -> u32 {
	let mut hasher = crc32fast::Hasher::new();
	hasher.update(buf);
	hasher.finalize()
}

fn put_link(buf: &mut Vec<u8>, link: Option<u32>) {
	let raw = match link {
		Some(i) => i as i32,
		None => NONE_LINK,
	};
	buf.extend_from_slice(&raw.to_le_bytes());
}

struct Reader<'a> {
	buf: &'a [u8],
	at: usize,
}

impl<'a> Reader<'a> {
	fn take(&mut self, n: usize) -> Result<&'a [u8]> {
		if self.at + n > self.buf.len() {
			return Err(Error::Corruption("Meta file truncated".into()));
		}
		let slice = &self.buf[self.at..self.at + n];
		self.at += n;
		Ok(slice)
	}

	fn u32(&mut self) -> Result<u32> {
		Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
	}

	fn u64(&mut self) -> Result<u64> {
		Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
	}

	fn f64(&mut self) -> Result<f64> {
		Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
	}

	fn link(&mut self) -> Result<Option<u32>> {
		let raw = i32::from_le_bytes(self.take(4)?.try_into().unwrap());
		if raw == NONE_LINK {
			Ok(None)
		} else if raw >= 0 {
			Ok(Some(raw as u32))
		} else {
			Err(Error::Corruption(format!("Invalid overflow link {}", raw)))
		}
	}
}

impl Meta {
	pub fn group_count(&self) -> u32 {
		self.primary_block_of_group.len() as u32
	}

	pub fn encode(&self) -> Vec<u8> {
		let groups = self.group_count();
		let mut buf = Vec::with_capacity(52 + 8 * groups as usize + 4 * self.overflow_next.len());
		buf.extend_from_slice(&META_MAGIC.to_le_bytes());
		buf.extend_from_slice(&META_VERSION.to_le_bytes());
		buf.extend_from_slice(&self.initial_groups.to_le_bytes());
		buf.extend_from_slice(&self.max_density.to_le_bytes());
		buf.extend_from_slice(&self.min_density.to_le_bytes());
		buf.extend_from_slice(&self.level.to_le_bytes());
		buf.extend_from_slice(&self.split_pointer.to_le_bytes());
		buf.extend_from_slice(&groups.to_le_bytes());
		buf.extend_from_slice(&self.total_records.to_le_bytes());
		buf.extend_from_slice(&groups.to_le_bytes());
		for block in &self.primary_block_of_group {
			buf.extend_from_slice(&block.to_le_bytes());
		}
		buf.extend_from_slice(&groups.to_le_bytes());
		for link in &self.first_overflow_of_group {
			put_link(&mut buf, *link);
		}
		buf.extend_from_slice(&(self.overflow_next.len() as u32).to_le_bytes());
		for link in &self.overflow_next {
			put_link(&mut buf, *link);
		}
		let crc = checksum(&buf);
		buf.extend_from_slice(&crc.to_le_bytes());
		buf
	}

	pub fn decode(buf: &[u8]) -> Result<Meta> {
		if buf.len() < 4 {
			return Err(Error::Corruption("Meta file truncated".into()));
		}
		let (body, trailer) = buf.split_at(buf.len() - 4);
		let stored_crc = u32::from_le_bytes(trailer.try_into().unwrap());
		if checksum(body) != stored_crc {
			return Err(Error::Corruption("Meta checksum mismatch".into()));
		}

		let mut reader = Reader { buf: body, at: 0 };
		let magic = reader.u32()?;
		if magic != META_MAGIC {
			return Err(Error::Corruption(format!("Bad meta magic {:#010x}", magic)));
		}
		let version = reader.u32()?;
		if version != META_VERSION {
			return Err(Error::Corruption(format!("Unsupported meta version {}", version)));
		}
		let initial_groups = reader.u32()?;
		let max_density = reader.f64()?;
		let min_density = reader.f64()?;
		if !(min_density < max_density) {
			return Err(Error::Corruption(format!(
				"Invalid density window {}..{}",
				min_density, max_density,
			)));
		}
		let level = reader.u32()?;
		let split_pointer = reader.u32()?;
		let groups = reader.u32()?;
		let total_records = reader.u64()?;

		let len_p = reader.u32()?;
		if len_p != groups {
			return Err(Error::Corruption(format!(
				"Primary map holds {} entries for {} groups",
				len_p, groups,
			)));
		}
		let mut primary_block_of_group = Vec::with_capacity(groups as usize);
		for _ in 0..groups {
			primary_block_of_group.push(reader.u32()?);
		}

		let len_f = reader.u32()?;
		if len_f != groups {
			return Err(Error::Corruption(format!(
				"Overflow head map holds {} entries for {} groups",
				len_f, groups,
			)));
		}
		let mut first_overflow_of_group = Vec::with_capacity(groups as usize);
		for _ in 0..groups {
			first_overflow_of_group.push(reader.link()?);
		}

		let len_o = reader.u32()?;
		let mut overflow_next = Vec::with_capacity(len_o as usize);
		for _ in 0..len_o {
			overflow_next.push(reader.link()?);
		}

		if reader.at != body.len() {
			return Err(Error::Corruption("Trailing bytes in meta file".into()));
		}

		Ok(Meta {
			initial_groups,
			max_density,
			min_density,
			level,
			split_pointer,
			total_records,
			primary_block_of_group,
			first_overflow_of_group,
			overflow_next,
		})
	}

	pub fn write_to(&self, mut file: &std::fs::File) -> Result<()> {
		let buf = self.encode();
		file.seek(SeekFrom::Start(0))?;
		file.write_all(&buf)?;
		file.set_len(buf.len() as u64)?;
		Ok(())
	}

	pub fn read_from(mut file: &std::fs::File) -> Result<Meta> {
		let mut buf = Vec::new();
		file.seek(SeekFrom::Start(0))?;
		file.read_to_end(&mut buf)?;
		Meta::decode(&buf)
	}
}

#[cfg(test)]
mod test {
	use super::Meta;
	use crate::error::Error;

	fn sample() -> Meta {
		Meta {
			initial_groups: 4,
			max_density: 0.75,
			min_density: 0.40,
			level: 1,
			split_pointer: 2,
			total_records: 117,
			primary_block_of_group: vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
			first_overflow_of_group: vec![None, Some(0), None, Some(3), None, None, None, None, None, Some(1)],
			overflow_next: vec![Some(2), None, None, None],
		}
	}

	#[test]
	fn round_trip() {
		let meta = sample();
		let buf = meta.encode();
		assert_eq!(Meta::decode(&buf).unwrap(), meta);
	}

	#[test]
	fn bad_magic_refuses() {
		let mut buf = sample().encode();
		buf[0] ^= 0xff;
		// Fix the checksum so the magic check itself is exercised.
		let crc_at = buf.len() - 4;
		let crc = super::checksum(&buf[..crc_at]);
		buf[crc_at..].copy_from_slice(&crc.to_le_bytes());
		assert!(matches!(Meta::decode(&buf), Err(Error::Corruption(_))));
	}

	#[test]
	fn bad_version_refuses() {
		let mut meta_buf = sample().encode();
		meta_buf[4] = 9;
		let crc_at = meta_buf.len() - 4;
		let crc = super::checksum(&meta_buf[..crc_at]);
		meta_buf[crc_at..].copy_from_slice(&crc.to_le_bytes());
		assert!(matches!(Meta::decode(&meta_buf), Err(Error::Corruption(_))));
	}

	#[test]
	fn flipped_bit_fails_checksum() {
		let mut buf = sample().encode();
		buf[20] ^= 0x01;
		assert!(matches!(Meta::decode(&buf), Err(Error::Corruption(_))));
	}

	#[test]
	fn truncation_refuses() {
		let buf = sample().encode();
		assert!(matches!(Meta::decode(&buf[..buf.len() - 9]), Err(Error::Corruption(_))));
	}

	#[test]
	fn inconsistent_lengths_refuse() {
		let mut meta = sample();
		meta.first_overflow_of_group.pop();
		// Encoding uses the primary map length for both group arrays, so a
		// shorter head map shows up as a truncated image.
		assert!(matches!(Meta::decode(&meta.encode()), Err(Error::Corruption(_))));
	}
}
