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

use std::convert::TryInto;
use std::path::{Path, PathBuf};

/// A restart-persistent sequence counter stored as a single little-endian
/// integer in its own file. Best effort: an unreadable file restarts the
/// sequence at 1, a failed write is logged and ignored.
pub struct FileCounter {
	path: PathBuf,
}

impl FileCounter {
	pub fn new(path: &Path) -> FileCounter {
		FileCounter { path: path.into() }
	}

	/// The value the next call to `next` will hand out.
	pub fn peek(&self) -> u64 {
		match std::fs::read(&self.path) {
			Ok(bytes) if bytes.len() == 8 => u64::from_le_bytes(bytes[..].try_into().unwrap()),
			_ => 1,
		}
	}

	/// Take the current value and advance the persisted sequence.
	pub fn next(&self) -> u64 {
		let current = self.peek();
		if let Err(e) = std::fs::write(&self.path, &(current + 1).to_le_bytes()) {
			log::warn!(
				target: "evidence-db",
				"{}: failed to persist counter, sequence will restart: {}",
				self.path.display(),
				e,
			);
		}
		current
	}
}

#[cfg(test)]
mod test {
	use super::FileCounter;

	struct TempDir(std::path::PathBuf);

	impl TempDir {
		fn new(name: &'static str) -> TempDir {
			let mut path = std::env::temp_dir();
			path.push("evidence-db-test");
			path.push("counter");
			path.push(name);

			if path.exists() {
				std::fs::remove_dir_all(&path).unwrap();
			}
			std::fs::create_dir_all(&path).unwrap();
			TempDir(path)
		}
	}

	impl Drop for TempDir {
		fn drop(&mut self) {
			if self.0.exists() {
				std::fs::remove_dir_all(&self.0).unwrap();
			}
		}
	}

	#[test]
	fn sequence_survives_reopen() {
		let dir = TempDir::new("sequence_survives_reopen");
		let path = dir.0.join("evidence_id_counter.dat");
		{
			let counter = FileCounter::new(&path);
			assert_eq!(counter.next(), 1);
			assert_eq!(counter.next(), 2);
		}
		let counter = FileCounter::new(&path);
		assert_eq!(counter.next(), 3);
	}

	#[test]
	fn unreadable_file_restarts_at_one() {
		let dir = TempDir::new("unreadable_file_restarts_at_one");
		let path = dir.0.join("evidence_code_counter.dat");
		std::fs::write(&path, b"not a counter").unwrap();
		let counter = FileCounter::new(&path);
		assert_eq!(counter.next(), 1);
		assert_eq!(counter.next(), 2);
	}
}
