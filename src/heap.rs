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

// A heap file is a flat sequence of fixed-size blocks. Free and partial
// block sets and the live record total are derived state, rebuilt from the
// block headers at open and maintained on every mutation.
//
// Two allocation disciplines coexist and must stay distinct:
// `insert` may reuse a fully empty block, while `allocate_empty_block`
// (the index's block allocator) always appends. A group's primary block may
// be empty yet still owned, so the allocator must never hand it out again.

use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use crate::{
	block::{self, Block},
	error::{Error, Result},
	record::Record,
};

const HEADER_SIZE: usize = 4;

/// Stable location of a record: block index in the high 32 bits, slot index
/// in the low 32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(u64);

impl Address {
	pub fn new(block: u32, slot: u32) -> Address {
		Address(((block as u64) << 32) | slot as u64)
	}

	pub fn from_u64(raw: u64) -> Address {
		Address(raw)
	}

	pub fn block(&self) -> u32 {
		(self.0 >> 32) as u32
	}

	pub fn slot(&self) -> u32 {
		self.0 as u32
	}

	pub fn as_u64(&self) -> u64 {
		self.0
	}
}

impl std::fmt::Display for Address {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.block(), self.slot())
	}
}

/// How to treat a file whose length is not a whole number of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
	/// Truncate a ragged tail and drop trailing empty blocks at open.
	Repair,
	/// Refuse a ragged file and preserve trailing empty blocks; used for
	/// index-owned files where every block may be spoken for.
	Strict,
}

struct State {
	block_count: u32,
	free: BTreeSet<u32>,
	partial: BTreeSet<u32>,
	total_valid: u64,
}

pub struct HeapFile<R: Record> {
	path: PathBuf,
	file: std::fs::File,
	capacity: usize,
	block_size: u64,
	dirty: AtomicBool,
	state: Mutex<State>,
	_record: PhantomData<R>,
}

#[cfg(target_os = "macos")]
fn disable_read_ahead(file: &std::fs::File) -> Result<()> {
	use std::os::unix::io::AsRawFd;
	if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_RDAHEAD, 0) } != 0 {
		Err(std::io::Error::last_os_error())?
	} else {
		Ok(())
	}
}

#[cfg(not(target_os = "macos"))]
fn disable_read_ahead(_file: &std::fs::File) -> Result<()> {
	Ok(())
}

impl<R: Record> HeapFile<R> {
	pub fn open(path: &Path, cluster_size: u32, mode: OpenMode) -> Result<HeapFile<R>> {
		if (cluster_size as usize) < block::disk_size::<R>(1) {
			return Err(Error::InvalidConfiguration(format!(
				"Cluster size {} cannot hold a single {} byte record",
				cluster_size,
				R::SIZE,
			)));
		}
		let capacity = block::slot_capacity::<R>(cluster_size as usize);
		let block_size = block::disk_size::<R>(capacity) as u64;

		let file = std::fs::OpenOptions::new().create(true).read(true).write(true).open(path)?;
		disable_read_ahead(&file)?;
		let mut file_len = file.metadata()?.len();
		if file_len % block_size != 0 {
			match mode {
				OpenMode::Strict => {
					return Err(Error::Corruption(format!(
						"{}: length {} is not a multiple of the {} byte block size",
						path.display(),
						file_len,
						block_size,
					)));
				}
				OpenMode::Repair => {
					let fixed = file_len - file_len % block_size;
					log::warn!(
						target: "evidence-db",
						"{}: truncating ragged tail from {} to {} bytes",
						path.display(),
						file_len,
						fixed,
					);
					file.set_len(fixed)?;
					file_len = fixed;
				}
			}
		}

		let heap = HeapFile {
			path: path.into(),
			file,
			capacity,
			block_size,
			dirty: AtomicBool::new(false),
			state: Mutex::new(State {
				block_count: (file_len / block_size) as u32,
				free: BTreeSet::new(),
				partial: BTreeSet::new(),
				total_valid: 0,
			}),
			_record: PhantomData,
		};

		{
			let mut state = heap.state.lock();
			heap.rebuild_lists(&mut state)?;
			if mode == OpenMode::Repair {
				heap.shrink_locked(&mut state)?;
			}
			log::debug!(
				target: "evidence-db",
				"{}: opened with {} blocks, {} records",
				heap.path.display(),
				state.block_count,
				state.total_valid,
			);
		}
		Ok(heap)
	}

	/// Records per block.
	pub fn slot_capacity(&self) -> usize {
		self.capacity
	}

	pub fn block_count(&self) -> u32 {
		self.state.lock().block_count
	}

	pub fn total_valid_records(&self) -> u64 {
		self.state.lock().total_valid
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Place a record into the first partial block, else the first fully
	/// empty block, else a freshly appended one.
	pub fn insert(&self, record: R) -> Result<Address> {
		let mut state = self.state.lock();
		self.insert_locked(&mut state, record)
	}

	/// Insert only when no record with this id exists anywhere in the file.
	/// `None` signals a duplicate.
	pub fn insert_unique(&self, record: R) -> Result<Option<Address>> {
		let mut state = self.state.lock();
		if self.find_id_locked(&state, record.id())?.is_some() {
			return Ok(None);
		}
		Ok(Some(self.insert_locked(&mut state, record)?))
	}

	pub fn get(&self, address: Address) -> Result<Option<R>> {
		let state = self.state.lock();
		assert!((address.slot() as usize) < self.capacity, "Slot index out of block geometry");
		if address.block() >= state.block_count {
			return Ok(None);
		}
		let block = self.read_block_locked(address.block())?;
		Ok(block.get(address.slot() as usize).cloned())
	}

	/// Clear the addressed slot. Returns whether a record was removed; the
	/// tail is shrunk afterwards.
	pub fn delete(&self, address: Address) -> Result<bool> {
		let mut state = self.state.lock();
		assert!((address.slot() as usize) < self.capacity, "Slot index out of block geometry");
		if address.block() >= state.block_count {
			return Ok(false);
		}
		let mut block = self.read_block_locked(address.block())?;
		if block.delete(address.slot() as usize).is_none() {
			return Ok(false);
		}
		self.commit_block(&mut state, address.block(), &block)?;
		self.shrink_locked(&mut state)?;
		Ok(true)
	}

	pub fn exists_id(&self, id: &str) -> Result<bool> {
		let state = self.state.lock();
		Ok(self.find_id_locked(&state, id)?.is_some())
	}

	/// Live addresses in block-then-slot order.
	pub fn all_addresses(&self) -> Result<Vec<Address>> {
		let state = self.state.lock();
		let mut addresses = Vec::with_capacity(state.total_valid as usize);
		for i in 0..state.block_count {
			let block = self.read_block_locked(i)?;
			addresses.extend(block.records().map(|(slot, _)| Address::new(i, slot as u32)));
		}
		Ok(addresses)
	}

	pub fn read_block(&self, index: u32) -> Result<Block<R>> {
		let state = self.state.lock();
		assert!(index < state.block_count, "Block index out of range");
		self.read_block_locked(index)
	}

	/// Write a block image and fold its new occupancy into the derived
	/// free/partial/total state.
	pub fn write_block(&self, index: u32, block: &Block<R>) -> Result<()> {
		let mut state = self.state.lock();
		assert!(index < state.block_count, "Block index out of range");
		assert_eq!(block.capacity(), self.capacity, "Block geometry mismatch");
		self.commit_block(&mut state, index, block)
	}

	/// Append a fresh empty block at end-of-file and return its index.
	///
	/// Never reuses the free set: an empty block may still be owned by an
	/// index group.
	pub fn allocate_empty_block(&self) -> Result<u32> {
		let mut state = self.state.lock();
		let index = state.block_count;
		let empty: Block<R> = Block::new(self.capacity);
		self.write_at(&empty.to_bytes(), index as u64 * self.block_size)?;
		state.block_count += 1;
		state.free.insert(index);
		log::trace!(target: "evidence-db", "{}: appended block {}", self.path.display(), index);
		Ok(index)
	}

	/// Truncate the maximal run of trailing empty blocks, keeping one block
	/// when every block is empty.
	pub fn shrink_empty_tail(&self) -> Result<()> {
		let mut state = self.state.lock();
		self.shrink_locked(&mut state)
	}

	pub fn flush(&self) -> Result<()> {
		if let Ok(true) = self.dirty.compare_exchange(true, false, Ordering::Relaxed, Ordering::Relaxed) {
			self.file.sync_data()?;
		}
		Ok(())
	}

	/// Drop exactly the blocks at `new_count..`, which the caller asserts
	/// are empty. Used by the index to release a merged group's primary
	/// block without touching earlier, still-owned empty blocks.
	pub(crate) fn truncate_blocks(&self, new_count: u32) -> Result<()> {
		let mut state = self.state.lock();
		assert!(new_count <= state.block_count);
		debug_assert!((new_count..state.block_count).all(|i| state.free.contains(&i)));
		self.truncate_locked(&mut state, new_count)
	}

	/// Drop every block, live or not, and reset the derived state. Used by
	/// the index when it reinitializes after losing its meta file.
	pub(crate) fn clear(&self) -> Result<()> {
		let mut state = self.state.lock();
		if state.block_count > 0 {
			log::warn!(
				target: "evidence-db",
				"{}: clearing {} blocks ({} records)",
				self.path.display(),
				state.block_count,
				state.total_valid,
			);
		}
		self.file.set_len(0)?;
		self.dirty.store(true, Ordering::Relaxed);
		state.block_count = 0;
		state.free.clear();
		state.partial.clear();
		state.total_valid = 0;
		Ok(())
	}

	fn insert_locked(&self, state: &mut State, record: R) -> Result<Address> {
		if let Some(&index) = state.partial.iter().next() {
			let mut block = self.read_block_locked(index)?;
			let slot = block.insert(record).expect("Partial block has a free slot");
			self.commit_block(state, index, &block)?;
			return Ok(Address::new(index, slot as u32));
		}
		if let Some(&index) = state.free.iter().next() {
			// A fully empty block holds no live data; start from a blank image.
			let mut block = Block::new(self.capacity);
			let slot = block.insert(record).expect("Empty block has a free slot");
			self.commit_block(state, index, &block)?;
			return Ok(Address::new(index, slot as u32));
		}
		// Append. The block does not exist on disk yet, so its state is
		// folded in directly rather than through `commit_block`.
		let index = state.block_count;
		let mut block = Block::new(self.capacity);
		let slot = block.insert(record).expect("Empty block has a free slot");
		self.write_at(&block.to_bytes(), index as u64 * self.block_size)?;
		state.block_count += 1;
		state.total_valid += 1;
		if !block.is_full() {
			state.partial.insert(index);
		}
		Ok(Address::new(index, slot as u32))
	}

	fn find_id_locked(&self, state: &State, id: &str) -> Result<Option<Address>> {
		for i in 0..state.block_count {
			let block = self.read_block_locked(i)?;
			if let Some((slot, _)) = block.find_by_id(id) {
				return Ok(Some(Address::new(i, slot as u32)));
			}
		}
		Ok(None)
	}

	// Writes the image and reclassifies the block, adjusting the record
	// total by the difference against the previous on-disk header.
	fn commit_block(&self, state: &mut State, index: u32, block: &Block<R>) -> Result<()> {
		let old_valid = self.read_header(index)?;
		let new_valid = block.valid_count();
		self.write_at(&block.to_bytes(), index as u64 * self.block_size)?;
		state.total_valid = state.total_valid + new_valid as u64 - old_valid as u64;
		if new_valid == 0 {
			state.free.insert(index);
		} else {
			state.free.remove(&index);
		}
		if new_valid > 0 && (new_valid as usize) < self.capacity {
			state.partial.insert(index);
		} else {
			state.partial.remove(&index);
		}
		Ok(())
	}

	fn rebuild_lists(&self, state: &mut State) -> Result<()> {
		state.free.clear();
		state.partial.clear();
		state.total_valid = 0;
		for i in 0..state.block_count {
			let mut valid = self.read_header(i)?;
			if valid as usize > self.capacity {
				log::warn!(
					target: "evidence-db",
					"{}: block {} advertises {} records in {} slots, treating as empty",
					self.path.display(),
					i,
					valid,
					self.capacity,
				);
				valid = 0;
			}
			if valid == 0 {
				state.free.insert(i);
			} else if (valid as usize) < self.capacity {
				state.partial.insert(i);
			}
			state.total_valid += valid as u64;
		}
		Ok(())
	}

	fn shrink_locked(&self, state: &mut State) -> Result<()> {
		if state.block_count == 0 {
			return Ok(());
		}
		let last_live = (0..state.block_count).rev().find(|i| !state.free.contains(i));
		let new_count = match last_live {
			Some(last) => last + 1,
			None => 1,
		};
		self.truncate_locked(state, new_count)
	}

	fn truncate_locked(&self, state: &mut State, new_count: u32) -> Result<()> {
		if new_count >= state.block_count {
			return Ok(());
		}
		log::debug!(
			target: "evidence-db",
			"{}: shrinking from {} to {} blocks",
			self.path.display(),
			state.block_count,
			new_count,
		);
		self.file.set_len(new_count as u64 * self.block_size)?;
		self.dirty.store(true, Ordering::Relaxed);
		state.block_count = new_count;
		state.free.split_off(&new_count);
		state.partial.split_off(&new_count);
		Ok(())
	}

	fn read_block_locked(&self, index: u32) -> Result<Block<R>> {
		let mut buf = vec![0u8; self.block_size as usize];
		self.read_at(&mut buf, index as u64 * self.block_size)?;
		Ok(Block::from_bytes(&buf))
	}

	fn read_header(&self, index: u32) -> Result<u32> {
		let mut buf = [0u8; HEADER_SIZE];
		self.read_at(&mut buf, index as u64 * self.block_size)?;
		Ok(u32::from_le_bytes(buf))
	}

	#[cfg(unix)]
	fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
		use std::os::unix::fs::FileExt;
		Ok(self.file.read_exact_at(buf, offset)?)
	}

	#[cfg(unix)]
	fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
		use std::os::unix::fs::FileExt;
		self.dirty.store(true, Ordering::Relaxed);
		Ok(self.file.write_all_at(buf, offset)?)
	}

	#[cfg(windows)]
	fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
		use std::os::windows::fs::FileExt;
		self.file.seek_read(buf, offset)?;
		Ok(())
	}

	#[cfg(windows)]
	fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
		use std::os::windows::fs::FileExt;
		self.dirty.store(true, Ordering::Relaxed);
		self.file.seek_write(buf, offset)?;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::{Address, HeapFile, OpenMode};
	use crate::record::{PatientRecord, Record, TestRecord};

	const CLUSTER: u32 = 256;

	struct TempDir(std::path::PathBuf);

	impl TempDir {
		fn new(name: &'static str) -> TempDir {
			env_logger::try_init().ok();
			let mut path = std::env::temp_dir();
			path.push("evidence-db-test");
			path.push("heap");
			path.push(name);

			if path.exists() {
				std::fs::remove_dir_all(&path).unwrap();
			}
			std::fs::create_dir_all(&path).unwrap();
			TempDir(path)
		}

		fn file(&self, name: &str) -> std::path::PathBuf {
			self.0.join(name)
		}

		fn heap(&self, mode: OpenMode) -> HeapFile<PatientRecord> {
			HeapFile::open(&self.file("heap.dat"), CLUSTER, mode).unwrap()
		}
	}

	impl Drop for TempDir {
		fn drop(&mut self) {
			if self.0.exists() {
				std::fs::remove_dir_all(&self.0).unwrap();
			}
		}
	}

	fn patient(n: u32) -> PatientRecord {
		PatientRecord::new("Nora", "Szabó", "23:08:1979", &format!("P{:07}", n))
	}

	#[test]
	fn address_stability() {
		let dir = TempDir::new("address_stability");
		let heap = dir.heap(OpenMode::Repair);

		let mut addresses = Vec::new();
		for n in 0..20 {
			addresses.push((heap.insert(patient(n)).unwrap(), patient(n)));
		}
		// Deleting one record leaves every other address intact.
		let (victim, _) = addresses.remove(7);
		assert!(heap.delete(victim).unwrap());
		assert!(heap.get(victim).unwrap().is_none());
		for (address, expected) in &addresses {
			assert_eq!(heap.get(*address).unwrap().as_ref(), Some(expected));
		}
	}

	#[test]
	fn count_consistency() {
		let dir = TempDir::new("count_consistency");
		let heap = dir.heap(OpenMode::Repair);

		let mut live = Vec::new();
		for n in 0..30 {
			live.push(heap.insert(patient(n)).unwrap());
		}
		for _ in 0..10 {
			let address = live.swap_remove(live.len() / 2);
			assert!(heap.delete(address).unwrap());
			assert_eq!(heap.total_valid_records() as usize, live.len());
			assert_eq!(heap.all_addresses().unwrap().len(), live.len());
		}
	}

	#[test]
	fn duplicate_ids_are_rejected() {
		let dir = TempDir::new("duplicate_ids_are_rejected");
		let heap = dir.heap(OpenMode::Repair);

		assert!(heap.insert_unique(patient(1)).unwrap().is_some());
		assert!(heap.insert_unique(patient(2)).unwrap().is_some());
		assert!(heap.insert_unique(patient(1)).unwrap().is_none());
		assert_eq!(heap.total_valid_records(), 2);
		assert!(heap.exists_id("P0000001").unwrap());
		assert!(!heap.exists_id("P0000009").unwrap());
	}

	#[test]
	fn insert_reuses_freed_blocks_first() {
		let dir = TempDir::new("insert_reuses_freed_blocks_first");
		let heap = dir.heap(OpenMode::Repair);
		let per_block = heap.slot_capacity() as u32;

		let mut addresses = Vec::new();
		for n in 0..per_block * 3 {
			addresses.push(heap.insert(patient(n)).unwrap());
		}
		assert_eq!(heap.block_count(), 3);

		// Empty out block 1; the tail stays, so the block is reusable.
		for address in &addresses {
			if address.block() == 1 {
				assert!(heap.delete(*address).unwrap());
			}
		}
		assert_eq!(heap.block_count(), 3);
		let address = heap.insert(patient(1000)).unwrap();
		assert_eq!(address.block(), 1);

		// The index-side allocator must append instead.
		assert_eq!(heap.allocate_empty_block().unwrap(), 3);
		assert_eq!(heap.block_count(), 4);
	}

	#[test]
	fn tail_shrink() {
		let dir = TempDir::new("tail_shrink");
		let heap = dir.heap(OpenMode::Repair);

		let mut addresses = Vec::new();
		for n in 0..50 {
			addresses.push(heap.insert(patient(n)).unwrap());
		}
		let mut previous = heap.block_count();
		for address in addresses.iter().rev() {
			assert!(heap.delete(*address).unwrap());
			let count = heap.block_count();
			assert!(count <= previous);
			previous = count;
		}
		assert_eq!(heap.total_valid_records(), 0);
		assert_eq!(heap.block_count(), 1);
	}

	#[test]
	fn reopen_rebuilds_derived_state() {
		let dir = TempDir::new("reopen_rebuilds_derived_state");
		let address;
		{
			let heap = dir.heap(OpenMode::Repair);
			for n in 0..10 {
				heap.insert(patient(n)).unwrap();
			}
			address = heap.insert(patient(77)).unwrap();
			heap.flush().unwrap();
		}
		let heap = dir.heap(OpenMode::Repair);
		assert_eq!(heap.total_valid_records(), 11);
		assert_eq!(heap.get(address).unwrap().unwrap().id(), "P0000077");
		// A partially filled tail block keeps accepting records.
		let next = heap.insert(patient(78)).unwrap();
		assert_eq!(next.block(), address.block());
	}

	#[test]
	fn ragged_tail_repair_and_strict() {
		let dir = TempDir::new("ragged_tail_repair_and_strict");
		{
			let heap = dir.heap(OpenMode::Repair);
			for n in 0..8 {
				heap.insert(patient(n)).unwrap();
			}
		}
		// Tack garbage onto the file so its length is no longer block-aligned.
		use std::io::Write;
		let mut file = std::fs::OpenOptions::new().append(true).open(dir.file("heap.dat")).unwrap();
		file.write_all(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
		drop(file);

		assert!(matches!(
			HeapFile::<PatientRecord>::open(&dir.file("heap.dat"), CLUSTER, OpenMode::Strict),
			Err(crate::error::Error::Corruption(_)),
		));
		let heap = dir.heap(OpenMode::Repair);
		assert_eq!(heap.total_valid_records(), 8);
	}

	#[test]
	fn strict_mode_preserves_trailing_empty_blocks() {
		let dir = TempDir::new("strict_mode_preserves_trailing_empty_blocks");
		{
			let heap = dir.heap(OpenMode::Strict);
			heap.allocate_empty_block().unwrap();
			heap.allocate_empty_block().unwrap();
			heap.flush().unwrap();
		}
		let heap = dir.heap(OpenMode::Strict);
		assert_eq!(heap.block_count(), 2);
		// Repair mode drops the same tail down to one block.
		drop(heap);
		let heap = dir.heap(OpenMode::Repair);
		assert_eq!(heap.block_count(), 1);
	}

	#[test]
	fn get_out_of_range_is_a_miss() {
		let dir = TempDir::new("get_out_of_range_is_a_miss");
		let heap = dir.heap(OpenMode::Repair);
		heap.insert(patient(1)).unwrap();
		assert!(heap.get(Address::new(40, 0)).unwrap().is_none());
		assert!(!heap.delete(Address::new(40, 0)).unwrap());
	}

	#[test]
	fn test_records_share_the_storage_contract() {
		let dir = TempDir::new("test_records_share_the_storage_contract");
		let heap: HeapFile<TestRecord> =
			HeapFile::open(&dir.file("tests.dat"), CLUSTER, OpenMode::Repair).unwrap();
		// 55 byte test records still pack four to a 256 byte cluster.
		assert_eq!(heap.slot_capacity(), 4);

		let evidence = |n: u32| {
			TestRecord::new(&format!("T{:07}", n), &format!("P{:07}", n % 7), "11:05:2021", n % 3 == 0, "lab 4")
		};
		let mut addresses = Vec::new();
		for n in 0..10 {
			addresses.push(heap.insert(evidence(n)).unwrap());
		}
		assert_eq!(heap.block_count(), 3);
		assert_eq!(heap.total_valid_records(), 10);
		assert!(heap.exists_id("T0000003").unwrap());
		assert_eq!(heap.get(addresses[5]).unwrap().unwrap(), evidence(5));

		assert!(heap.delete(addresses[9]).unwrap());
		assert!(heap.delete(addresses[8]).unwrap());
		assert_eq!(heap.block_count(), 2);
		assert_eq!(heap.total_valid_records(), 8);
		assert!(heap.insert_unique(evidence(0)).unwrap().is_none());
	}

	#[test]
	fn cluster_too_small_is_rejected() {
		let dir = TempDir::new("cluster_too_small_is_rejected");
		assert!(matches!(
			HeapFile::<PatientRecord>::open(&dir.file("tiny.dat"), 32, OpenMode::Repair),
			Err(crate::error::Error::InvalidConfiguration(_)),
		));
	}
}
