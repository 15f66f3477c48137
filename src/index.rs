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

// Linear-hash index over two heap files.
//
// Every bucket group owns exactly one block in the primary file and a
// singly-linked chain of blocks in the overflow file. The directory
// (group -> primary block, group -> first overflow, overflow -> next) lives
// in memory and is persisted to the meta file as the final write of every
// mutating operation.
//
// Group count tracks `initial_groups * 2^level + split_pointer` exactly:
// splits append the sibling of the group under the split pointer, merges
// fold the tail group back into its split parent.

use std::convert::TryInto;
use std::path::{Path, PathBuf};
use fs2::FileExt;
use parking_lot::Mutex;
use crate::{
	block::Block,
	error::{Error, Result},
	heap::{HeapFile, OpenMode},
	meta::Meta,
	options::Options,
	record::Record,
};

const PRIMARY_SUFFIX: &str = "_lh_primary.dat";
const OVERFLOW_SUFFIX: &str = "_lh_overflow.dat";
const META_SUFFIX: &str = "_lhmeta.dat";

/// Non-negative key hash, stable across platforms and restarts. The top bit
/// is cleared so the value is non-negative as a signed quantity; this also
/// maps the sign-bit-only edge value to zero.
fn key_hash(key: &str) -> u64 {
	let hash = blake2_rfc::blake2b::blake2b(8, &[], key.as_bytes());
	let raw = u64::from_le_bytes(hash.as_bytes().try_into().unwrap());
	raw & 0x7fff_ffff_ffff_ffff
}

struct Directory {
	initial_groups: u32,
	max_density: f64,
	min_density: f64,
	level: u32,
	split_pointer: u32,
	total_records: u64,
	primary_of: Vec<u32>,
	first_overflow: Vec<Option<u32>>,
	overflow_next: Vec<Option<u32>>,
}

impl Directory {
	fn group_count(&self) -> u32 {
		self.primary_of.len() as u32
	}

	fn level_groups(&self) -> u64 {
		self.initial_groups as u64 * (1u64 << self.level)
	}

	fn group_of(&self, key: &str) -> u32 {
		let level_groups = self.level_groups();
		let hash = key_hash(key);
		let mut group = hash % level_groups;
		if group < self.split_pointer as u64 {
			group = hash % (2 * level_groups);
		}
		group as u32
	}

	fn chain_of(&self, group: u32) -> Vec<u32> {
		let mut chain = Vec::new();
		let mut link = self.first_overflow[group as usize];
		while let Some(block) = link {
			chain.push(block);
			link = self.overflow_next[block as usize];
		}
		chain
	}
}

/// Record keys of one group, primary block first, chain blocks in order.
#[derive(Debug, Clone)]
pub struct GroupDump {
	pub group: u32,
	pub primary_block: u32,
	pub primary: Vec<String>,
	pub chain: Vec<(u32, Vec<String>)>,
}

/// Snapshot of the index structure, for debugging and tests.
#[derive(Debug, Clone)]
pub struct StructureDump {
	pub initial_groups: u32,
	pub level: u32,
	pub split_pointer: u32,
	pub group_count: u32,
	pub total_records: u64,
	pub primary_blocks: u32,
	pub overflow_blocks: u32,
	pub groups: Vec<GroupDump>,
}

impl std::fmt::Display for StructureDump {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		writeln!(
			f,
			"M={} level={} split={} groups={} records={} primary_blocks={} overflow_blocks={}",
			self.initial_groups,
			self.level,
			self.split_pointer,
			self.group_count,
			self.total_records,
			self.primary_blocks,
			self.overflow_blocks,
		)?;
		for group in &self.groups {
			writeln!(f, "  group {} @ block {}: {:?}", group.group, group.primary_block, group.primary)?;
			for (block, keys) in &group.chain {
				writeln!(f, "    overflow {}: {:?}", block, keys)?;
			}
		}
		Ok(())
	}
}

/// A dynamic linear-hash index keyed by record id, backed by a primary and
/// an overflow heap file plus a meta file, all sharing one base path.
pub struct LinearHash<R: Record> {
	primary: HeapFile<R>,
	overflow: HeapFile<R>,
	meta_file: std::fs::File,
	base: PathBuf,
	state: Mutex<Directory>,
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
	let mut name = base.as_os_str().to_os_string();
	name.push(suffix);
	PathBuf::from(name)
}

impl<R: Record> LinearHash<R> {
	/// Open or create the index at `base`. An existing structure is
	/// reconstructed from the meta file; a fresh one starts with
	/// `options.initial_groups` empty primary blocks.
	pub fn open(base: &Path, options: &Options) -> Result<LinearHash<R>> {
		options.validate(R::SIZE)?;

		let meta_file = std::fs::OpenOptions::new()
			.create(true)
			.read(true)
			.write(true)
			.open(with_suffix(base, META_SUFFIX))?;
		meta_file.try_lock_exclusive().map_err(Error::Locked)?;

		let primary = HeapFile::open(&with_suffix(base, PRIMARY_SUFFIX), options.cluster_size, OpenMode::Strict)?;
		let overflow = HeapFile::open(&with_suffix(base, OVERFLOW_SUFFIX), options.cluster_size, OpenMode::Strict)?;
		debug_assert_eq!(primary.slot_capacity(), overflow.slot_capacity());

		let index = LinearHash {
			primary,
			overflow,
			meta_file,
			base: base.into(),
			state: Mutex::new(Directory {
				initial_groups: options.initial_groups,
				max_density: options.max_density,
				min_density: options.min_density,
				level: 0,
				split_pointer: 0,
				total_records: 0,
				primary_of: Vec::new(),
				first_overflow: Vec::new(),
				overflow_next: Vec::new(),
			}),
		};

		let meta_len = index.meta_file.metadata()?.len();
		{
			let mut dir = index.state.lock();
			if meta_len == 0 {
				// A missing meta file means a fresh structure, even when the
				// data files still hold blocks from a lost directory.
				if index.primary.block_count() != 0 || index.overflow.block_count() != 0 {
					index.primary.clear()?;
					index.overflow.clear()?;
				}
				for group in 0..options.initial_groups {
					let block = index.primary.allocate_empty_block()?;
					debug_assert_eq!(block, group);
					dir.primary_of.push(block);
					dir.first_overflow.push(None);
				}
				index.persist(&dir)?;
				log::debug!(
					target: "evidence-db",
					"{}: initialized fresh index with {} groups",
					index.base.display(),
					options.initial_groups,
				);
			} else {
				let meta = Meta::read_from(&index.meta_file)?;
				index.adopt(&mut dir, meta)?;
				log::debug!(
					target: "evidence-db",
					"{}: opened index with {} groups, {} records",
					index.base.display(),
					dir.group_count(),
					dir.total_records,
				);
			}
		}
		Ok(index)
	}

	// Installs decoded meta after cross-checking it against the heap files.
	fn adopt(&self, dir: &mut Directory, meta: Meta) -> Result<()> {
		let groups = meta.group_count() as u64;
		let expected = meta.initial_groups as u64 * (1u64 << meta.level) + meta.split_pointer as u64;
		if meta.initial_groups == 0 || groups != expected {
			return Err(Error::Corruption(format!(
				"Group count {} does not match level {} and split pointer {}",
				groups, meta.level, meta.split_pointer,
			)));
		}
		let primary_blocks = self.primary.block_count();
		if meta.primary_block_of_group.iter().any(|&b| b >= primary_blocks) {
			return Err(Error::Corruption("Primary block map points past end of file".into()));
		}
		let overflow_blocks = self.overflow.block_count() as usize;
		if meta.overflow_next.len() != overflow_blocks {
			return Err(Error::Corruption(format!(
				"Overflow map covers {} blocks, file has {}",
				meta.overflow_next.len(),
				overflow_blocks,
			)));
		}
		let link_ok = |link: &Option<u32>| link.map_or(true, |b| (b as usize) < overflow_blocks);
		if !meta.first_overflow_of_group.iter().all(link_ok) || !meta.overflow_next.iter().all(link_ok) {
			return Err(Error::Corruption("Overflow link points past end of file".into()));
		}

		dir.initial_groups = meta.initial_groups;
		dir.max_density = meta.max_density;
		dir.min_density = meta.min_density;
		dir.level = meta.level;
		dir.split_pointer = meta.split_pointer;
		dir.total_records = meta.total_records;
		dir.primary_of = meta.primary_block_of_group;
		dir.first_overflow = meta.first_overflow_of_group;
		dir.overflow_next = meta.overflow_next;
		Ok(())
	}

	pub fn total_records(&self) -> u64 {
		self.state.lock().total_records
	}

	pub fn group_count(&self) -> u32 {
		self.state.lock().group_count()
	}

	/// The primary heap file, for bulk scans by the domain layer.
	pub fn primary_file(&self) -> &HeapFile<R> {
		&self.primary
	}

	/// The overflow heap file, for bulk scans by the domain layer.
	pub fn overflow_file(&self) -> &HeapFile<R> {
		&self.overflow
	}

	/// Every live record, in file order, primary file first.
	pub fn all_records(&self) -> Result<Vec<R>> {
		let _dir = self.state.lock();
		let mut records = Vec::new();
		for file in [&self.primary, &self.overflow] {
			for address in file.all_addresses()? {
				if let Some(record) = file.get(address)? {
					records.push(record);
				}
			}
		}
		Ok(records)
	}

	pub fn insert(&self, record: R) -> Result<()> {
		let mut dir = self.state.lock();
		let group = dir.group_of(record.id());
		log::trace!(
			target: "evidence-db",
			"{}: insert {} into group {}",
			self.base.display(),
			record.id(),
			group,
		);
		self.insert_into_group(&mut dir, group, record)?;
		dir.total_records += 1;
		if self.density(&dir) > dir.max_density {
			self.split(&mut dir)?;
		}
		self.persist(&dir)
	}

	pub fn find_by_id(&self, key: &str) -> Result<Option<R>> {
		let dir = self.state.lock();
		let group = dir.group_of(key);
		let block = self.primary.read_block(dir.primary_of[group as usize])?;
		if let Some((_, record)) = block.find_by_id(key) {
			return Ok(Some(record.clone()));
		}
		for overflow_block in dir.chain_of(group) {
			let block = self.overflow.read_block(overflow_block)?;
			if let Some((_, record)) = block.find_by_id(key) {
				return Ok(Some(record.clone()));
			}
		}
		Ok(None)
	}

	/// Rewrite the stored record carrying `record.id()` in place. Returns
	/// false, without side effects, when the key is absent.
	pub fn edit_by_id(&self, record: &R) -> Result<bool> {
		let dir = self.state.lock();
		let group = dir.group_of(record.id());
		let primary_block = dir.primary_of[group as usize];
		let mut block = self.primary.read_block(primary_block)?;
		if let Some((slot, _)) = block.find_by_id(record.id()) {
			block.replace(slot, record.clone());
			self.primary.write_block(primary_block, &block)?;
			self.persist(&dir)?;
			return Ok(true);
		}
		for overflow_block in dir.chain_of(group) {
			let mut block = self.overflow.read_block(overflow_block)?;
			if let Some((slot, _)) = block.find_by_id(record.id()) {
				block.replace(slot, record.clone());
				self.overflow.write_block(overflow_block, &block)?;
				self.persist(&dir)?;
				return Ok(true);
			}
		}
		Ok(false)
	}

	pub fn delete_by_id(&self, key: &str) -> Result<bool> {
		let mut dir = self.state.lock();
		let group = dir.group_of(key);
		let primary_block = dir.primary_of[group as usize];
		let mut freed_overflow = false;
		let mut found = false;

		let mut block = self.primary.read_block(primary_block)?;
		if block.delete_by_id(key).is_some() {
			self.primary.write_block(primary_block, &block)?;
			found = true;
		} else {
			let mut previous: Option<u32> = None;
			let mut link = dir.first_overflow[group as usize];
			while let Some(overflow_block) = link {
				let mut block = self.overflow.read_block(overflow_block)?;
				if block.delete_by_id(key).is_some() {
					self.overflow.write_block(overflow_block, &block)?;
					if block.is_empty() {
						let next = dir.overflow_next[overflow_block as usize];
						match previous {
							Some(p) => dir.overflow_next[p as usize] = next,
							None => dir.first_overflow[group as usize] = next,
						}
						dir.overflow_next[overflow_block as usize] = None;
						freed_overflow = true;
					}
					found = true;
					break;
				}
				previous = Some(overflow_block);
				link = dir.overflow_next[overflow_block as usize];
			}
		}
		if !found {
			return Ok(false);
		}

		dir.total_records -= 1;
		if self.compact_chain(&mut dir, group)? {
			freed_overflow = true;
		}
		if freed_overflow {
			self.overflow.shrink_empty_tail()?;
			self.sync_overflow_links(&mut dir);
		}
		if self.density(&dir) < dir.min_density && dir.group_count() > dir.initial_groups {
			self.merge(&mut dir)?;
		}
		self.persist(&dir)?;
		Ok(true)
	}

	pub fn dump_structure(&self) -> Result<StructureDump> {
		let dir = self.state.lock();
		let mut groups = Vec::with_capacity(dir.primary_of.len());
		for (group, &primary_block) in dir.primary_of.iter().enumerate() {
			let block = self.primary.read_block(primary_block)?;
			let primary = block.records().map(|(_, r)| r.id().to_string()).collect();
			let mut chain = Vec::new();
			for overflow_block in dir.chain_of(group as u32) {
				let block = self.overflow.read_block(overflow_block)?;
				chain.push((overflow_block, block.records().map(|(_, r)| r.id().to_string()).collect()));
			}
			groups.push(GroupDump { group: group as u32, primary_block, primary, chain });
		}
		Ok(StructureDump {
			initial_groups: dir.initial_groups,
			level: dir.level,
			split_pointer: dir.split_pointer,
			group_count: dir.group_count(),
			total_records: dir.total_records,
			primary_blocks: self.primary.block_count(),
			overflow_blocks: self.overflow.block_count(),
			groups,
		})
	}

	/// Rewrite meta and flush both data files.
	pub fn close(self) -> Result<()> {
		{
			let dir = self.state.lock();
			self.persist(&dir)?;
		}
		self.primary.flush()?;
		self.overflow.flush()?;
		self.meta_file.sync_data()?;
		Ok(())
	}

	fn capacity(&self) -> usize {
		self.primary.slot_capacity()
	}

	fn density(&self, dir: &Directory) -> f64 {
		let slots = (self.primary.block_count() + self.overflow.block_count()) as u64 * self.capacity() as u64;
		dir.total_records as f64 / slots as f64
	}

	fn insert_into_group(&self, dir: &mut Directory, group: u32, record: R) -> Result<()> {
		let primary_block = dir.primary_of[group as usize];
		let mut block = self.primary.read_block(primary_block)?;
		if !block.is_full() {
			block.insert(record).expect("Block is not full");
			return self.primary.write_block(primary_block, &block);
		}
		let mut tail = None;
		let mut link = dir.first_overflow[group as usize];
		while let Some(overflow_block) = link {
			let mut block = self.overflow.read_block(overflow_block)?;
			if !block.is_full() {
				block.insert(record).expect("Block is not full");
				return self.overflow.write_block(overflow_block, &block);
			}
			tail = Some(overflow_block);
			link = dir.overflow_next[overflow_block as usize];
		}
		// The whole chain is full; extend it with a fresh block.
		let new_block = self.allocate_overflow_block(dir)?;
		let mut block: Block<R> = Block::new(self.capacity());
		block.insert(record).expect("Block is not full");
		self.overflow.write_block(new_block, &block)?;
		match tail {
			Some(t) => dir.overflow_next[t as usize] = Some(new_block),
			None => dir.first_overflow[group as usize] = Some(new_block),
		}
		dir.overflow_next[new_block as usize] = None;
		Ok(())
	}

	fn allocate_overflow_block(&self, dir: &mut Directory) -> Result<u32> {
		let index = self.overflow.allocate_empty_block()?;
		if dir.overflow_next.len() <= index as usize {
			dir.overflow_next.resize(index as usize + 1, None);
		}
		Ok(index)
	}

	fn sync_overflow_links(&self, dir: &mut Directory) {
		let count = self.overflow.block_count() as usize;
		debug_assert!(dir.overflow_next.iter().skip(count).all(|l| l.is_none()));
		dir.overflow_next.truncate(count);
	}

	// Number of overflow blocks a bucket of `records` records needs beyond
	// its primary block.
	fn overflow_blocks_needed(&self, records: usize) -> usize {
		let capacity = self.capacity();
		if records > capacity {
			(records - capacity + capacity - 1) / capacity
		} else {
			0
		}
	}

	// Rewrites a bucket: primary block packed from the front of `records`,
	// the rest spread over `chain` in order, links rewritten to match.
	fn write_bucket(&self, dir: &mut Directory, group: u32, records: &[R], chain: &[u32]) -> Result<()> {
		let capacity = self.capacity();
		let head = std::cmp::min(capacity, records.len());
		self.primary.write_block(dir.primary_of[group as usize], &Block::packed(capacity, &records[..head]))?;
		let mut at = head;
		for (i, &overflow_block) in chain.iter().enumerate() {
			let end = std::cmp::min(at + capacity, records.len());
			self.overflow.write_block(overflow_block, &Block::packed(capacity, &records[at..end]))?;
			dir.overflow_next[overflow_block as usize] = chain.get(i + 1).copied();
			at = end;
		}
		debug_assert_eq!(at, records.len());
		dir.first_overflow[group as usize] = chain.first().copied();
		Ok(())
	}

	fn bucket_records(&self, dir: &Directory, group: u32, chain: &[u32]) -> Result<Vec<R>> {
		let block = self.primary.read_block(dir.primary_of[group as usize])?;
		let mut records: Vec<R> = block.records().map(|(_, r)| r.clone()).collect();
		for &overflow_block in chain {
			let block = self.overflow.read_block(overflow_block)?;
			records.extend(block.records().map(|(_, r)| r.clone()));
		}
		Ok(records)
	}

	/// Re-pack a group into its primary block and the minimal prefix of its
	/// existing chain. Surplus chain blocks are emptied and detached.
	/// Returns whether any block was freed.
	fn compact_chain(&self, dir: &mut Directory, group: u32) -> Result<bool> {
		let chain = dir.chain_of(group);
		if chain.is_empty() {
			return Ok(false);
		}
		let records = self.bucket_records(dir, group, &chain)?;
		let needed = self.overflow_blocks_needed(records.len());
		if needed >= chain.len() {
			return Ok(false);
		}
		log::debug!(
			target: "evidence-db",
			"{}: compacting group {} chain from {} to {} blocks",
			self.base.display(),
			group,
			chain.len(),
			needed,
		);
		self.write_bucket(dir, group, &records, &chain[..needed])?;
		for &overflow_block in &chain[needed..] {
			self.overflow.write_block(overflow_block, &Block::new(self.capacity()))?;
			dir.overflow_next[overflow_block as usize] = None;
		}
		Ok(true)
	}

	// Splits the group under the split pointer, appending its sibling as
	// the new last group. Records are repartitioned by the doubled modulus;
	// the existing chain blocks are reused before any new block is
	// allocated.
	fn split(&self, dir: &mut Directory) -> Result<()> {
		let level_groups = dir.level_groups();
		let parent = dir.split_pointer;
		let sibling = dir.group_count();
		debug_assert_eq!(sibling as u64, level_groups + parent as u64);

		let primary_block = self.primary.allocate_empty_block()?;
		dir.primary_of.push(primary_block);
		dir.first_overflow.push(None);

		let mut chain = dir.chain_of(parent);
		let records = self.bucket_records(dir, parent, &chain)?;
		let (moved, stay): (Vec<R>, Vec<R>) = records
			.into_iter()
			.partition(|r| key_hash(r.id()) % (2 * level_groups) == sibling as u64);

		let stay_blocks = self.overflow_blocks_needed(stay.len());
		let move_blocks = self.overflow_blocks_needed(moved.len());
		while chain.len() < stay_blocks + move_blocks {
			let block = self.allocate_overflow_block(dir)?;
			chain.push(block);
		}

		self.write_bucket(dir, parent, &stay, &chain[..stay_blocks])?;
		self.write_bucket(dir, sibling, &moved, &chain[stay_blocks..stay_blocks + move_blocks])?;
		for &overflow_block in &chain[stay_blocks + move_blocks..] {
			self.overflow.write_block(overflow_block, &Block::new(self.capacity()))?;
			dir.overflow_next[overflow_block as usize] = None;
		}

		dir.split_pointer += 1;
		if dir.split_pointer as u64 == level_groups {
			dir.split_pointer = 0;
			dir.level += 1;
		}
		log::debug!(
			target: "evidence-db",
			"{}: split group {} into {} ({} stay, {} moved), level {} split {}",
			self.base.display(),
			parent,
			sibling,
			stay.len(),
			moved.len(),
			dir.level,
			dir.split_pointer,
		);
		Ok(())
	}

	// Folds the last group back into its split parent and drops its
	// directory entry. Only called while the group count exceeds the
	// configured floor.
	fn merge(&self, dir: &mut Directory) -> Result<()> {
		let from = dir.group_count() - 1;
		let level_groups = dir.level_groups();
		let parent_span = if dir.split_pointer > 0 { level_groups } else { level_groups / 2 };
		let to = from - parent_span as u32;

		let chain = dir.chain_of(from);
		let records = self.bucket_records(dir, from, &chain)?;
		let from_primary = dir.primary_of[from as usize];
		self.primary.write_block(from_primary, &Block::new(self.capacity()))?;
		for &overflow_block in &chain {
			self.overflow.write_block(overflow_block, &Block::new(self.capacity()))?;
			dir.overflow_next[overflow_block as usize] = None;
		}
		dir.first_overflow[from as usize] = None;

		let moved = records.len();
		for record in records {
			self.insert_into_group(dir, to, record)?;
		}

		dir.primary_of.pop();
		dir.first_overflow.pop();
		if dir.split_pointer > 0 {
			dir.split_pointer -= 1;
		} else {
			dir.level -= 1;
			dir.split_pointer = (dir.level_groups() - 1) as u32;
		}

		// The merged group's primary block is empty now; release it when it
		// is the file tail. Earlier empty blocks stay, they are still owned.
		if from_primary + 1 == self.primary.block_count() {
			self.primary.truncate_blocks(from_primary)?;
		}
		if !chain.is_empty() {
			self.overflow.shrink_empty_tail()?;
			self.sync_overflow_links(dir);
		}
		log::debug!(
			target: "evidence-db",
			"{}: merged group {} into {} ({} records), level {} split {}",
			self.base.display(),
			from,
			to,
			moved,
			dir.level,
			dir.split_pointer,
		);
		Ok(())
	}

	fn persist(&self, dir: &Directory) -> Result<()> {
		let meta = Meta {
			initial_groups: dir.initial_groups,
			max_density: dir.max_density,
			min_density: dir.min_density,
			level: dir.level,
			split_pointer: dir.split_pointer,
			total_records: dir.total_records,
			primary_block_of_group: dir.primary_of.clone(),
			first_overflow_of_group: dir.first_overflow.clone(),
			overflow_next: dir.overflow_next.clone(),
		};
		meta.write_to(&self.meta_file)
	}
}
