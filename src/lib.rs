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

//! Block-oriented record storage for a PCR-test evidence database.
//!
//! The crate has three layers. A [`Record`] is a value with a fixed
//! serialized size and a string primary key. A [`HeapFile`] persists
//! records of one type in fixed-size blocks, reclaiming freed space and
//! shrinking its tail. A [`LinearHash`] index layers two heap files
//! (primary buckets and overflow chains) under a dynamic linear-hash
//! directory with online splitting and merging driven by load factor,
//! giving expected O(1) lookup, insert and delete by key.

mod block;
mod counter;
mod error;
mod heap;
mod index;
mod meta;
mod options;
mod record;

pub use block::Block;
pub use counter::FileCounter;
pub use error::{Error, Result};
pub use heap::{Address, HeapFile, OpenMode};
pub use index::{GroupDump, LinearHash, StructureDump};
pub use options::Options;
pub use record::{PatientRecord, Record, TestRecord};
