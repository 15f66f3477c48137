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

use crate::error::{Error, Result};

/// Geometry and load-factor settings for a linear-hash store.
///
/// `cluster_size` determines the on-disk block size: a block holds
/// `(cluster_size - 4) / (1 + record_size)` record slots. The density window
/// `(min_density, max_density)` drives bucket merging and splitting.
#[derive(Debug, Clone)]
pub struct Options {
	/// Requested block footprint in bytes. Must fit at least one record.
	pub cluster_size: u32,
	/// Number of bucket groups a fresh index starts with. Merging never
	/// drops below this count.
	pub initial_groups: u32,
	/// Split when live records per slot exceed this after an insert.
	pub max_density: f64,
	/// Merge when live records per slot fall below this after a delete.
	pub min_density: f64,
}

impl Default for Options {
	fn default() -> Options {
		Options {
			cluster_size: 256,
			initial_groups: 4,
			max_density: 0.75,
			min_density: 0.40,
		}
	}
}

impl Options {
	pub(crate) fn validate(&self, record_size: usize) -> Result<()> {
		if (self.cluster_size as usize) < 4 + 1 + record_size {
			return Err(Error::InvalidConfiguration(format!(
				"Cluster size {} too small for {} byte records",
				self.cluster_size, record_size,
			)));
		}
		if self.initial_groups == 0 {
			return Err(Error::InvalidConfiguration("At least one initial group is required".into()));
		}
		if !(self.min_density < self.max_density) || self.min_density < 0.0 || self.max_density > 1.0 {
			return Err(Error::InvalidConfiguration(format!(
				"Invalid density window {}..{}",
				self.min_density, self.max_density,
			)));
		}
		Ok(())
	}
}
