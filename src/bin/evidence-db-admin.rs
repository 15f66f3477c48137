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

use structopt::StructOpt;
use evidence_db::{LinearHash, Options, PatientRecord};

#[derive(Debug, StructOpt)]
struct Target {
	/// Index base path: the part of the file names before `_lh_primary.dat`.
	#[structopt(parse(from_os_str))]
	base: std::path::PathBuf,
	/// Cluster size the index was created with.
	#[structopt(long, default_value = "256")]
	cluster_size: u32,
}

#[derive(Debug, StructOpt)]
#[structopt(name = "evidence-db-admin", about = "Inspect an evidence-db linear-hash store")]
enum Cli {
	/// Print the structure summary line.
	Stats {
		#[structopt(flatten)]
		target: Target,
	},
	/// Print the full structural dump, group by group.
	Dump {
		#[structopt(flatten)]
		target: Target,
	},
}

fn run(cli: Cli) -> evidence_db::Result<()> {
	let (target, full) = match &cli {
		Cli::Stats { target } => (target, false),
		Cli::Dump { target } => (target, true),
	};
	let options = Options { cluster_size: target.cluster_size, ..Options::default() };
	let index = LinearHash::<PatientRecord>::open(&target.base, &options)?;
	let dump = index.dump_structure()?;
	if full {
		print!("{}", dump);
	} else {
		println!(
			"M={} level={} split={} groups={} records={} primary_blocks={} overflow_blocks={}",
			dump.initial_groups,
			dump.level,
			dump.split_pointer,
			dump.group_count,
			dump.total_records,
			dump.primary_blocks,
			dump.overflow_blocks,
		);
	}
	index.close()
}

fn main() {
	env_logger::init();
	if let Err(e) = run(Cli::from_args()) {
		eprintln!("{}", e);
		std::process::exit(1);
	}
}
