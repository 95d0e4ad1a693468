/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Error kinds returned by mapping operations.
//!
//! Access primitives ([`crate::access::read`]/[`crate::access::write`]) do not return
//! this type: a faulting access carries no information beyond "it faulted", so they
//! return a plain `bool`, matching the contract in spec §6/§7.

use std::io;

/// What an access primitive intends to do with a page, used to pick the right TLB slot
/// and to decide whether a copy-on-write break is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessIntent {
	Read,
	Write,
}

/// An error from a mapping operation (`map_*`, `unmap`, `set_flags`, `copy_on_write`,
/// `find_hole`).
#[derive(Debug, thiserror::Error)]
pub enum MapError {
	/// An operation that requires every page in its range to already be mapped (or, for
	/// strict `unmap`, unmapped) found a violator. The operation made no changes.
	#[error("range is not fully mapped (or unmapped) as required")]
	InvalidRange,
	/// `find_hole` could not find a run of free pages of the requested size.
	#[error("no hole of the requested size is available")]
	OutOfSpace,
	/// The host mapping facility refused the allocation.
	#[error("host memory allocation failed: {0}")]
	HostExhausted(#[source] io::Error),
}

impl From<io::Error> for MapError {
	fn from(err: io::Error) -> Self {
		MapError::HostExhausted(err)
	}
}

impl MapError {
	/// The negative integer status code spec §7 assigns to this error, for a
	/// collaborator (e.g. the system-call layer) that expects the C-style
	/// `0`-success/negative-error contract literally rather than a `Result`.
	pub const fn to_status(&self) -> i32 {
		match self {
			MapError::InvalidRange => -1,
			MapError::OutOfSpace => -2,
			MapError::HostExhausted(_) => -3,
		}
	}
}

/// The integer status code for a successful mapping operation, per spec §7.
pub const STATUS_OK: i32 = 0;
