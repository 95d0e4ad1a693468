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

//! A page backing: a host memory region shared by one or more page-table entries.
//!
//! The refcount spec §3 describes ("a backing is destroyed exactly when refcount
//! reaches zero") is `Arc::strong_count`: every [`crate::page_table::PageTableEntry`]
//! that references a backing holds a clone of its `Arc<Backing>`. Cloning the `Arc` is
//! incrementing the refcount; dropping the last clone releases the host region through
//! [`Backing`]'s `Drop` impl. This mirrors the teacher's own `Arc<ResidencePage>`
//! (`process/mem_space/residence.rs`), generalized from one physical page to an
//! arbitrarily-sized host region.

use crate::host::HostRegion;
use std::fs::File;
use std::io;
use std::sync::Arc;

/// A host memory region that one or more guest pages are mapped onto.
pub struct Backing {
	region: HostRegion,
}

impl Backing {
	/// Takes ownership of an already-mapped host memory region.
	///
	/// `region` must be one obtained from the host's mapping facility so that it can
	/// later be released by the symmetric unmap, which [`Backing`]'s `Drop` impl
	/// performs automatically.
	pub fn from_host_memory(region: HostRegion) -> Arc<Self> {
		Arc::new(Self { region })
	}

	/// Maps `len` bytes of `file` starting at `offset` into a private host region.
	///
	/// `offset` must be page-aligned. If the file is shorter than `len`, the remainder
	/// is zero-filled (see [`HostRegion::from_file`]).
	pub fn from_file(file: &File, offset: u64, len: usize) -> io::Result<Arc<Self>> {
		let region = HostRegion::from_file(file, offset, len)?;
		Ok(Arc::new(Self { region }))
	}

	/// Allocates a fresh, zero-filled anonymous backing of `len` bytes.
	pub fn anonymous(len: usize) -> io::Result<Arc<Self>> {
		let region = HostRegion::anonymous(len)?;
		Ok(Arc::new(Self { region }))
	}

	/// Returns the base host pointer of the backing's region.
	#[inline]
	pub fn base_ptr(&self) -> *mut u8 {
		self.region.as_ptr()
	}

	/// Returns the size in bytes of the backing's region.
	#[inline]
	pub fn len(&self) -> usize {
		self.region.len()
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.region.is_empty()
	}
}

/// Returns the number of page-table entries currently referencing `backing`, i.e. its
/// refcount per spec §3's invariant 1.
#[inline]
pub fn ref_count(backing: &Arc<Backing>) -> usize {
	Arc::strong_count(backing)
}
