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

//! Flags attached to a mapped guest page.

use bitflags::bitflags;

bitflags! {
	/// The set of flags a [`crate::page_table::PageTableEntry`] may carry.
	///
	/// Bit values are part of the stable external contract and must not change.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct PageFlags: u8 {
		/// The page may be read. Currently unenforced on its own (mirrors the source
		/// emulator this crate's contract is derived from, which ignores `READ`/`EXEC`
		/// for now), but kept for forward compatibility and introspection.
		const READ = 0b00001;
		/// The page may be written, unless [`Self::COW`] is also set.
		const WRITE = 0b00010;
		/// The page may contain executable instructions.
		const EXEC = 0b00100;
		/// The mapping grows downward (e.g. a stack). Informational; this crate does not
		/// implement auto-growth.
		const GROWSDOWN = 0b01000;
		/// The page is shared copy-on-write: the first write must privately copy it
		/// before completing. See [`crate::page_table::PageTable::copy_on_write`].
		const COW = 0b10000;
	}
}

impl PageFlags {
	/// Tells whether a page with these flags can be written to directly, without
	/// triggering a copy-on-write break first.
	#[inline]
	pub const fn is_writable(self) -> bool {
		self.contains(Self::WRITE) && !self.contains(Self::COW)
	}
}
