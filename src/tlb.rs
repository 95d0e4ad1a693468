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

//! The software TLB: a small direct-mapped cache in front of the page table, so that
//! the hot read/write path doesn't walk the sparse radix on every access.
//!
//! Modeled after the teacher's hardware-facing `memory::vmem` cache-flush discipline
//! (`memory/vmem/mod.rs`): any mutation that can change a translation must invalidate
//! the corresponding slot before it is next consulted. Here that discipline is
//! reimplemented entirely in software, since this crate has no hardware MMU to delegate
//! to — the TLB is an explicit cache `crate::space::AddressSpace` must keep coherent
//! with the page table, not a transparent hardware structure.

use crate::page_table::PageTableEntry;
use crate::{page_base, PAGE_SIZE};

/// Number of entries in the software TLB. Direct-mapped on the low 10 bits of the
/// guest page index.
pub const TLB_SIZE: usize = 1024;

/// Sentinel tag meaning "this slot is empty". Page bases are always 4096-aligned, so a
/// real tag can never equal 1.
const EMPTY_TAG: u32 = 1;
/// OR'd into a valid page base to produce a `writable_tag` value that can never equal a
/// real base, for a slot that is cached for reads but not currently writable. Distinct
/// from [`EMPTY_TAG`]: this is only ever compared against `writable_tag`, which is
/// checked after `tag` has already confirmed the slot isn't empty.
const NOT_WRITABLE_SENTINEL_BIT: u32 = 1;

#[derive(Clone, Copy)]
struct Slot {
	/// The guest page base this slot is valid for on reads. [`EMPTY_TAG`] means the
	/// slot is empty; compared against the full base, never masked, so that page 0
	/// (base `0`) can never be mistaken for an empty slot (spec §3's two-tag scheme:
	/// `tag` and `writable_tag` are kept as separate fields for exactly this reason).
	tag: u32,
	/// Equals `tag` when the page is writable; otherwise a value that can never equal
	/// any real base, so a write lookup on a read-only page deliberately misses.
	writable_tag: u32,
	host_base: *mut u8,
}

impl Default for Slot {
	fn default() -> Self {
		Self {
			tag: EMPTY_TAG,
			writable_tag: EMPTY_TAG,
			host_base: std::ptr::null_mut(),
		}
	}
}

/// A direct-mapped software translation cache from guest page base to host pointer.
pub struct SoftwareTlb {
	slots: Box<[Slot; TLB_SIZE]>,
}

impl Default for SoftwareTlb {
	fn default() -> Self {
		Self::new()
	}
}

impl SoftwareTlb {
	pub fn new() -> Self {
		Self {
			slots: Box::new([Slot::default(); TLB_SIZE]),
		}
	}

	#[inline]
	fn index_of(page_base_addr: u32) -> usize {
		((page_base_addr / PAGE_SIZE) as usize) & (TLB_SIZE - 1)
	}

	/// Looks up the host pointer for `addr`'s page, if cached and, when `for_write` is
	/// set, currently writable.
	///
	/// A `None` return is a TLB miss: the caller must consult the page table, decide
	/// whether a copy-on-write break applies, and then call [`Self::fill`] to cache the
	/// result (or [`Self::insert_not_writable`] for a COW page accessed for read).
	pub fn lookup(&self, addr: u32, for_write: bool) -> Option<*mut u8> {
		let base = page_base(addr);
		let slot = &self.slots[Self::index_of(base)];
		if for_write {
			if slot.writable_tag != base {
				return None;
			}
		} else if slot.tag != base {
			return None;
		}
		Some(slot.host_base)
	}

	/// Caches a writable translation for the page containing `addr`.
	pub fn fill(&mut self, addr: u32, host_base: *mut u8) {
		let base = page_base(addr);
		debug_assert_ne!(base, EMPTY_TAG);
		let slot = &mut self.slots[Self::index_of(base)];
		slot.tag = base;
		slot.writable_tag = base;
		slot.host_base = host_base;
	}

	/// Caches a read-only translation for the page containing `addr`: satisfies future
	/// read lookups, but future write lookups still miss (routing into the
	/// copy-on-write break path).
	pub fn insert_not_writable(&mut self, addr: u32, host_base: *mut u8) {
		let base = page_base(addr);
		debug_assert_ne!(base, EMPTY_TAG);
		let slot = &mut self.slots[Self::index_of(base)];
		slot.tag = base;
		slot.writable_tag = base | NOT_WRITABLE_SENTINEL_BIT;
		slot.host_base = host_base;
	}

	/// Caches a translation matching `entry`'s current writability.
	pub fn insert(&mut self, addr: u32, entry: &PageTableEntry) {
		if entry.is_writable() {
			self.fill(addr, entry.host_base());
		} else {
			self.insert_not_writable(addr, entry.host_base());
		}
	}

	/// Evicts the slot for the page containing `addr`, if any. Idempotent.
	pub fn invalidate(&mut self, addr: u32) {
		let base = page_base(addr);
		let slot = &mut self.slots[Self::index_of(base)];
		if slot.tag == base {
			*slot = Slot::default();
		}
	}

	/// Evicts every slot. Used when an operation touches enough pages that
	/// invalidating them individually isn't worth it (e.g. a fork's copy-on-write
	/// pass), and when an [`crate::space::AddressSpace`] is reused by a fresh
	/// mapping layout.
	pub fn flush_all(&mut self) {
		self.slots.fill(Slot::default());
	}
}

// SAFETY: `host_base` pointers are derived from `Backing` regions that outlive the TLB
// entries caching them (a `PageTableEntry`'s `Arc<Backing>` clone is dropped only on
// unmap/COW-break, both of which invalidate the corresponding slot first). Concurrent
// access is mediated by the `Mutex<SoftwareTlb>` in `AddressSpace`.
unsafe impl Send for SoftwareTlb {}

#[cfg(test)]
mod test {
	use super::*;
	use crate::backing::Backing;
	use crate::flags::PageFlags;
	use crate::page_table::PageTableEntry;

	fn entry(writable: bool) -> PageTableEntry {
		let backing = Backing::anonymous(PAGE_SIZE as usize).unwrap();
		let flags = if writable {
			PageFlags::READ | PageFlags::WRITE
		} else {
			PageFlags::READ
		};
		PageTableEntry {
			backing,
			byte_offset: 0,
			flags,
		}
	}

	#[test]
	fn empty_tlb_misses_everywhere() {
		let tlb = SoftwareTlb::new();
		assert!(tlb.lookup(0x1000, false).is_none());
	}

	/// An empty slot's tag must never be mistaken for page 0's base (`0`): a masked
	/// emptiness check (e.g. `tag & !1 == base`) lets `EMPTY_TAG = 1` alias base `0`.
	#[test]
	fn empty_slot_does_not_alias_page_zero() {
		let tlb = SoftwareTlb::new();
		assert!(tlb.lookup(0x0, false).is_none());
		assert!(tlb.lookup(0x0, true).is_none());
		assert!(tlb.lookup(0xFFF, false).is_none());
	}

	#[test]
	fn fill_then_lookup_hits() {
		let mut tlb = SoftwareTlb::new();
		let e = entry(true);
		let addr = 0x2000;
		tlb.insert(addr, &e);
		assert_eq!(tlb.lookup(addr, false), Some(e.host_base()));
		assert_eq!(tlb.lookup(addr, true), Some(e.host_base()));
	}

	#[test]
	fn not_writable_entry_misses_on_write_lookup() {
		let mut tlb = SoftwareTlb::new();
		let e = entry(false);
		let addr = 0x3000;
		tlb.insert(addr, &e);
		assert!(tlb.lookup(addr, false).is_some());
		assert!(tlb.lookup(addr, true).is_none());
	}

	#[test]
	fn invalidate_evicts_only_that_page() {
		let mut tlb = SoftwareTlb::new();
		let e1 = entry(true);
		let e2 = entry(true);
		let other_addr = 0x1000 + PAGE_SIZE;
		tlb.insert(0x1000, &e1);
		tlb.insert(other_addr, &e2);
		tlb.invalidate(0x1000);
		assert!(tlb.lookup(0x1000, false).is_none());
		assert_eq!(tlb.lookup(other_addr, false), Some(e2.host_base()));
	}

	#[test]
	fn flush_all_evicts_every_slot() {
		let mut tlb = SoftwareTlb::new();
		let e = entry(true);
		tlb.insert(0x4000, &e);
		tlb.flush_all();
		assert!(tlb.lookup(0x4000, false).is_none());
	}
}
