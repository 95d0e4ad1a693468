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

//! The read/write hot path: the only two operations the emulated CPU calls on every
//! guest memory access.
//!
//! Both take the TLB-first, page-table-on-miss route spec §4.3 lays out, and both
//! split a buffer spanning a page boundary into a head access on the first page and a
//! tail access on the second, continuing across as many pages as the buffer spans.

use crate::space::AddressSpace;
use crate::{page_offset, PAGE_SIZE};

/// Reads `out.len()` bytes from `space` starting at `addr` into `out`.
///
/// Returns `false` without writing `out` at all if any byte in the range is
/// unmapped — this is the one access direction where a partial failure has no
/// observable side effect, since nothing is written until every page involved has been
/// resolved.
pub fn read(space: &AddressSpace, addr: u32, out: &mut [u8]) -> bool {
	if out.is_empty() {
		return true;
	}
	let mut done = 0usize;
	let mut cur = addr;
	while done < out.len() {
		let remaining_in_page = (PAGE_SIZE - page_offset(cur)) as usize;
		let chunk_len = remaining_in_page.min(out.len() - done);
		let Some(host_ptr) = space.resolve_read(cur) else {
			return false;
		};
		// SAFETY: `host_ptr` points at `chunk_len` valid, readable host bytes — the
		// page table entry resolving `cur` covers at least to the next page boundary,
		// and `chunk_len` never crosses it.
		let src = unsafe { std::slice::from_raw_parts(host_ptr, chunk_len) };
		out[done..done + chunk_len].copy_from_slice(src);
		done += chunk_len;
		cur = cur.wrapping_add(chunk_len as u32);
	}
	true
}

/// Writes `data` to `space` starting at `addr`.
///
/// If a page past the first faults (unmapped, or a copy-on-write break that itself
/// fails), returns `false`, but bytes already written to earlier pages — including the
/// first page of this very call — remain written. Spec §4.6/§9 calls this out
/// explicitly: a multi-page write is not transactional.
pub fn write(space: &AddressSpace, addr: u32, data: &[u8]) -> bool {
	if data.is_empty() {
		return true;
	}
	let mut done = 0usize;
	let mut cur = addr;
	while done < data.len() {
		let remaining_in_page = (PAGE_SIZE - page_offset(cur)) as usize;
		let chunk_len = remaining_in_page.min(data.len() - done);
		let Some(host_ptr) = space.resolve_write(cur) else {
			return false;
		};
		// SAFETY: see `read`; the resolved page is additionally confirmed writable
		// (after any needed copy-on-write break) by `resolve_write`.
		let dst = unsafe { std::slice::from_raw_parts_mut(host_ptr, chunk_len) };
		dst.copy_from_slice(&data[done..done + chunk_len]);
		done += chunk_len;
		cur = cur.wrapping_add(chunk_len as u32);
	}
	true
}
