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

//! Host mapping facility: the thin layer over the host OS's `mmap`/`munmap` that
//! [`crate::backing::Backing`] is built on.
//!
//! This is the "host interface" spec §6 describes as consumed, not implemented, by the
//! core: an anonymous region allocator and a file-region mapper, each returning a host
//! base pointer and size with a symmetric release. Kept as raw `libc` calls, the same
//! style the teacher's own `inttest` harness uses for host syscalls
//! (`io::Result<T>` via `io::Error::last_os_error()`).

use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;

/// A host memory region backing one or more guest pages.
///
/// Always mapped read-write on the host side: guest protection (`PageFlags`) is
/// enforced in software by the page table and TLB, not by host mmap permissions — the
/// host region is simply where the bytes live.
#[derive(Debug)]
pub struct HostRegion {
	base: NonNull<u8>,
	len: usize,
}

// SAFETY: the region is privately owned by exactly one `HostRegion`/`Backing`; shared
// access across threads is mediated by the locks in `crate::space::AddressSpace`, not by
// this type itself.
unsafe impl Send for HostRegion {}
unsafe impl Sync for HostRegion {}

impl HostRegion {
	/// Maps a fresh, zero-filled anonymous region of `len` bytes.
	///
	/// `len` must be a nonzero multiple of [`crate::PAGE_SIZE`].
	pub fn anonymous(len: usize) -> io::Result<Self> {
		debug_assert!(len > 0 && len % crate::PAGE_SIZE as usize == 0);
		let ptr = unsafe {
			libc::mmap(
				std::ptr::null_mut(),
				len,
				libc::PROT_READ | libc::PROT_WRITE,
				libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
				-1,
				0,
			)
		};
		if ptr == libc::MAP_FAILED {
			return Err(io::Error::last_os_error());
		}
		Ok(Self {
			// SAFETY: mmap succeeded, so `ptr` is non-null.
			base: unsafe { NonNull::new_unchecked(ptr as *mut u8) },
			len,
		})
	}

	/// Maps `len` bytes starting at `offset` in `file` into a private region.
	///
	/// `offset` must be page-aligned. If the file is shorter than `offset + len`, the
	/// remainder is zero-filled: a full anonymous reservation is made first, then the
	/// readable prefix is overlaid with a `MAP_FIXED` private file mapping, leaving any
	/// trailing pages as the fresh anonymous zeroes (matching the "remainder is
	/// zero-filled" clause of spec §4.2, without relying on accessing past EOF on a
	/// direct file mapping, which the host OS would instead fault on for whole pages
	/// beyond the last partial one).
	pub fn from_file(file: &File, offset: u64, len: usize) -> io::Result<Self> {
		debug_assert!(len > 0 && len % crate::PAGE_SIZE as usize == 0);
		debug_assert_eq!(offset % crate::PAGE_SIZE as u64, 0);
		let region = Self::anonymous(len)?;
		let file_len = file.metadata()?.len();
		let readable = file_len.saturating_sub(offset).min(len as u64) as usize;
		if readable == 0 {
			return Ok(region);
		}
		// Round up to a whole number of pages: mmap can only place whole pages, and the
		// host kernel zero-fills the tail of the final partial page for us.
		let mapped_len = readable.div_ceil(crate::PAGE_SIZE as usize) * crate::PAGE_SIZE as usize;
		let ptr = unsafe {
			libc::mmap(
				region.base.as_ptr() as *mut c_void,
				mapped_len,
				libc::PROT_READ | libc::PROT_WRITE,
				libc::MAP_PRIVATE | libc::MAP_FIXED,
				file.as_raw_fd(),
				offset as libc::off_t,
			)
		};
		if ptr == libc::MAP_FAILED {
			return Err(io::Error::last_os_error());
		}
		Ok(region)
	}

	/// Returns a pointer to the first byte of the region.
	#[inline]
	pub fn as_ptr(&self) -> *mut u8 {
		self.base.as_ptr()
	}

	/// Returns the size of the region in bytes.
	#[inline]
	pub fn len(&self) -> usize {
		self.len
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Returns the region's contents as a byte slice.
	///
	/// # Safety
	///
	/// The caller must not race this read against a concurrent write to the same bytes
	/// through another mapping of the same region.
	#[inline]
	pub unsafe fn as_slice(&self) -> &[u8] {
		std::slice::from_raw_parts(self.base.as_ptr(), self.len)
	}

	/// Returns the region's contents as a mutable byte slice.
	///
	/// # Safety
	///
	/// The caller must ensure exclusive access to the bytes for the duration of the
	/// borrow.
	#[inline]
	pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
		std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len)
	}
}

impl Drop for HostRegion {
	fn drop(&mut self) {
		unsafe {
			libc::munmap(self.base.as_ptr() as *mut c_void, self.len);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::io::Write;

	#[test]
	fn anonymous_is_zeroed() {
		let region = HostRegion::anonymous(crate::PAGE_SIZE as usize).unwrap();
		let bytes = unsafe { region.as_slice() };
		assert!(bytes.iter().all(|&b| b == 0));
	}

	#[test]
	fn file_shorter_than_region_is_zero_padded() {
		let mut file = tempfile::tempfile().unwrap();
		file.write_all(&[0xAAu8; 10]).unwrap();
		file.flush().unwrap();
		let region = HostRegion::from_file(&file, 0, crate::PAGE_SIZE as usize).unwrap();
		let bytes = unsafe { region.as_slice() };
		assert_eq!(&bytes[..10], &[0xAAu8; 10]);
		assert!(bytes[10..].iter().all(|&b| b == 0));
	}

	#[test]
	fn file_offset_past_eof_is_all_zero() {
		let mut file = tempfile::tempfile().unwrap();
		file.write_all(&[0xAAu8; 10]).unwrap();
		file.flush().unwrap();
		let region =
			HostRegion::from_file(&file, crate::PAGE_SIZE as u64, crate::PAGE_SIZE as usize)
				.unwrap();
		let bytes = unsafe { region.as_slice() };
		assert!(bytes.iter().all(|&b| b == 0));
	}
}
