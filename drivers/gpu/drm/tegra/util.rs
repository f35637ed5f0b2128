// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Miscellaneous utility functions, and the page-granular memory accessors shared by buffer
//! objects and the firewall's command copy.

use core::ops::{Add, BitAnd, Not, Sub};
use core::sync::atomic::{AtomicU64, Ordering};
use kernel::{prelude::*, sync::Mutex, PAGE_SIZE};

/// Aligns an integer type to a power of two.
pub(crate) fn align<T>(a: T, b: T) -> T
where
    T: Copy
        + Default
        + From<u8>
        + BitAnd<Output = T>
        + Not<Output = T>
        + Add<Output = T>
        + Sub<Output = T>
        + core::cmp::PartialEq,
{
    let one: T = T::from(1);
    assert!((b & (b - one)) == T::default());

    (a + b - one) & !(b - one)
}

/// Returns whether `a` is a multiple of the power of two `b`.
pub(crate) fn is_aligned(a: u64, b: u64) -> bool {
    a & (b - 1) == 0
}

const PHYS_BASE: u64 = 0x8000_0000;
static PHYS_NEXT: AtomicU64 = AtomicU64::new(PHYS_BASE);

/// Hands out `size` bytes of bus address space for a new allocation.
///
/// Every allocation starts on a fresh page and is followed by a one page hole, so that
/// independently allocated pages never look physically contiguous.
pub(crate) fn alloc_phys(size: usize) -> u64 {
    let size = align(size as u64, PAGE_SIZE as u64) + PAGE_SIZE as u64;
    PHYS_NEXT.fetch_add(size, Ordering::Relaxed)
}

/// Byte-addressable memory made of individually locked pages.
///
/// Command words are little-endian 32-bit values at 4-byte aligned offsets, so a word never
/// straddles two pages.
pub trait PageMemory {
    /// Size in bytes.
    fn size(&self) -> usize;

    /// Runs `f` on the page with index `page`.
    fn with_page(&self, page: usize, f: &mut dyn FnMut(&mut [u8])) -> Result;

    /// Reads the word at byte `offset`.
    fn read_word(&self, offset: usize) -> Result<u32> {
        check_word(self.size(), offset, 1)?;
        let mut val = 0;
        let pos = offset % PAGE_SIZE;
        self.with_page(offset / PAGE_SIZE, &mut |p| {
            val = u32::from_le_bytes([p[pos], p[pos + 1], p[pos + 2], p[pos + 3]]);
        })?;
        Ok(val)
    }

    /// Writes the word at byte `offset`.
    fn write_word(&self, offset: usize, val: u32) -> Result {
        check_word(self.size(), offset, 1)?;
        let pos = offset % PAGE_SIZE;
        self.with_page(offset / PAGE_SIZE, &mut |p| {
            p[pos..pos + 4].copy_from_slice(&val.to_le_bytes());
        })
    }

    /// Reads `count` consecutive words starting at byte `offset`.
    fn read_words(&self, offset: usize, count: usize) -> Result<Vec<u32>> {
        check_word(self.size(), offset, count)?;
        let mut words = Vec::new();
        words.try_reserve_exact(count)?;

        let mut pos = offset;
        let end = offset + count * 4;
        while pos < end {
            let page = pos / PAGE_SIZE;
            let stop = end.min((page + 1) * PAGE_SIZE);
            let (first, last) = (pos % PAGE_SIZE, (stop - 1) % PAGE_SIZE + 1);
            self.with_page(page, &mut |p| {
                words.extend(
                    p[first..last]
                        .chunks_exact(4)
                        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])),
                );
            })?;
            pos = stop;
        }
        Ok(words)
    }

    /// Writes `words` starting at byte `offset`.
    fn write_words(&self, offset: usize, words: &[u32]) -> Result {
        check_word(self.size(), offset, words.len())?;
        for (i, w) in words.iter().enumerate() {
            self.write_word(offset + i * 4, *w)?;
        }
        Ok(())
    }
}

fn check_word(size: usize, offset: usize, count: usize) -> Result {
    if offset % 4 != 0 {
        return Err(EINVAL);
    }
    match count.checked_mul(4).and_then(|len| len.checked_add(offset)) {
        Some(end) if end <= size => Ok(()),
        _ => Err(EFAULT),
    }
}

/// Zero-initialized page array.
pub struct Pages {
    pages: Vec<Mutex<Vec<u8>>>,
    size: usize,
}

impl Pages {
    /// Allocates enough pages to hold `size` bytes.
    pub fn new(size: usize) -> Result<Pages> {
        let count = size.div_ceil(PAGE_SIZE);
        let mut pages = Vec::new();
        pages.try_reserve_exact(count)?;
        for _ in 0..count {
            let mut page = Vec::new();
            page.try_reserve_exact(PAGE_SIZE)?;
            page.resize(PAGE_SIZE, 0);
            pages.push(Mutex::new(page));
        }
        Ok(Pages { pages, size })
    }

    /// Number of pages.
    pub fn count(&self) -> usize {
        self.pages.len()
    }
}

impl PageMemory for Pages {
    fn size(&self) -> usize {
        self.size
    }

    fn with_page(&self, page: usize, f: &mut dyn FnMut(&mut [u8])) -> Result {
        let mut data = self.pages.get(page).ok_or(EFAULT)?.lock();
        f(data.as_mut_slice());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_pow2() {
        assert_eq!(align(0x1001u64, 0x1000), 0x2000);
        assert_eq!(align(0x1000usize, 0x1000), 0x1000);
        assert!(is_aligned(0x40, 4));
        assert!(!is_aligned(0x42, 4));
    }

    #[test]
    fn words_across_pages() {
        let mem = Pages::new(2 * PAGE_SIZE).unwrap();
        let words: Vec<u32> = (0..8).map(|i| 0x1000 + i).collect();
        let at = PAGE_SIZE - 16;
        mem.write_words(at, &words).unwrap();
        assert_eq!(mem.read_words(at, 8).unwrap(), words);
        assert_eq!(mem.read_word(PAGE_SIZE).unwrap(), 0x1004);
    }

    #[test]
    fn bounds() {
        let mem = Pages::new(100).unwrap();
        assert_eq!(mem.count(), 1);
        assert_eq!(mem.read_word(2), Err(EINVAL));
        assert_eq!(mem.read_word(96), Ok(0));
        assert_eq!(mem.read_word(100), Err(EFAULT));
        assert_eq!(mem.read_words(92, 3), Err(EFAULT));
    }

    #[test]
    fn phys_ranges_are_disjoint() {
        let a = alloc_phys(PAGE_SIZE);
        let b = alloc_phys(1);
        assert!(b >= a + 2 * PAGE_SIZE as u64);
        assert!(is_aligned(b, PAGE_SIZE as u64));
    }
}
