//! # Store Header
//!
//! Page 0 of `pages.bin` records the pool's allocation state: the
//! high-water mark below which every page slot has been handed out, and
//! the offsets of discarded pages awaiting reuse.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size   Field
//! ------  ----   -----------------------------------------
//! 0       8      empty_pages_start (LE u64, multiple of P)
//! 8       8      discarded_count (LE u64)
//! 16      8*N    discarded page offsets (LE u64 each)
//! ...     to P   zero padding
//! ```
//!
//! There are no magic bytes: byte 0 of the file is the high-water mark
//! itself. The header is written once at close (the pool's final write)
//! and read once at open. All discarded offsets must fit inside page 0;
//! spilling to a second header page is unsupported.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Fixed prefix of the header: high-water mark plus discarded count.
pub const STORE_HEADER_FIXED_SIZE: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct HeaderFixed {
    empty_pages_start: U64,
    discarded_count: U64,
}

const _: () = assert!(std::mem::size_of::<HeaderFixed>() == STORE_HEADER_FIXED_SIZE);

/// Decoded page-0 state of a pages file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHeader {
    pub empty_pages_start: u64,
    pub discarded_offsets: Vec<u64>,
}

impl StoreHeader {
    /// Header of a freshly created file: page 0 reserved, nothing
    /// discarded.
    pub fn new(page_size: usize) -> Self {
        Self {
            empty_pages_start: page_size as u64,
            discarded_offsets: Vec::new(),
        }
    }

    /// Most discarded offsets a `page_size` header block can carry.
    pub fn max_discarded(page_size: usize) -> usize {
        (page_size - STORE_HEADER_FIXED_SIZE) / 8
    }

    /// Decodes and validates a page-0 block of `page_size` bytes.
    pub fn from_bytes(bytes: &[u8], page_size: usize) -> Result<Self> {
        ensure!(
            bytes.len() == page_size,
            "store header corrupt: block is {} bytes, expected {}",
            bytes.len(),
            page_size
        );

        let fixed = HeaderFixed::ref_from_bytes(&bytes[..STORE_HEADER_FIXED_SIZE])
            .map_err(|e| eyre::eyre!("failed to read store header: {:?}", e))?;
        let empty_pages_start = fixed.empty_pages_start.get();
        let count = fixed.discarded_count.get() as usize;

        ensure!(
            empty_pages_start >= page_size as u64
                && empty_pages_start % page_size as u64 == 0,
            "store header corrupt: empty_pages_start {:#x} is not a page boundary",
            empty_pages_start
        );
        ensure!(
            count <= Self::max_discarded(page_size),
            "store header corrupt: {} discarded offsets exceed page capacity {}",
            count,
            Self::max_discarded(page_size)
        );

        let mut discarded_offsets = Vec::with_capacity(count);
        for i in 0..count {
            let at = STORE_HEADER_FIXED_SIZE + i * 8;
            let offset = u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
            ensure!(
                offset != 0
                    && offset < empty_pages_start
                    && offset % page_size as u64 == 0,
                "store header corrupt: discarded offset {:#x} outside [{:#x}, {:#x})",
                offset,
                page_size,
                empty_pages_start
            );
            discarded_offsets.push(offset);
        }

        Ok(Self {
            empty_pages_start,
            discarded_offsets,
        })
    }

    /// Encodes the header as a zero-padded `page_size` block.
    pub fn to_bytes(&self, page_size: usize) -> Result<Vec<u8>> {
        ensure!(
            self.discarded_offsets.len() <= Self::max_discarded(page_size),
            "discarded page list no longer fits the header page: {} > {}",
            self.discarded_offsets.len(),
            Self::max_discarded(page_size)
        );

        let mut block = vec![0u8; page_size];
        let fixed = HeaderFixed {
            empty_pages_start: U64::new(self.empty_pages_start),
            discarded_count: U64::new(self.discarded_offsets.len() as u64),
        };
        block[..STORE_HEADER_FIXED_SIZE].copy_from_slice(fixed.as_bytes());
        for (i, offset) in self.discarded_offsets.iter().enumerate() {
            let at = STORE_HEADER_FIXED_SIZE + i * 8;
            block[at..at + 8].copy_from_slice(&offset.to_le_bytes());
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 256;

    #[test]
    fn new_header_reserves_page_zero() {
        let header = StoreHeader::new(PAGE);
        assert_eq!(header.empty_pages_start, PAGE as u64);
        assert!(header.discarded_offsets.is_empty());
    }

    #[test]
    fn round_trip_preserves_state() {
        let header = StoreHeader {
            empty_pages_start: 10 * PAGE as u64,
            discarded_offsets: vec![3 * PAGE as u64, 7 * PAGE as u64],
        };
        let block = header.to_bytes(PAGE).unwrap();
        assert_eq!(block.len(), PAGE);
        let decoded = StoreHeader::from_bytes(&block, PAGE).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn rejects_misaligned_high_water_mark() {
        let mut block = vec![0u8; PAGE];
        block[..8].copy_from_slice(&(PAGE as u64 + 1).to_le_bytes());
        assert!(StoreHeader::from_bytes(&block, PAGE).is_err());
    }

    #[test]
    fn rejects_discarded_offset_beyond_high_water_mark() {
        let header = StoreHeader {
            empty_pages_start: 2 * PAGE as u64,
            discarded_offsets: vec![5 * PAGE as u64],
        };
        let block = header.to_bytes(PAGE).unwrap();
        assert!(StoreHeader::from_bytes(&block, PAGE).is_err());
    }

    #[test]
    fn rejects_short_block() {
        assert!(StoreHeader::from_bytes(&[0u8; 16], PAGE).is_err());
    }

    #[test]
    fn max_discarded_matches_layout() {
        assert_eq!(StoreHeader::max_discarded(PAGE), (PAGE - 16) / 8);
        let header = StoreHeader {
            empty_pages_start: PAGE as u64,
            discarded_offsets: vec![0; StoreHeader::max_discarded(PAGE) + 1],
        };
        assert!(header.to_bytes(PAGE).is_err());
    }
}
