//! Fixed-size page format.
//!
//! A page is 8192 bytes on disk: a 32-byte header followed by an
//! 8160-byte body. The header checksum is CRC32 (IEEE) over the header
//! minus the checksum field, concatenated with the body.
//!
//! ```text
//! offset size field
//!  0      4  page_id
//!  4      1  page_type
//!  5      8  lsn
//! 13      2  num_slots
//! 15      2  free_space
//! 17      2  free_space_ptr
//! 19      4  next_page
//! 23      5  reserved
//! 28      4  checksum
//! 32   8160  data
//! ```

use std::io::Cursor;

use crate::codec::{ByteWriter, Decode};
use crate::error::{Error, Result};

pub const PAGE_SIZE: usize = 8192;
pub const PAGE_HEADER_SIZE: usize = 32;
pub const PAGE_BODY_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Offset of the checksum field inside the header.
const CHECKSUM_OFFSET: usize = 28;

pub type PageId = u32;

/// Never refers to a real page; doubles as the nil link in page chains.
pub const INVALID_PAGE_ID: PageId = 0;

/// Database-level metadata (allocation state, shutdown marker).
pub const META_PAGE_ID: PageId = 0;

/// Tree-level metadata (root pointer, height). Logged like any other
/// page so recovery restores the root.
pub const TREE_META_PAGE_ID: PageId = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Leaf = 0,
    Internal = 1,
    Meta = 2,
    Free = 3,
    Overflow = 4,
}

impl PageType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PageType::Leaf),
            1 => Ok(PageType::Internal),
            2 => Ok(PageType::Meta),
            3 => Ok(PageType::Free),
            4 => Ok(PageType::Overflow),
            other => Err(Error::Corrupted {
                context: format!("invalid page type tag {}", other),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Page {
    pub id: PageId,
    pub page_type: PageType,
    pub lsn: u64,
    pub num_slots: u16,
    pub free_space: u16,
    pub free_space_ptr: u16,
    pub next_page: PageId,
    data: Vec<u8>,
}

impl Page {
    pub fn new(id: PageId, page_type: PageType) -> Self {
        Self {
            id,
            page_type,
            lsn: 0,
            num_slots: 0,
            free_space: PAGE_BODY_SIZE as u16,
            free_space_ptr: PAGE_HEADER_SIZE as u16,
            next_page: INVALID_PAGE_ID,
            data: vec![0u8; PAGE_BODY_SIZE],
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.data
    }

    /// Replaces the body with `content` padded to the body size, and
    /// refreshes the space-accounting header fields.
    pub fn set_body(&mut self, content: &[u8], num_slots: u16) {
        assert!(content.len() <= PAGE_BODY_SIZE, "body overflow");
        self.data[..content.len()].copy_from_slice(content);
        self.data[content.len()..].fill(0);
        self.num_slots = num_slots;
        self.free_space = (PAGE_BODY_SIZE - content.len()) as u16;
        self.free_space_ptr = (PAGE_HEADER_SIZE + content.len()) as u16;
    }

    /// Serializes into a full on-disk image, recomputing the checksum.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(PAGE_SIZE);
        w.put(&self.id);
        w.put(&(self.page_type as u8));
        w.put(&self.lsn);
        w.put(&self.num_slots);
        w.put(&self.free_space);
        w.put(&self.free_space_ptr);
        w.put(&self.next_page);
        w.put_bytes(&[0u8; 5]);
        w.put(&0u32); // checksum placeholder
        w.put_bytes(&self.data);

        let mut image = w.into_bytes();
        debug_assert_eq!(image.len(), PAGE_SIZE);
        let checksum = page_checksum(&image);
        image[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
        image
    }

    pub fn deserialize(image: &[u8], verify_checksum: bool) -> Result<Self> {
        if image.len() != PAGE_SIZE {
            return Err(Error::Corrupted {
                context: format!("page image is {} bytes, expected {}", image.len(), PAGE_SIZE),
            });
        }

        let mut r = Cursor::new(image);
        let id = PageId::decode_from(&mut r)?;
        let type_tag = u8::decode_from(&mut r)?;
        let lsn = u64::decode_from(&mut r)?;
        let num_slots = u16::decode_from(&mut r)?;
        let free_space = u16::decode_from(&mut r)?;
        let free_space_ptr = u16::decode_from(&mut r)?;
        let next_page = PageId::decode_from(&mut r)?;

        let stored = u32::from_le_bytes(
            image[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]
                .try_into()
                .unwrap(),
        );
        if verify_checksum {
            let computed = page_checksum(image);
            if computed != stored {
                return Err(Error::ChecksumMismatch {
                    page_id: id,
                    stored,
                    computed,
                });
            }
        }

        let page_type = PageType::from_u8(type_tag)?;
        if free_space as usize > PAGE_BODY_SIZE {
            return Err(Error::Corrupted {
                context: format!("page {}: free_space {} exceeds body size", id, free_space),
            });
        }
        if (free_space_ptr as usize) < PAGE_HEADER_SIZE || free_space_ptr as usize > PAGE_SIZE {
            return Err(Error::Corrupted {
                context: format!("page {}: free_space_ptr {} out of range", id, free_space_ptr),
            });
        }

        Ok(Self {
            id,
            page_type,
            lsn,
            num_slots,
            free_space,
            free_space_ptr,
            next_page,
            data: image[PAGE_HEADER_SIZE..].to_vec(),
        })
    }
}

/// CRC32 over the header minus its checksum field, then the body.
fn page_checksum(image: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&image[..CHECKSUM_OFFSET]);
    hasher.update(&image[PAGE_HEADER_SIZE..]);
    hasher.finalize()
}
