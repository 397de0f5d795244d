//! Per-inode block table: header, file statistics and indexed entry pages.
//!
//! Layout of one inode's metadata device:
//!
//! ```text
//! [header 128][page][page]...
//! ```
//!
//! Entry pages hold [`ENTRIES_PER_PAGE`] block entries. Page 0 is reached
//! through the direct pointer; later pages through pointer pages of
//! [`POINTERS_PER_PAGE`] offsets, one to four levels deep. Pages are
//! appended on first write and never freed; offset 0 means "not allocated".

use crate::status::{BlockEntry, BlockStatus};
use hcfs_block::ByteDevice;
use hcfs_error::{HcfsError, Result};
use hcfs_types::{
    BlockNumber, InodeNumber, ParseError, read_le_u16, read_le_u32, read_le_u64, write_le_u16,
    write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

pub const ENTRIES_PER_PAGE: u64 = 100;
pub const POINTERS_PER_PAGE: u64 = 1024;
/// Direct page plus single, double, triple and quadruple indirection.
pub const MAX_INDIRECTION: usize = 4;

const META_MAGIC: u32 = 0x4D46_4348; // "HCFM"
const META_VERSION: u16 = 1;
const HEADER_SIZE: usize = 128;
const PAGE_HEADER_SIZE: usize = 8;
const ENTRY_PAGE_SIZE: usize = PAGE_HEADER_SIZE + ENTRIES_PER_PAGE as usize * BlockEntry::ENCODED_LEN;
const POINTER_PAGE_SIZE: usize = POINTERS_PER_PAGE as usize * 8;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_PINNED: usize = 6;
const OFF_INODE: usize = 8;
const OFF_NUM_BLOCKS: usize = 16;
const OFF_CACHED_BLOCKS: usize = 24;
const OFF_CACHED_SIZE: usize = 32;
const OFF_DIRTY_SIZE: usize = 40;
const OFF_ROOTS: usize = 48;
const OFF_FILE_SIZE: usize = 88;

/// Per-file block statistics kept in the header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub num_blocks: u64,
    pub num_cached_blocks: u64,
    pub cached_size: u64,
    pub dirty_data_size: u64,
    /// Logical file size in bytes.
    pub file_size: u64,
}

/// Route from the header to one entry page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRoute {
    /// 0 = direct, 1..=4 = indirection depth.
    pub depth: usize,
    /// Slot index inside each pointer page, outermost first. Only the first
    /// `depth` slots are meaningful.
    pub slots: [u64; MAX_INDIRECTION],
}

impl PageRoute {
    /// Map an entry-page index onto the direct/indirect tree.
    pub fn for_page(page_index: u64) -> Result<Self> {
        if page_index == 0 {
            return Ok(Self {
                depth: 0,
                slots: [0; MAX_INDIRECTION],
            });
        }
        let mut rest = page_index - 1;
        let mut capacity = 1_u64;
        for depth in 1..=MAX_INDIRECTION {
            capacity = capacity.saturating_mul(POINTERS_PER_PAGE);
            if rest < capacity {
                let mut slots = [0_u64; MAX_INDIRECTION];
                for level in (0..depth).rev() {
                    slots[level] = rest % POINTERS_PER_PAGE;
                    rest /= POINTERS_PER_PAGE;
                }
                return Ok(Self { depth, slots });
            }
            rest -= capacity;
        }
        Err(HcfsError::Format(format!(
            "entry page {page_index} beyond quadruple indirect range"
        )))
    }
}

/// One inode's block table over a byte device.
///
/// Not internally synchronized: the per-inode metadata lock around it is
/// owned by the caller.
#[derive(Debug)]
pub struct FileBlocks<D: ByteDevice> {
    dev: D,
    inode: InodeNumber,
    pinned: bool,
    stats: FileStats,
    /// direct, single, double, triple, quadruple
    roots: [u64; MAX_INDIRECTION + 1],
}

impl<D: ByteDevice> FileBlocks<D> {
    /// Initialize an empty table on `dev`, discarding previous contents.
    pub fn create(dev: D, inode: InodeNumber, pinned: bool) -> Result<Self> {
        dev.set_len(0)?;
        let table = Self {
            dev,
            inode,
            pinned,
            stats: FileStats::default(),
            roots: [0; MAX_INDIRECTION + 1],
        };
        table.flush_header()?;
        Ok(table)
    }

    pub fn open(dev: D) -> Result<Self> {
        let mut buf = [0_u8; HEADER_SIZE];
        dev.read_exact_at(0, &mut buf)?;
        let magic = read_le_u32(&buf, OFF_MAGIC).map_err(header_err)?;
        if magic != META_MAGIC {
            return Err(HcfsError::Format(format!(
                "block table magic {magic:#x}, expected {META_MAGIC:#x}"
            )));
        }
        let version = read_le_u16(&buf, OFF_VERSION).map_err(header_err)?;
        if version != META_VERSION {
            return Err(HcfsError::Format(format!(
                "unsupported block table version {version}"
            )));
        }
        let inode = InodeNumber(read_le_u64(&buf, OFF_INODE).map_err(header_err)?);
        let stats = FileStats {
            num_blocks: read_le_u64(&buf, OFF_NUM_BLOCKS).map_err(header_err)?,
            num_cached_blocks: read_le_u64(&buf, OFF_CACHED_BLOCKS).map_err(header_err)?,
            cached_size: read_le_u64(&buf, OFF_CACHED_SIZE).map_err(header_err)?,
            dirty_data_size: read_le_u64(&buf, OFF_DIRTY_SIZE).map_err(header_err)?,
            file_size: read_le_u64(&buf, OFF_FILE_SIZE).map_err(header_err)?,
        };
        let mut roots = [0_u64; MAX_INDIRECTION + 1];
        for (i, root) in roots.iter_mut().enumerate() {
            *root = read_le_u64(&buf, OFF_ROOTS + i * 8).map_err(header_err)?;
        }
        Ok(Self {
            dev,
            inode,
            pinned: buf[OFF_PINNED] != 0,
            stats,
            roots,
        })
    }

    #[must_use]
    pub fn inode(&self) -> InodeNumber {
        self.inode
    }

    #[must_use]
    pub fn pinned(&self) -> bool {
        self.pinned
    }

    #[must_use]
    pub fn stats(&self) -> FileStats {
        self.stats
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    pub fn set_pinned(&mut self, pinned: bool) -> Result<()> {
        self.pinned = pinned;
        self.flush_header()
    }

    pub fn set_stats(&mut self, stats: FileStats) -> Result<()> {
        self.stats = stats;
        self.flush_header()
    }

    /// Entry for `block`; a NONE entry when its page was never allocated.
    pub fn entry(&self, block: BlockNumber) -> Result<BlockEntry> {
        let (page_index, slot) = split_block(block);
        let Some(page) = self.find_page(page_index)? else {
            return Ok(BlockEntry::default());
        };
        let mut buf = [0_u8; BlockEntry::ENCODED_LEN];
        self.dev.read_exact_at(entry_offset(page, slot), &mut buf)?;
        BlockEntry::decode(&buf).map_err(|e| self.corrupt(block, &e))
    }

    /// Store `entry` for `block`, allocating pages on the way.
    pub fn set_entry(&mut self, block: BlockNumber, entry: &BlockEntry) -> Result<()> {
        let (page_index, slot) = split_block(block);
        let page = match self.find_page(page_index)? {
            Some(page) => page,
            None if entry.status == BlockStatus::None && *entry == BlockEntry::default() => {
                return Ok(());
            }
            None => self.allocate_route(page_index)?,
        };

        let offset = entry_offset(page, slot);
        let mut old = [0_u8; BlockEntry::ENCODED_LEN];
        self.dev.read_exact_at(offset, &mut old)?;
        let was_used = BlockEntry::decode(&old)
            .map_err(|e| self.corrupt(block, &e))?
            .status
            != BlockStatus::None;
        let now_used = entry.status != BlockStatus::None;

        let mut buf = [0_u8; BlockEntry::ENCODED_LEN];
        entry
            .encode_into(&mut buf)
            .map_err(|e| self.corrupt(block, &e))?;
        self.dev.write_all_at(offset, &buf)?;

        if was_used != now_used {
            let mut count = [0_u8; 4];
            self.dev.read_exact_at(page, &mut count)?;
            let used = u32::from_le_bytes(count);
            let used = if now_used {
                used.saturating_add(1)
            } else {
                used.saturating_sub(1)
            };
            self.dev.write_all_at(page, &used.to_le_bytes())?;
        }
        Ok(())
    }

    /// Number of non-NONE entries on the page holding `block`.
    pub fn used_entries_on_page(&self, block: BlockNumber) -> Result<u32> {
        let (page_index, _) = split_block(block);
        let Some(page) = self.find_page(page_index)? else {
            return Ok(0);
        };
        let mut count = [0_u8; 4];
        self.dev.read_exact_at(page, &mut count)?;
        Ok(u32::from_le_bytes(count))
    }

    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }

    fn find_page(&self, page_index: u64) -> Result<Option<u64>> {
        let route = PageRoute::for_page(page_index)?;
        let mut offset = self.roots[route.depth];
        for slot in &route.slots[..route.depth] {
            if offset == 0 {
                return Ok(None);
            }
            offset = self.read_pointer(offset, *slot)?;
        }
        Ok((offset != 0).then_some(offset))
    }

    fn allocate_route(&mut self, page_index: u64) -> Result<u64> {
        let route = PageRoute::for_page(page_index)?;
        let leaf_size = |level: usize| {
            if level == route.depth {
                ENTRY_PAGE_SIZE
            } else {
                POINTER_PAGE_SIZE
            }
        };

        if self.roots[route.depth] == 0 {
            self.roots[route.depth] = self.append_page(leaf_size(0))?;
            self.flush_header()?;
        }
        let mut offset = self.roots[route.depth];
        for (level, slot) in route.slots[..route.depth].iter().enumerate() {
            let mut next = self.read_pointer(offset, *slot)?;
            if next == 0 {
                next = self.append_page(leaf_size(level + 1))?;
                self.write_pointer(offset, *slot, next)?;
            }
            offset = next;
        }
        tracing::trace!(
            target: "hcfs::ledger",
            inode = self.inode.0,
            page_index,
            depth = route.depth,
            offset,
            "block_table_page_alloc"
        );
        Ok(offset)
    }

    fn append_page(&self, size: usize) -> Result<u64> {
        let offset = self.dev.len_bytes()?.max(HEADER_SIZE as u64);
        self.dev.write_all_at(offset, &vec![0_u8; size])?;
        Ok(offset)
    }

    fn read_pointer(&self, page: u64, slot: u64) -> Result<u64> {
        let mut buf = [0_u8; 8];
        self.dev.read_exact_at(page + slot * 8, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_pointer(&self, page: u64, slot: u64, value: u64) -> Result<()> {
        self.dev.write_all_at(page + slot * 8, &value.to_le_bytes())
    }

    fn flush_header(&self) -> Result<()> {
        let mut buf = [0_u8; HEADER_SIZE];
        self.encode_header(&mut buf).map_err(header_err)?;
        self.dev.write_all_at(0, &buf)
    }

    fn encode_header(&self, buf: &mut [u8]) -> std::result::Result<(), ParseError> {
        write_le_u32(buf, OFF_MAGIC, META_MAGIC)?;
        write_le_u16(buf, OFF_VERSION, META_VERSION)?;
        buf[OFF_PINNED] = u8::from(self.pinned);
        write_le_u64(buf, OFF_INODE, self.inode.0)?;
        write_le_u64(buf, OFF_NUM_BLOCKS, self.stats.num_blocks)?;
        write_le_u64(buf, OFF_CACHED_BLOCKS, self.stats.num_cached_blocks)?;
        write_le_u64(buf, OFF_CACHED_SIZE, self.stats.cached_size)?;
        write_le_u64(buf, OFF_DIRTY_SIZE, self.stats.dirty_data_size)?;
        write_le_u64(buf, OFF_FILE_SIZE, self.stats.file_size)?;
        for (i, root) in self.roots.iter().enumerate() {
            write_le_u64(buf, OFF_ROOTS + i * 8, *root)?;
        }
        Ok(())
    }

    fn corrupt(&self, block: BlockNumber, err: &ParseError) -> HcfsError {
        HcfsError::Corruption {
            inode: self.inode.0,
            detail: format!("block {block}: {err}"),
        }
    }
}

fn split_block(block: BlockNumber) -> (u64, u64) {
    (block.0 / ENTRIES_PER_PAGE, block.0 % ENTRIES_PER_PAGE)
}

fn entry_offset(page: u64, slot: u64) -> u64 {
    page + PAGE_HEADER_SIZE as u64 + slot * BlockEntry::ENCODED_LEN as u64
}

fn header_err(err: ParseError) -> HcfsError {
    HcfsError::Parse(format!("block table header: {err}"))
}
