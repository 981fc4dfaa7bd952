use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use crate::iterator::LockFreeIterator;

/// Flag bit on [`Block::flags`] marking a block as holding user-written
/// data rather than an unwritten (read-as-zero) range.
pub const BLOCK_INITIALIZED: u32 = 1 << 0;

/// A contiguous range of an inode's bytes.
///
/// Block lists are copy-on-write: a writer builds a new list version and
/// swaps [`VInode`]'s head pointer under the write lock rather than
/// mutating a block in place, so a `Block` reachable from a cached pointer
/// (the iterator cache's `block_pointer_cache`) never changes under a
/// reader that's holding onto it via `Arc`.
pub struct Block {
    pub offset: u64,
    pub size: u64,
    pub data: Arc<[u8]>,
    pub flags: u32,
    pub next: Option<Arc<Block>>,
}

impl Block {
    pub fn is_initialized(&self) -> bool {
        self.flags & BLOCK_INITIALIZED != 0
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.offset <= offset && offset < self.offset + self.size
    }
}

/// Stand-in for a PM pool handle. Real pools own the memory-mapped PM
/// file and the allocator over it; this crate only needs something
/// `Arc`-shareable that VFD-entries aliasing the same open file can point
/// at in common.
pub struct PmPool {
    pub name: String,
}

impl PmPool {
    pub fn new(name: impl Into<String>) -> Arc<PmPool> {
        Arc::new(PmPool { name: name.into() })
    }
}

/// A vinode: a block list plus the pre/post write epoch counters the read
/// fast path depends on.
///
/// Invariant (enforced by every writer in this module): at any quiescent
/// moment `pre_write_counter == post_write_counter`; while a write is in
/// flight, `pre > post`.
pub struct VInode {
    first_block: RwLock<Option<Arc<Block>>>,
    file_size: AtomicU64,
    pre_write_counter: AtomicU64,
    post_write_counter: AtomicU64,
}

impl VInode {
    pub fn new() -> Arc<VInode> {
        Arc::new(VInode {
            first_block: RwLock::new(None),
            file_size: AtomicU64::new(0),
            pre_write_counter: AtomicU64::new(0),
            post_write_counter: AtomicU64::new(0),
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    pub fn pre_write_counter(&self) -> u64 {
        self.pre_write_counter.load(Ordering::Acquire)
    }

    pub fn post_write_counter(&self) -> u64 {
        self.post_write_counter.load(Ordering::Acquire)
    }

    pub fn first_block(&self) -> Option<Arc<Block>> {
        self.first_block.read().unwrap().clone()
    }

    /// Holds the read lock for the duration of a slow-path read so the
    /// block-list snapshot and `file_size` it's read against can't be torn
    /// apart by a concurrent writer.
    pub(crate) fn lock_read(&self) -> RwLockReadGuard<'_, Option<Arc<Block>>> {
        self.first_block.read().unwrap()
    }

    /// Extends the file to `new_size` without writing any bytes, producing
    /// a sparse hole read back as zero. Still bracketed by the write-epoch
    /// counters: a truncate/extend is a vinode mutation like any other.
    pub fn extend_sparse(&self, new_size: u64) {
        let _guard = self.first_block.write().unwrap();
        self.pre_write_counter.fetch_add(1, Ordering::Release);
        self.file_size.fetch_max(new_size, Ordering::AcqRel);
        self.post_write_counter.fetch_add(1, Ordering::Release);
    }

    /// Writes `data` at `offset`, splicing it into the block list (clipping
    /// or removing anything it overlaps). The whole block-list swap
    /// happens between the pre/post counter increments, under the write
    /// lock, per the writer notifier contract.
    pub fn write_at(&self, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let mut guard = self.first_block.write().unwrap();
        self.pre_write_counter.fetch_add(1, Ordering::Release);

        let new_block = Block {
            offset,
            size: data.len() as u64,
            data: Arc::from(data),
            flags: BLOCK_INITIALIZED,
            next: None,
        };
        *guard = Some(splice_block(guard.take(), new_block));

        let end = offset + data.len() as u64;
        self.file_size.fetch_max(end, Ordering::AcqRel);
        self.post_write_counter.fetch_add(1, Ordering::Release);
    }
}

/// Walks the block list starting at `cur`, returning the first block whose
/// range reaches past `pos` — either the block containing `pos`, or the
/// next block after a gap at `pos`. `None` means `pos` is at or past the
/// end of every known block (a sparse tail).
pub(crate) fn locate(mut cur: Option<Arc<Block>>, pos: u64) -> Option<Arc<Block>> {
    while let Some(b) = cur {
        if b.offset + b.size > pos {
            return Some(b);
        }
        cur = b.next.clone();
    }
    None
}

fn collect_disjoint(head: Option<Arc<Block>>) -> Vec<Block> {
    let mut out = Vec::new();
    let mut cur = head;
    while let Some(b) = cur {
        out.push(Block {
            offset: b.offset,
            size: b.size,
            data: b.data.clone(),
            flags: b.flags,
            next: None,
        });
        cur = b.next.clone();
    }
    out
}

fn rebuild(mut blocks: Vec<Block>) -> Arc<Block> {
    blocks.sort_by_key(|b| b.offset);
    let mut next = None;
    for b in blocks.into_iter().rev() {
        next = Some(Arc::new(Block { next, ..b }));
    }
    next.expect("splice_block always inserts at least the new block")
}

/// Inserts `new_block` into the list headed by `head`, clipping or
/// dropping whatever it overlaps, and returns the new head.
fn splice_block(head: Option<Arc<Block>>, new_block: Block) -> Arc<Block> {
    let new_start = new_block.offset;
    let new_end = new_block.offset + new_block.size;
    let mut out = Vec::new();

    for b in collect_disjoint(head) {
        let b_start = b.offset;
        let b_end = b.offset + b.size;
        if b_end <= new_start || b_start >= new_end {
            out.push(b);
            continue;
        }
        if b_start < new_start {
            let keep_len = (new_start - b_start) as usize;
            out.push(Block {
                offset: b_start,
                size: keep_len as u64,
                data: Arc::from(&b.data[..keep_len]),
                flags: b.flags,
                next: None,
            });
        }
        if b_end > new_end {
            let skip = (new_end - b_start) as usize;
            out.push(Block {
                offset: new_end,
                size: b_end - new_end,
                data: Arc::from(&b.data[skip..]),
                flags: b.flags,
                next: None,
            });
        }
    }
    out.push(new_block);
    rebuild(out)
}

struct OpenFileState {
    cursor: u64,
    iterator: LockFreeIterator,
}

/// A PM-resident open file: a vinode plus the per-open-file cursor and
/// lock-free iterator cache, all under one mutex (single-writer access, as
/// spec'd — never touched concurrently by two threads for the same open
/// file).
pub struct PmOpenFile {
    vinode: Arc<VInode>,
    state: Mutex<OpenFileState>,
}

impl PmOpenFile {
    pub fn new(vinode: Arc<VInode>) -> Arc<PmOpenFile> {
        Arc::new(PmOpenFile {
            vinode,
            state: Mutex::new(OpenFileState {
                cursor: 0,
                iterator: LockFreeIterator::invalid(),
            }),
        })
    }

    pub fn vinode(&self) -> &Arc<VInode> {
        &self.vinode
    }

    pub fn cursor(&self) -> u64 {
        self.state.lock().unwrap().cursor
    }

    pub fn seek(&self, offset: u64) {
        let mut state = self.state.lock().unwrap();
        state.cursor = offset;
        state.iterator.invalidate();
    }

    /// Reads up to `buf.len()` bytes at the current cursor: tries the
    /// lock-free fast path first, falling back to a vinode-locked walk of
    /// the block list on decline.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut state = self.state.lock().unwrap();
        let OpenFileState { cursor, iterator } = &mut *state;

        if let Some(n) = iterator.try_read(&self.vinode, buf) {
            *cursor += n as u64;
            return n;
        }
        self.read_slow(cursor, iterator, buf)
    }

    fn read_slow(&self, cursor: &mut u64, iterator: &mut LockFreeIterator, buf: &mut [u8]) -> usize {
        let guard = self.vinode.lock_read();
        let file_size = self.vinode.file_size();

        if *cursor >= file_size {
            iterator.invalidate();
            return 0;
        }

        let want = (buf.len() as u64).min(file_size - *cursor) as usize;
        let mut block = locate(guard.clone(), *cursor);
        let mut written = 0usize;
        let mut pos = *cursor;

        while written < want {
            match &block {
                Some(b) if b.contains(pos) && b.is_initialized() => {
                    let off_in_block = (pos - b.offset) as usize;
                    let avail = b.size as usize - off_in_block;
                    let take = avail.min(want - written);
                    buf[written..written + take]
                        .copy_from_slice(&b.data[off_in_block..off_in_block + take]);
                    written += take;
                    pos += take as u64;
                    if off_in_block + take == b.size as usize {
                        block = b.next.clone();
                    }
                }
                _ => {
                    let next_init = find_first_initialized(&block);
                    let gap_end = next_init.as_ref().map(|b| b.offset).unwrap_or(file_size);
                    let take = (gap_end - pos).min((want - written) as u64) as usize;
                    buf[written..written + take].fill(0);
                    written += take;
                    pos += take as u64;
                    if Some(pos) == next_init.as_ref().map(|b| b.offset) {
                        block = next_init;
                    }
                }
            }
        }

        *cursor += written as u64;
        iterator.setup(&self.vinode, block, *cursor, file_size);
        written
    }

    /// Writes `buf` at the current cursor and advances it, invalidating
    /// the iterator cache (the next read must re-`setup` against the new
    /// block list).
    pub fn write(&self, buf: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let cursor = state.cursor;
        self.vinode.write_at(cursor, buf);
        state.cursor = cursor + buf.len() as u64;
        state.iterator.invalidate();
    }

    /// Closes the PM open-file. A real PM library would unmap/release
    /// resources here; this stand-in has nothing further to release once
    /// its last `Arc` drops.
    pub fn close(&self) {}
}

fn find_first_initialized(block: &Option<Arc<Block>>) -> Option<Arc<Block>> {
    let mut cur = block.clone();
    while let Some(b) = cur {
        if b.is_initialized() {
            return Some(b);
        }
        cur = b.next.clone();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrip() {
        let vinode = VInode::new();
        let file = PmOpenFile::new(vinode);
        file.write(b"hello world");
        file.seek(0);
        let mut buf = [0u8; 11];
        assert_eq!(file.read(&mut buf), 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn sparse_extend_reads_as_zero() {
        let vinode = VInode::new();
        vinode.extend_sparse(100);
        let file = PmOpenFile::new(vinode);
        let mut buf = [0xffu8; 50];
        assert_eq!(file.read(&mut buf), 50);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn overlapping_write_clips_old_block() {
        let vinode = VInode::new();
        let file = PmOpenFile::new(vinode);
        file.write(b"AAAAAAAAAA");
        file.seek(4);
        file.write(b"BB");
        file.seek(0);
        let mut buf = [0u8; 10];
        file.read(&mut buf);
        assert_eq!(&buf, b"AAAABBAAAA");
    }
}
