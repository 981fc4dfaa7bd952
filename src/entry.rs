use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::pm::{PmOpenFile, PmPool};

/// What a live VFD-entry is backed by.
///
/// Only PM-backed opens ever occupy a table slot. A plain kernel fd (one
/// never `assign`ed through this table) is never installed here — `ref`,
/// `dup`, and `fchdir` all forward such fds straight to the kernel instead,
/// the same way the reference implementation's `can_be_in_vfd_table` gates
/// table involvement entirely on whether the cell is non-`NULL`.
pub(crate) enum EntryContent {
    /// Slot not yet (re)initialized, or already torn down.
    Vacant,
    /// Backed by a PM-resident open file. The slot's own index is always a
    /// genuinely open kernel placeholder fd (from `memfd_create`/`/dev/null`,
    /// or from a real `dup`/`dup2` of one), so the index doubles as the
    /// fd to close when the slot tears down.
    Pm {
        pool: Arc<PmPool>,
        file: Arc<PmOpenFile>,
    },
}

impl EntryContent {
    pub(crate) fn pm(pool: Arc<PmPool>, file: Arc<PmOpenFile>) -> Self {
        EntryContent::Pm { pool, file }
    }
}

/// A snapshot of an entry's content, or a pass-through kernel fd, handed
/// back to the caller of `ref`/`at_ref`.
#[derive(Clone)]
pub enum OwnedContent {
    Pm {
        pool: Arc<PmPool>,
        file: Arc<PmOpenFile>,
    },
    Kernel {
        fd: RawFd,
    },
}

pub(crate) fn snapshot(content: &EntryContent) -> OwnedContent {
    match content {
        EntryContent::Pm { pool, file } => OwnedContent::Pm {
            pool: pool.clone(),
            file: file.clone(),
        },
        EntryContent::Vacant => unreachable!("referencing a vacant vfd-entry"),
    }
}

/// One arena slot. A slot's identity (its index) never changes across its
/// lifetime; only its content does.
pub(crate) struct VfdEntry {
    ref_count: AtomicUsize,
    content: Mutex<EntryContent>,
}

impl VfdEntry {
    pub(crate) fn vacant() -> Self {
        VfdEntry {
            ref_count: AtomicUsize::new(0),
            content: Mutex::new(EntryContent::Vacant),
        }
    }

    /// Reinitializes a vacant slot. The caller is expected to have already
    /// established (under `install_lock`) that `ref_count == 0` and that no
    /// other thread holds a reference to this slot, so the content can be
    /// written without extra synchronization; the final release store is
    /// what publishes it to any thread that subsequently acquires a
    /// reference.
    pub(crate) fn reinit(&self, content: EntryContent) {
        debug_assert_eq!(self.ref_count.load(Ordering::Acquire), 0);
        *self.content.lock().unwrap() = content;
        self.ref_count.store(1, Ordering::Release);
    }

    /// Increments the reference count only if the entry is currently live
    /// (`ref_count > 0`), using a compare-exchange loop instead of a lock so
    /// a fast lookup never resurrects a slot that's in the middle of being
    /// recycled. Returns `false` if the slot was already vacant.
    pub(crate) fn try_inc_ref(&self) -> bool {
        let mut cur = self.ref_count.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return false;
            }
            match self.ref_count.compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Decrements the reference count; returns `true` if this was the last
    /// reference, in which case the caller must tear down the content and
    /// return the slot to vacant.
    #[must_use]
    pub(crate) fn dec_ref(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Decrements the reference count, but only if the entry is currently
    /// live. Returns `None` if it was already vacant (a double-`close`),
    /// `Some(true)` if this was the last reference.
    pub(crate) fn dec_ref_if_live(&self) -> Option<bool> {
        let mut cur = self.ref_count.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return None;
            }
            match self.ref_count.compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(cur == 1),
                Err(actual) => cur = actual,
            }
        }
    }

    pub(crate) fn is_currently_vacant(&self) -> bool {
        self.ref_count.load(Ordering::Acquire) == 0
    }

    pub(crate) fn snapshot_content(&self) -> OwnedContent {
        snapshot(&self.content.lock().unwrap())
    }

    /// Runs `f` against the current content under the content lock, without
    /// taking or releasing a reference. Used internally by operations (like
    /// `dup`) that already hold a temporary reference of their own.
    pub(crate) fn peek_content<R>(&self, f: impl FnOnce(&EntryContent) -> R) -> R {
        f(&self.content.lock().unwrap())
    }

    /// Takes the content out, leaving `Vacant` behind, for teardown.
    pub(crate) fn take_content(&self) -> EntryContent {
        std::mem::replace(&mut *self.content.lock().unwrap(), EntryContent::Vacant)
    }
}
