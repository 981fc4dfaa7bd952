use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, RwLock};

use log::debug;

use crate::entry::{EntryContent, OwnedContent, VfdEntry};
use crate::kernel::{acquire_placeholder_fd, KernelOps};
use crate::pm::{PmOpenFile, PmPool};

/// Default table capacity, matching `PMEMFILE_MAX_FD` in the original
/// implementation.
pub const MAX_FDS: usize = 0x8000;

/// Mirrors `AT_FDCWD`: a sentinel fd meaning "relative to the current
/// working directory" rather than a real table slot.
pub const AT_FDCWD: RawFd = libc::AT_FDCWD;

/// What a `CwdInner` currently anchors.
enum CwdKind {
    Kernel(RawFd),
    Pm { pool: Arc<PmPool>, file: Arc<PmOpenFile> },
}

/// The live working-directory anchor.
///
/// `chdir`/`fchdir` publish a fresh `Arc<CwdInner>` rather than mutating one
/// in place, the same copy-on-write approach [`crate::pm::VInode`] uses for
/// its block list: a thread mid-syscall that cloned the old `Arc` before the
/// swap keeps a perfectly valid, unaffected view of the old cwd, and the
/// kernel fd it anchors is only closed once every such clone has dropped —
/// `Drop` does that bookkeeping instead of a hand-rolled ref count.
struct CwdInner {
    kind: CwdKind,
    kernel: Arc<dyn KernelOps>,
}

impl Drop for CwdInner {
    fn drop(&mut self) {
        // `fd < 0` only for the placeholder cwd installed before `init()`
        // ever runs; nothing was ever opened for it.
        if let CwdKind::Kernel(fd) = self.kind {
            if fd >= 0 {
                self.kernel.close(fd);
            }
        }
    }
}

/// A reference obtained from [`VfdTable::at_ref`]/[`VfdTable::ref_fd`],
/// kept alive for as long as the caller needs the content it names.
///
/// `Slot` must be paired with a later [`VfdTable::unref`] call, passing the
/// same `VfdRef` back — that's how `unref` tells a pass-through reference
/// (nothing to release) apart from a real table-slot reference (decrement
/// needed), without re-deriving that from the bare fd number, which would
/// race against whatever has been installed at that number since. `Cwd`
/// needs no such call — dropping it is enough, since the liveness of a
/// `CwdInner` is ordinary `Arc` reference counting.
pub enum VfdRef {
    Slot {
        fd: RawFd,
        counted: bool,
        content: OwnedContent,
    },
    Cwd(Arc<CwdInner>),
}

impl VfdRef {
    pub fn as_pm(&self) -> Option<(&Arc<PmPool>, &Arc<PmOpenFile>)> {
        match self {
            VfdRef::Slot {
                content: OwnedContent::Pm { pool, file },
                ..
            } => Some((pool, file)),
            VfdRef::Cwd(inner) => match &inner.kind {
                CwdKind::Pm { pool, file } => Some((pool, file)),
                CwdKind::Kernel(_) => None,
            },
            _ => None,
        }
    }

    pub fn as_kernel_fd(&self) -> Option<RawFd> {
        match self {
            VfdRef::Slot {
                content: OwnedContent::Kernel { fd },
                ..
            } => Some(*fd),
            VfdRef::Cwd(inner) => match inner.kind {
                CwdKind::Kernel(fd) => Some(fd),
                CwdKind::Pm { .. } => None,
            },
            _ => None,
        }
    }
}

/// The virtual file-descriptor table: a fixed arena of entries addressed
/// directly by kernel fd number, and a copy-on-write cwd anchor.
///
/// Every occupied slot's own index *is* a genuinely open kernel fd: a
/// placeholder from `memfd_create`/`/dev/null` for a freshly `assign`ed PM
/// file, or the result of a real `dup`/`dup2` for an aliased one — mirroring
/// the reference implementation's `acquire_new_fd`/`vfd_table[result]`
/// exactly, rather than allocating slot indices from a pool independent of
/// any real descriptor.
///
/// Lookups (`ref_fd`/`at_ref`) are lock-free — a `compare_exchange` loop on
/// the target entry's reference count, or a brief cwd read-lock clone.
/// Anything that *installs* a new occupant into a slot (`dup`, `dup2`,
/// `assign`, `fchdir`) serializes through `install_lock`, matching the
/// single mutex the reference implementation holds across its own
/// cell-replacement operations — the fast paths don't need it, only the
/// rarer structural changes do.
pub struct VfdTable {
    entries: Vec<VfdEntry>,
    install_lock: Mutex<()>,
    cwd: RwLock<Arc<CwdInner>>,
    kernel: Arc<dyn KernelOps>,
}

impl VfdTable {
    pub fn new(kernel: Arc<dyn KernelOps>) -> Self {
        Self::with_capacity(MAX_FDS, kernel)
    }

    pub fn with_capacity(capacity: usize, kernel: Arc<dyn KernelOps>) -> Self {
        let entries = (0..capacity).map(|_| VfdEntry::vacant()).collect();
        let placeholder_cwd = Arc::new(CwdInner {
            kind: CwdKind::Kernel(-1),
            kernel: kernel.clone(),
        });
        VfdTable {
            entries,
            install_lock: Mutex::new(()),
            cwd: RwLock::new(placeholder_cwd),
            kernel,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Anchors the real working directory as the initial cwd. Must run
    /// once before any `chdir`/`fchdir` use.
    pub fn init(&self) -> i64 {
        let fd = self.kernel.open_cwd();
        if fd < 0 {
            return fd;
        }
        *self.cwd.write().unwrap() = Arc::new(CwdInner {
            kind: CwdKind::Kernel(fd as RawFd),
            kernel: self.kernel.clone(),
        });
        0
    }

    fn fast_check(&self, fd: RawFd) -> bool {
        fd >= 0 && (fd as usize) < self.entries.len()
    }

    /// Looks up `fd`, taking a reference. Lock-free: a failed
    /// compare-exchange against a vacant slot never blocks.
    ///
    /// Never fails: a `fd` outside the table's range, or one whose cell is
    /// vacant, is simply not ours to know about — it returns a pass-through
    /// reference naming `fd` itself, exactly as the reference
    /// implementation's `can_be_in_vfd_table` check does. The overwhelming
    /// majority of fds a process holds (stdio, sockets, ordinary files)
    /// fall into this case, and none of them are errors.
    pub fn ref_fd(&self, fd: RawFd) -> VfdRef {
        if self.fast_check(fd) {
            let entry = &self.entries[fd as usize];
            if entry.try_inc_ref() {
                return VfdRef::Slot {
                    fd,
                    counted: true,
                    content: entry.snapshot_content(),
                };
            }
        }
        VfdRef::Slot {
            fd,
            counted: false,
            content: OwnedContent::Kernel { fd },
        }
    }

    /// Like `ref_fd`, but resolves `AT_FDCWD` to the current cwd anchor.
    pub fn at_ref(&self, fd: RawFd) -> VfdRef {
        if fd == AT_FDCWD {
            let inner = self.cwd.read().unwrap().clone();
            return VfdRef::Cwd(inner);
        }
        self.ref_fd(fd)
    }

    /// Releases a reference taken via `ref_fd`/`at_ref`. A no-op for
    /// pass-through references and for `Cwd` — the caller already released
    /// the latter by dropping the `VfdRef` it was handed.
    pub fn unref(&self, r: VfdRef) {
        if let VfdRef::Slot { fd, counted: true, .. } = r {
            let entry = &self.entries[fd as usize];
            if entry.dec_ref() {
                self.teardown(entry, fd as u32);
            }
        }
    }

    fn teardown(&self, entry: &VfdEntry, slot: u32) {
        let content = entry.take_content();
        if let EntryContent::Pm { file, .. } = &content {
            file.close();
        }
        self.kernel.close(slot as RawFd);
        debug!("vfd {slot} torn down");
    }

    /// Duplicates `old_fd`. If it names a live PM-backed slot, the real
    /// kernel `dup` of its placeholder fd is mirrored into a fresh slot at
    /// the returned number; otherwise this forwards straight to the kernel
    /// and returns whatever it says, exactly like `dup`-ing any other fd —
    /// the table is never involved for an fd it doesn't hold.
    pub fn dup(&self, old_fd: RawFd) -> i64 {
        if !self.fast_check(old_fd) {
            return self.kernel.dup(old_fd);
        }
        let entry = &self.entries[old_fd as usize];
        if !entry.try_inc_ref() {
            return self.kernel.dup(old_fd);
        }

        let (pool, file) = entry.peek_content(|c| match c {
            EntryContent::Pm { pool, file } => (pool.clone(), file.clone()),
            EntryContent::Vacant => unreachable!(),
        });
        let result = self.kernel.dup(old_fd);
        if result >= 0 {
            self.install_pm_at(result, pool, file);
        }
        entry.dec_ref();
        result
    }

    /// Mirrors a PM entry into the slot at kernel fd `fd`, which some real
    /// `dup`/`dup2` call just produced. Asserts the slot was vacant — the
    /// kernel is not expected to hand back a number this table still
    /// considers live.
    fn install_pm_at(&self, fd: i64, pool: Arc<PmPool>, file: Arc<PmOpenFile>) {
        if fd < 0 || (fd as usize) >= self.entries.len() {
            // Outside this table's preallocated range: leave it as an
            // ordinary, untracked kernel fd (see spec's Non-goal on
            // kernel-fd values outside the fixed range).
            return;
        }
        let _guard = self.install_lock.lock().unwrap();
        let slot = fd as usize;
        assert!(
            self.entries[slot].is_currently_vacant(),
            "kernel handed back fd {fd} the table still considers live"
        );
        self.entries[slot].reinit(EntryContent::pm(pool, file));
    }

    /// Duplicates `old_fd` onto the explicit `new_fd`. If `old_fd` names a
    /// live PM-backed slot, asserts the destination is empty rather than
    /// silently closing an occupant — the reference implementation does the
    /// same (see DESIGN.md for the Open Question this resolves). Otherwise
    /// this forwards straight to the kernel, untouched by the table.
    pub fn dup2(&self, old_fd: RawFd, new_fd: RawFd) -> i64 {
        if old_fd == new_fd {
            // POSIX dup2(fd, fd) is a no-op; special-cased so it never
            // trips the occupied-destination assert against the fd's own
            // entry.
            if self.fast_check(old_fd) && !self.entries[old_fd as usize].is_currently_vacant() {
                return old_fd as i64;
            }
            return self.kernel.dup2(old_fd, new_fd);
        }

        if !self.fast_check(old_fd) {
            return self.kernel.dup2(old_fd, new_fd);
        }
        let entry = &self.entries[old_fd as usize];
        if !entry.try_inc_ref() {
            return self.kernel.dup2(old_fd, new_fd);
        }

        let (pool, file) = entry.peek_content(|c| match c {
            EntryContent::Pm { pool, file } => (pool.clone(), file.clone()),
            EntryContent::Vacant => unreachable!(),
        });
        let result = self.kernel.dup2(old_fd, new_fd);
        if result >= 0 {
            assert_eq!(result, new_fd as i64, "dup2 must return the requested target fd");
            if self.fast_check(new_fd) {
                let new_entry = &self.entries[new_fd as usize];
                let _guard = self.install_lock.lock().unwrap();
                assert!(
                    new_entry.is_currently_vacant(),
                    "dup2 target fd {new_fd} is already occupied"
                );
                new_entry.reinit(EntryContent::pm(pool, file));
            }
        }
        entry.dec_ref();
        result
    }

    /// Closes `fd`: releases the table's own baseline reference, tearing
    /// the entry down once nothing else is still using it. An `fd` that
    /// isn't a live PM slot (out of range, vacant, or never opened) is
    /// forwarded straight to the kernel, whose result is returned as-is —
    /// closing an ordinary fd, or double-closing one, behaves exactly like
    /// POSIX `close()`.
    pub fn close(&self, fd: RawFd) -> i64 {
        if fd == AT_FDCWD {
            return -(libc::EINVAL as i64);
        }
        if !self.fast_check(fd) {
            return self.kernel.close(fd);
        }
        let entry = &self.entries[fd as usize];
        match entry.dec_ref_if_live() {
            None => self.kernel.close(fd),
            Some(was_last) => {
                if was_last {
                    self.teardown(entry, fd as u32);
                }
                0
            }
        }
    }

    /// Installs a freshly opened PM file into a new slot. Reserves a real
    /// kernel placeholder fd first (`memfd_create`, falling back to
    /// `/dev/null`) and uses its number directly as the slot index, so the
    /// returned vfd is always a legal kernel fd — never a bookkeeping index
    /// decoupled from one. Returns a negative errno (`-ENFILE` if the
    /// placeholder lands outside this table's range) on failure.
    pub fn assign(&self, pool: Arc<PmPool>, file: Arc<PmOpenFile>) -> i64 {
        let fd = acquire_placeholder_fd(self.kernel.as_ref());
        if fd < 0 {
            return fd;
        }
        if (fd as usize) >= self.entries.len() {
            self.kernel.close(fd as RawFd);
            return -(libc::ENFILE as i64);
        }

        let _guard = self.install_lock.lock().unwrap();
        let slot = fd as usize;
        assert!(
            self.entries[slot].is_currently_vacant(),
            "kernel handed back fd {fd} the table still considers live"
        );
        self.entries[slot].reinit(EntryContent::pm(pool, file));
        fd
    }

    /// Makes a PM-resident directory the new cwd.
    pub fn chdir_pm(&self, pool: Arc<PmPool>, file: Arc<PmOpenFile>) -> i64 {
        self.chdir_pm_locked(pool, file)
    }

    /// Makes the directory named by the already-open kernel fd `fd` the
    /// new cwd, issuing a real `fchdir` first so the process's actual
    /// working directory stays in sync with the table's idea of it.
    pub fn chdir_kernel_fd(&self, fd: RawFd) -> i64 {
        let _guard = self.install_lock.lock().unwrap();
        let r = self.kernel.fchdir(fd);
        if r < 0 {
            return r;
        }
        *self.cwd.write().unwrap() = Arc::new(CwdInner {
            kind: CwdKind::Kernel(fd),
            kernel: self.kernel.clone(),
        });
        0
    }

    /// Makes whatever `fd` currently refers to the new cwd. A live
    /// PM-backed slot is shared directly into the cwd anchor (no new
    /// descriptor needed); anything else is handled by `fchdir_via_dup` —
    /// dup it, `fchdir` the dup, install a fresh cwd anchor — exactly the
    /// reference implementation's split for `vfd_table`-resident vs.
    /// ordinary fds.
    pub fn fchdir(&self, fd: RawFd) -> i64 {
        if fd == AT_FDCWD {
            return 0;
        }
        if self.fast_check(fd) {
            let entry = &self.entries[fd as usize];
            if entry.try_inc_ref() {
                let result = entry.peek_content(|c| match c {
                    EntryContent::Pm { pool, file } => self.chdir_pm_locked(pool.clone(), file.clone()),
                    EntryContent::Vacant => unreachable!(),
                });
                entry.dec_ref();
                return result;
            }
        }
        self.fchdir_via_dup(fd)
    }

    fn chdir_pm_locked(&self, pool: Arc<PmPool>, file: Arc<PmOpenFile>) -> i64 {
        let _guard = self.install_lock.lock().unwrap();
        *self.cwd.write().unwrap() = Arc::new(CwdInner {
            kind: CwdKind::Pm { pool, file },
            kernel: self.kernel.clone(),
        });
        0
    }

    fn fchdir_via_dup(&self, kfd: RawFd) -> i64 {
        let dup_fd = self.kernel.dup(kfd);
        if dup_fd < 0 {
            return dup_fd;
        }
        let dup_fd = dup_fd as RawFd;
        let r = self.kernel.fchdir(dup_fd);
        if r < 0 {
            self.kernel.close(dup_fd);
            return r;
        }
        let _guard = self.install_lock.lock().unwrap();
        *self.cwd.write().unwrap() = Arc::new(CwdInner {
            kind: CwdKind::Kernel(dup_fd),
            kernel: self.kernel.clone(),
        });
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::FakeKernel;
    use crate::pm::VInode;

    fn table(capacity: usize) -> VfdTable {
        VfdTable::with_capacity(capacity, Arc::new(FakeKernel::new()))
    }

    fn assign_pm(t: &VfdTable) -> RawFd {
        let pool = PmPool::new("test");
        let file = PmOpenFile::new(VInode::new());
        t.assign(pool, file) as RawFd
    }

    #[test]
    fn assign_then_ref_then_close() {
        let t = table(8);
        let fd = assign_pm(&t);
        assert!(fd >= 0);
        let r = t.ref_fd(fd);
        assert!(r.as_pm().is_some());
        t.unref(r);
        assert_eq!(t.close(fd), 0);
        assert_eq!(t.close(fd), -(libc::EBADF as i64));
    }

    #[test]
    fn ref_out_of_range_or_vacant_fd_passes_through() {
        let t = table(8);
        let r = t.ref_fd(99);
        assert_eq!(r.as_kernel_fd(), Some(99));
        assert!(r.as_pm().is_none());
        t.unref(r);

        let r = t.ref_fd(-1);
        assert_eq!(r.as_kernel_fd(), Some(-1));
        t.unref(r);
    }

    #[test]
    fn dup_unknown_fd_is_ebadf() {
        let t = table(8);
        assert_eq!(t.dup(3), -(libc::EBADF as i64));
    }

    #[test]
    fn dup_of_real_non_table_fd_forwards_to_kernel() {
        let kernel = Arc::new(FakeKernel::new());
        let t = VfdTable::with_capacity(8, kernel.clone());
        let real_fd = kernel.open_cwd();
        assert!(real_fd >= 0);

        let dup_fd = t.dup(real_fd as RawFd);
        assert!(dup_fd >= 0 && dup_fd != real_fd, "dup must forward to the kernel for a non-resident fd");

        let r = t.ref_fd(dup_fd as RawFd);
        assert!(r.as_pm().is_none(), "a plain kernel fd must never be mirrored into the PM table");
        t.unref(r);
    }

    #[test]
    fn dup2_of_real_non_table_fd_forwards_to_kernel() {
        let kernel = Arc::new(FakeKernel::new());
        let t = VfdTable::with_capacity(8, kernel.clone());
        let real_fd = kernel.open_cwd();
        let target = real_fd + 100;
        assert_eq!(t.dup2(real_fd as RawFd, target as RawFd), target as i64);
    }

    #[test]
    fn dup_shares_same_pm_file() {
        let t = table(8);
        let fd = assign_pm(&t);
        let fd2 = t.dup(fd);
        assert!(fd2 >= 0);
        assert_ne!(fd as i64, fd2);

        let r1 = t.ref_fd(fd);
        let r2 = t.ref_fd(fd2 as RawFd);
        assert!(Arc::ptr_eq(r1.as_pm().unwrap().1, r2.as_pm().unwrap().1));
        t.unref(r1);
        t.unref(r2);
    }

    #[test]
    fn dup2_onto_vacant_slot_installs_there() {
        let t = table(8);
        let fd = assign_pm(&t);
        let target = (0..8).find(|&i| i as RawFd != fd).unwrap() as RawFd;
        assert_eq!(t.dup2(fd, target), target as i64);
        let r = t.ref_fd(target);
        assert!(r.as_pm().is_some());
        t.unref(r);
    }

    #[test]
    #[should_panic(expected = "already occupied")]
    fn dup2_onto_occupied_slot_panics() {
        let t = table(8);
        let fd_a = assign_pm(&t);
        let fd_b = assign_pm(&t);
        t.dup2(fd_a, fd_b);
    }

    #[test]
    fn close_recycles_slot_for_reuse() {
        let t = table(4);
        let fd = assign_pm(&t);
        assert_eq!(t.close(fd), 0);
        let fd2 = assign_pm(&t);
        // Table of capacity 4 has exactly 4 distinct numbers to give out;
        // after closing one, assigning again must succeed without growing.
        assert!(fd2 >= 0 && (fd2 as usize) < 4);
    }

    #[test]
    fn assigned_vfd_is_a_valid_kernel_fd() {
        let kernel = Arc::new(FakeKernel::new());
        let t = VfdTable::with_capacity(16, kernel.clone());
        let fd = assign_pm(&t);
        assert!(fd >= 0);
        // The table's assign reserved a real placeholder descriptor at
        // this exact number — the kernel must agree it's open.
        assert_eq!(kernel.fchdir(fd), 0);
    }

    #[test]
    fn chdir_pm_then_at_ref_cwd_sees_it() {
        let t = table(4);
        let pool = PmPool::new("dir");
        let file = PmOpenFile::new(VInode::new());
        assert_eq!(t.chdir_pm(pool, file), 0);
        let r = t.at_ref(AT_FDCWD);
        assert!(r.as_pm().is_some());
    }

    #[test]
    fn fchdir_to_pm_fd_updates_cwd() {
        let t = table(4);
        let fd = assign_pm(&t);
        assert_eq!(t.fchdir(fd), 0);
        let r = t.at_ref(AT_FDCWD);
        assert!(r.as_pm().is_some());
    }

    #[test]
    fn fchdir_unknown_fd_is_ebadf() {
        let t = table(4);
        assert_eq!(t.fchdir(42), -(libc::EBADF as i64));
    }

    #[test]
    fn fchdir_via_dup_on_real_non_table_fd_updates_cwd() {
        let kernel = Arc::new(FakeKernel::new());
        let t = VfdTable::with_capacity(8, kernel.clone());
        let kfd = kernel.open_cwd();

        assert_eq!(t.fchdir(kfd as RawFd), 0);
        let r = t.at_ref(AT_FDCWD);
        assert!(r.as_kernel_fd().is_some());
    }
}
