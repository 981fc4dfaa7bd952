//! Virtual file-descriptor table and lock-free read fast path for a
//! PM-backed POSIX file-access layer.
//!
//! This crate is the indirection layer a PM-aware POSIX shim multiplexes
//! every fd-accepting call through: both kernel fds (sockets, real files,
//! directories) and PM-resident open files share one integer namespace,
//! addressed by [`table::VfdTable`]. Reads at the current cursor can skip
//! taking the backing file's lock entirely via [`iterator::LockFreeIterator`]
//! when nothing has changed since the cursor's position was last observed.

mod entry;
mod iterator;
mod kernel;
mod pm;
mod table;

use std::os::unix::io::RawFd;
use std::sync::{Arc, OnceLock};

pub use iterator::{LockFreeIterator, FAST_PATH_THRESHOLD};
pub use kernel::{FakeKernel, KernelOps, LibcKernel};
pub use pm::{Block, PmOpenFile, PmPool, VInode, BLOCK_INITIALIZED};
pub use table::{VfdRef, VfdTable, AT_FDCWD, MAX_FDS};

static GLOBAL_TABLE: OnceLock<VfdTable> = OnceLock::new();

/// Initializes the process-wide table and anchors the real working
/// directory as its initial cwd. Idempotent: later calls are no-ops once
/// the table exists, matching `pmemfile_vfd_table_init`'s "called once at
/// process start" contract.
pub fn vfd_table_init() -> i64 {
    if GLOBAL_TABLE.get().is_some() {
        return 0;
    }
    let mut init_result = 0;
    GLOBAL_TABLE.get_or_init(|| {
        let table = VfdTable::new(Arc::new(LibcKernel));
        init_result = table.init();
        table
    });
    init_result
}

fn global() -> &'static VfdTable {
    GLOBAL_TABLE.get().expect("vfd_table_init() must run before any vfd_* call")
}

/// `ref(fd)`: takes a reference to `fd`'s entry, usable until a matching
/// [`vfd_unref`]. Never fails — an `fd` this table doesn't hold comes back
/// as a pass-through reference naming `fd` itself.
pub fn vfd_ref(fd: RawFd) -> VfdRef {
    global().ref_fd(fd)
}

/// `at_ref(fd)`: like [`vfd_ref`], but resolves `AT_FDCWD` to the current
/// working-directory anchor.
pub fn vfd_at_ref(fd: RawFd) -> VfdRef {
    global().at_ref(fd)
}

/// Releases a reference taken via [`vfd_ref`]/[`vfd_at_ref`].
pub fn vfd_unref(r: VfdRef) {
    global().unref(r)
}

/// `dup(old_fd)`.
pub fn vfd_dup(old_fd: RawFd) -> i64 {
    global().dup(old_fd)
}

/// `dup2(old_fd, new_fd)`.
pub fn vfd_dup2(old_fd: RawFd, new_fd: RawFd) -> i64 {
    global().dup2(old_fd, new_fd)
}

/// `close(fd)`.
pub fn vfd_close(fd: RawFd) -> i64 {
    global().close(fd)
}

/// Installs a freshly PM-opened file into a new fd, returning its number.
pub fn vfd_assign(pool: Arc<PmPool>, file: Arc<PmOpenFile>) -> i64 {
    global().assign(pool, file)
}

/// `chdir` onto a PM-resident directory.
pub fn vfd_chdir_pm(pool: Arc<PmPool>, file: Arc<PmOpenFile>) -> i64 {
    global().chdir_pm(pool, file)
}

/// `chdir` onto an already-open kernel directory fd.
pub fn vfd_chdir_kernel(fd: RawFd) -> i64 {
    global().chdir_kernel_fd(fd)
}

/// `fchdir(fd)`.
pub fn vfd_fchdir(fd: RawFd) -> i64 {
    global().fchdir(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_table_is_lazily_initialized_once() {
        // Exercised indirectly: vfd_table_init uses OnceLock, so calling it
        // twice in the same process must not reopen the cwd fd twice. We
        // can't easily assert on the real libc kernel's fd count in a unit
        // test without racing other tests that also touch the global
        // table, so this just checks the call is at least idempotent in
        // its return value shape.
        let first = vfd_table_init();
        let second = vfd_table_init();
        assert_eq!(first, 0);
        assert_eq!(second, 0);
    }
}
