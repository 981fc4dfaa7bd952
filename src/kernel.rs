use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

/// Forwards VFD-table operations to the kernel.
///
/// `LibcKernel` issues the equivalent `libc` calls directly rather than
/// going through a ptrace/seccomp interception shim — that shim is the
/// external collaborator this spec keeps out of scope; this trait is the
/// boundary it would sit behind. Every method returns a `long`-shaped
/// result: non-negative on success, `-errno` on failure, matching the
/// `kernel(call, args…) -> long` primitive the VFD table is specified
/// against.
pub trait KernelOps: Send + Sync {
    /// `SYS_dup`.
    fn dup(&self, fd: RawFd) -> i64;
    /// `SYS_dup2`.
    fn dup2(&self, old_fd: RawFd, new_fd: RawFd) -> i64;
    /// `SYS_close`.
    fn close(&self, fd: RawFd) -> i64;
    /// `open(".", O_DIRECTORY | O_RDONLY)`, used once at startup to anchor
    /// the initial CWD.
    fn open_cwd(&self) -> i64;
    /// `SYS_fchdir`.
    fn fchdir(&self, fd: RawFd) -> i64;
    /// `SYS_memfd_create`, used to reserve a placeholder fd for a
    /// PM-backed vfd number. The name argument is cosmetic (the kernel
    /// truncates long names), so callers don't need to pick one carefully.
    fn memfd_create(&self) -> i64;
    /// `open("/dev/null", O_RDONLY)`, the fallback placeholder when
    /// `memfd_create` is unavailable or fails.
    fn open_dev_null(&self) -> i64;
}

/// Mirrors the reference implementation's `acquire_new_fd`: prefer
/// `memfd_create` for the placeholder fd a PM-backed vfd number needs,
/// falling back to `/dev/null` when it's unavailable (e.g. an old kernel)
/// or fails for some other reason.
pub(crate) fn acquire_placeholder_fd(kernel: &dyn KernelOps) -> i64 {
    let fd = kernel.memfd_create();
    if fd >= 0 {
        fd
    } else {
        kernel.open_dev_null()
    }
}

fn errno_neg() -> i64 {
    -(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) as i64)
}

/// Forwards straight to the kernel via `libc`.
pub struct LibcKernel;

impl KernelOps for LibcKernel {
    fn dup(&self, fd: RawFd) -> i64 {
        let r = unsafe { libc::dup(fd) };
        if r < 0 {
            errno_neg()
        } else {
            r as i64
        }
    }

    fn dup2(&self, old_fd: RawFd, new_fd: RawFd) -> i64 {
        let r = unsafe { libc::dup2(old_fd, new_fd) };
        if r < 0 {
            errno_neg()
        } else {
            r as i64
        }
    }

    fn close(&self, fd: RawFd) -> i64 {
        let r = unsafe { libc::close(fd) };
        if r < 0 {
            errno_neg()
        } else {
            0
        }
    }

    fn open_cwd(&self) -> i64 {
        let path = b".\0".as_ptr() as *const libc::c_char;
        let r = unsafe { libc::open(path, libc::O_DIRECTORY | libc::O_RDONLY) };
        if r < 0 {
            errno_neg()
        } else {
            r as i64
        }
    }

    fn fchdir(&self, fd: RawFd) -> i64 {
        let r = unsafe { libc::fchdir(fd) };
        if r < 0 {
            errno_neg()
        } else {
            0
        }
    }

    fn memfd_create(&self) -> i64 {
        let name = b"pmvfs\0".as_ptr() as *const libc::c_char;
        let r = unsafe { libc::syscall(libc::SYS_memfd_create, name, 0) };
        if r < 0 {
            errno_neg()
        } else {
            r
        }
    }

    fn open_dev_null(&self) -> i64 {
        let path = b"/dev/null\0".as_ptr() as *const libc::c_char;
        let r = unsafe { libc::open(path, libc::O_RDONLY) };
        if r < 0 {
            errno_neg()
        } else {
            r as i64
        }
    }
}

/// In-memory stand-in for the kernel.
///
/// Used by tests so the VFD-table stress scenarios (chained `dup`,
/// million-iteration `chdir` races) don't burn real kernel file
/// descriptors or run into the process's open-file limit.
pub struct FakeKernel {
    inner: Mutex<FakeKernelInner>,
    memfd_enabled: bool,
}

struct FakeKernelInner {
    open: HashSet<RawFd>,
}

impl FakeKernel {
    pub fn new() -> Self {
        FakeKernel {
            inner: Mutex::new(FakeKernelInner {
                open: HashSet::new(),
            }),
            memfd_enabled: true,
        }
    }

    /// A `FakeKernel` whose `memfd_create` always fails, forcing
    /// `acquire_placeholder_fd` through the `/dev/null` fallback — the path
    /// spec.md's design notes call out for names exceeding the kernel's
    /// memfd length limit.
    pub fn with_memfd_disabled() -> Self {
        FakeKernel {
            inner: Mutex::new(FakeKernelInner {
                open: HashSet::new(),
            }),
            memfd_enabled: false,
        }
    }

    /// Lowest fd not currently open, like a real kernel's fd allocator —
    /// tests that close a low-numbered fd and reassign expect to get that
    /// same number back.
    fn alloc(&self, inner: &mut FakeKernelInner) -> RawFd {
        let mut fd = 3;
        while inner.open.contains(&fd) {
            fd += 1;
        }
        inner.open.insert(fd);
        fd
    }
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelOps for FakeKernel {
    fn dup(&self, fd: RawFd) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open.contains(&fd) {
            return -(libc::EBADF as i64);
        }
        self.alloc(&mut inner) as i64
    }

    fn dup2(&self, old_fd: RawFd, new_fd: RawFd) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open.contains(&old_fd) {
            return -(libc::EBADF as i64);
        }
        if old_fd == new_fd {
            return new_fd as i64;
        }
        inner.open.insert(new_fd);
        new_fd as i64
    }

    fn close(&self, fd: RawFd) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        if inner.open.remove(&fd) {
            0
        } else {
            -(libc::EBADF as i64)
        }
    }

    fn open_cwd(&self) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        self.alloc(&mut inner) as i64
    }

    fn fchdir(&self, fd: RawFd) -> i64 {
        let inner = self.inner.lock().unwrap();
        if inner.open.contains(&fd) {
            0
        } else {
            -(libc::EBADF as i64)
        }
    }

    fn memfd_create(&self) -> i64 {
        if !self.memfd_enabled {
            return -(libc::ENOSYS as i64);
        }
        let mut inner = self.inner.lock().unwrap();
        self.alloc(&mut inner) as i64
    }

    fn open_dev_null(&self) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        self.alloc(&mut inner) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_kernel_dup_of_unopened_fd_is_ebadf() {
        let k = FakeKernel::new();
        assert_eq!(k.dup(999), -(libc::EBADF as i64));
    }

    #[test]
    fn fake_kernel_dup_then_close_then_fchdir_fails() {
        let k = FakeKernel::new();
        let fd = k.open_cwd();
        assert!(fd >= 0);
        let dup_fd = k.dup(fd as RawFd);
        assert!(dup_fd >= 0);
        assert_eq!(k.close(dup_fd as RawFd), 0);
        assert_eq!(k.fchdir(dup_fd as RawFd), -(libc::EBADF as i64));
    }

    #[test]
    fn fake_kernel_dup2_reuses_requested_number() {
        let k = FakeKernel::new();
        let fd = k.open_cwd();
        assert_eq!(k.dup2(fd as RawFd, 50), 50);
        assert_eq!(k.fchdir(50), 0);
    }

    #[test]
    fn acquire_placeholder_fd_prefers_memfd_create() {
        let k = FakeKernel::new();
        let fd = acquire_placeholder_fd(&k);
        assert!(fd >= 0);
    }

    #[test]
    fn acquire_placeholder_fd_falls_back_to_dev_null_when_memfd_disabled() {
        let k = FakeKernel::with_memfd_disabled();
        assert_eq!(k.memfd_create(), -(libc::ENOSYS as i64));
        let fd = acquire_placeholder_fd(&k);
        assert!(fd >= 0, "the /dev/null fallback must still produce a usable fd");
    }
}
