//! Fd registry: one entry per
//! fd the shim has ever touched, indexed by fd number like the
//! reactor's own [`crate::reactor`] fd table.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

/// Which of the two SO_*TIMEO knobs an operation consults.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TimeoutWhich {
    Recv,
    Send,
}

/// Per-fd registry entry. `user_nonblock` is what
/// the caller last set via `fcntl(F_SETFL)`/`ioctl(FIONBIO)`;
/// `system_nonblock` is the kernel-level truth, which the shim forces
/// to `true` for sockets regardless of the user's request.
pub struct FdCtx {
    fd: RawFd,
    is_socket: AtomicBool,
    system_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicI64,
    send_timeout_ms: AtomicI64,
}

impl FdCtx {
    fn probe(fd: RawFd) -> FdCtx {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut stat) } == 0 && (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let orig_flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        let orig_nonblock = orig_flags >= 0 && (orig_flags & libc::O_NONBLOCK) != 0;

        if is_socket && orig_flags >= 0 {
            unsafe {
                libc::fcntl(fd, libc::F_SETFL, orig_flags | libc::O_NONBLOCK);
            }
        }

        FdCtx {
            fd,
            is_socket: AtomicBool::new(is_socket),
            system_nonblock: AtomicBool::new(is_socket),
            user_nonblock: AtomicBool::new(orig_nonblock),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicI64::new(-1),
            send_timeout_ms: AtomicI64::new(-1),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn get_user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::SeqCst)
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::SeqCst);
    }

    pub fn get_system_nonblock(&self) -> bool {
        self.system_nonblock.load(Ordering::SeqCst)
    }

    pub(crate) fn set_system_nonblock(&self, v: bool) {
        self.system_nonblock.store(v, Ordering::SeqCst);
    }

    pub fn get_timeout(&self, which: TimeoutWhich) -> Option<u64> {
        let raw = match which {
            TimeoutWhich::Recv => self.recv_timeout_ms.load(Ordering::SeqCst),
            TimeoutWhich::Send => self.send_timeout_ms.load(Ordering::SeqCst),
        };
        if raw < 0 {
            None
        } else {
            Some(raw as u64)
        }
    }

    pub fn set_timeout(&self, which: TimeoutWhich, ms: Option<u64>) {
        let raw = ms.map(|v| v as i64).unwrap_or(-1);
        match which {
            TimeoutWhich::Recv => self.recv_timeout_ms.store(raw, Ordering::SeqCst),
            TimeoutWhich::Send => self.send_timeout_ms.store(raw, Ordering::SeqCst),
        }
    }
}

struct FdRegistry {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdRegistry {
    fn new() -> Self {
        FdRegistry { slots: RwLock::new(Vec::new()) }
    }
}

static REGISTRY: Lazy<FdRegistry> = Lazy::new(FdRegistry::new);

/// Look up (optionally creating) the registry entry for `fd`.
pub fn get(fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
    {
        let slots = REGISTRY.slots.read().unwrap();
        if let Some(Some(ctx)) = slots.get(fd as usize) {
            return Some(ctx.clone());
        }
    }
    if !auto_create {
        return None;
    }
    let mut slots = REGISTRY.slots.write().unwrap();
    let idx = fd as usize;
    if idx >= slots.len() {
        let new_len = (((idx + 1) as f64) * 1.5) as usize;
        slots.resize_with(new_len.max(idx + 1), || None);
    }
    Some(
        slots[idx]
            .get_or_insert_with(|| Arc::new(FdCtx::probe(fd)))
            .clone(),
    )
}

/// Drop the registry entry for `fd`.
pub fn del(fd: RawFd) {
    let mut slots = REGISTRY.slots.write().unwrap();
    if let Some(slot) = slots.get_mut(fd as usize) {
        *slot = None;
    }
}
