//! Transparent syscall interception: turns a
//! blocking-looking call into `register-event → yield → resume` when
//! it would otherwise block, and passes straight through to the OS
//! when hooking is disabled, the fd isn't tracked, or the caller
//! already asked for non-blocking behavior.
//!
//! Rust has no portable way to interpose on the libc symbols
//! themselves (no `LD_PRELOAD`-equivalent inside a `cargo`-built
//! binary), so the "shim" here is the explicit function surface
//! the design names (`read`, `connect`, `sleep`, …): code that wants
//! the cooperative behavior calls these instead of `std`/`libc`
//! directly, the same way mioco's `MiocoHandle` methods stand in for
//! blocking syscalls.

pub mod registry;

use std::cell::Cell;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::trace;

use crate::coroutine::Coroutine;
use crate::error::ShimError;
use crate::reactor::{Continuation, Event, IoReactor};
use registry::{FdCtx, TimeoutWhich};

pub use registry::{del as registry_del, get as registry_get};

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Enable/disable shimming on the calling OS thread. Threads that
/// don't run coroutines (and so have no `IoReactor` to suspend into)
/// should disable hooking so shimmed calls fall straight through.
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|c| c.set(enabled));
}

pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn should_bypass(ctx: Option<&Arc<FdCtx>>) -> bool {
    if !is_hook_enabled() {
        return true;
    }
    match ctx {
        None => true,
        Some(ctx) => ctx.is_closed() || !ctx.is_socket() || ctx.get_user_nonblock(),
    }
}

/// The `do_io` protocol: retry on `EINTR`; on `EAGAIN`,
/// register `event` with the current coroutine, arm an optional
/// conditional timeout, yield `HOLD`, and retry on resume.
fn do_io<F>(fd: RawFd, event: Event, which: TimeoutWhich, mut syscall: F) -> io::Result<isize>
where
    F: FnMut() -> isize,
{
    let ctx = registry::get(fd, false);
    let bypass = should_bypass(ctx.as_ref());

    loop {
        // A concurrent `close(fd)` cancels any event this call registered
        // and reschedules it here before the fd is actually released;
        // re-check rather than retrying a syscall against a fd that's
        // about to (or already did) change identity under us.
        if ctx.as_ref().is_some_and(|c| c.is_closed()) {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        let ret = syscall();
        if ret >= 0 {
            return Ok(ret);
        }
        let errno = last_errno();
        if errno == libc::EINTR {
            continue;
        }
        if bypass || (errno != libc::EAGAIN && errno != libc::EWOULDBLOCK) {
            return Err(io::Error::from_raw_os_error(errno));
        }

        let ctx = ctx.as_ref().expect("do_io: EAGAIN retry path requires a registered fd");
        let reactor = IoReactor::current().expect("do_io: EAGAIN retry path requires a running IoReactor worker");
        let timeout_ms = ctx.get_timeout(which);

        let call_guard = Arc::new(());
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = timeout_ms.map(|ms| {
            let flag = timed_out.clone();
            let reactor2 = reactor.clone();
            reactor.add_conditional_timer(
                ms,
                move || {
                    flag.store(true, Ordering::SeqCst);
                    reactor2.cancel_event(fd, event);
                },
                Arc::downgrade(&call_guard),
                false,
            )
        });

        reactor
            .add_event(fd, event, Some(Continuation::Coroutine(Coroutine::current_running())))
            .map_err(|e| {
                trace!("do_io: add_event({}, {:?}) failed: {}", fd, event, e);
                io::Error::from(ShimError::EventRegistration(fd, e))
            })?;
        Coroutine::yield_to_hold();

        if let Some(t) = &timer {
            t.cancel();
        }
        if timed_out.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
        }
        // event fired (or spurious wakeup): loop and retry the syscall.
    }
}

fn ret_usize(n: isize) -> io::Result<usize> {
    Ok(n as usize)
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, Event::Read, TimeoutWhich::Recv, || unsafe {
        libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) as isize
    })
    .and_then(ret_usize)
}

pub fn readv(fd: RawFd, iov: &mut [libc::iovec]) -> io::Result<usize> {
    do_io(fd, Event::Read, TimeoutWhich::Recv, || unsafe {
        libc::readv(fd, iov.as_ptr(), iov.len() as i32) as isize
    })
    .and_then(ret_usize)
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<usize> {
    do_io(fd, Event::Read, TimeoutWhich::Recv, || unsafe {
        libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags) as isize
    })
    .and_then(ret_usize)
}

pub fn recvfrom(fd: RawFd, buf: &mut [u8], flags: i32, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> io::Result<usize> {
    do_io(fd, Event::Read, TimeoutWhich::Recv, || unsafe {
        libc::recvfrom(fd, buf.as_mut_ptr().cast(), buf.len(), flags, addr, addrlen) as isize
    })
    .and_then(ret_usize)
}

pub fn recvmsg(fd: RawFd, msg: &mut libc::msghdr, flags: i32) -> io::Result<usize> {
    do_io(fd, Event::Read, TimeoutWhich::Recv, || unsafe { libc::recvmsg(fd, msg, flags) as isize }).and_then(ret_usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, Event::Write, TimeoutWhich::Send, || unsafe {
        libc::write(fd, buf.as_ptr().cast(), buf.len()) as isize
    })
    .and_then(ret_usize)
}

pub fn writev(fd: RawFd, iov: &[libc::iovec]) -> io::Result<usize> {
    do_io(fd, Event::Write, TimeoutWhich::Send, || unsafe {
        libc::writev(fd, iov.as_ptr(), iov.len() as i32) as isize
    })
    .and_then(ret_usize)
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> io::Result<usize> {
    do_io(fd, Event::Write, TimeoutWhich::Send, || unsafe {
        libc::send(fd, buf.as_ptr().cast(), buf.len(), flags) as isize
    })
    .and_then(ret_usize)
}

pub fn sendto(fd: RawFd, buf: &[u8], flags: i32, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> io::Result<usize> {
    do_io(fd, Event::Write, TimeoutWhich::Send, || unsafe {
        libc::sendto(fd, buf.as_ptr().cast(), buf.len(), flags, addr, addrlen) as isize
    })
    .and_then(ret_usize)
}

pub fn sendmsg(fd: RawFd, msg: &libc::msghdr, flags: i32) -> io::Result<usize> {
    do_io(fd, Event::Write, TimeoutWhich::Send, || unsafe { libc::sendmsg(fd, msg, flags) as isize }).and_then(ret_usize)
}

/// `socket(2)`: create the fd, then eagerly register it so the `is_socket` probe
/// doesn't have to happen lazily on first I/O.
pub fn socket(domain: i32, ty: i32, protocol: i32) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    registry::get(fd, true);
    Ok(fd)
}

/// `accept(2)`, shimmed like any read-class call: retried under
/// `do_io` on `EAGAIN`, registering the freshly accepted fd on
/// success.
pub fn accept(fd: RawFd, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> io::Result<RawFd> {
    let accepted = do_io(fd, Event::Read, TimeoutWhich::Recv, || unsafe { libc::accept(fd, addr, addrlen) as isize })?;
    let accepted = accepted as RawFd;
    registry::get(accepted, true);
    Ok(accepted)
}

/// `connect(2)` on an already non-blocking fd: handles the
/// `EINPROGRESS` specialization with the crate-default timeout
/// (`tcp.connect.timeout`).
pub fn connect(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> io::Result<()> {
    connect_with_timeout(fd, addr, addrlen, crate::config::connect_timeout_ms())
}

/// `connect(2)` with an explicit per-call timeout instead of the
/// configured default.
pub fn connect_with_timeout(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t, timeout_ms: u64) -> io::Result<()> {
    registry::get(fd, true);
    let rc = unsafe { libc::connect(fd, addr, addrlen) };
    if rc == 0 {
        return Ok(());
    }
    let errno = last_errno();
    if errno != libc::EINPROGRESS {
        return Err(io::Error::from_raw_os_error(errno));
    }

    let ctx = registry::get(fd, true).unwrap();
    if should_bypass(Some(&ctx)) {
        return Err(io::Error::from_raw_os_error(libc::EINPROGRESS));
    }
    let reactor = IoReactor::current().expect("connect_with_timeout requires a running IoReactor worker");

    let call_guard = Arc::new(());
    let timed_out = Arc::new(AtomicBool::new(false));
    let flag = timed_out.clone();
    let reactor2 = reactor.clone();
    let timer = reactor.add_conditional_timer(
        timeout_ms,
        move || {
            flag.store(true, Ordering::SeqCst);
            reactor2.cancel_event(fd, Event::Write);
        },
        Arc::downgrade(&call_guard),
        false,
    );

    reactor.add_event(fd, Event::Write, Some(Continuation::Coroutine(Coroutine::current_running())))?;
    Coroutine::yield_to_hold();
    timer.cancel();

    if timed_out.load(Ordering::SeqCst) {
        return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
    }

    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut err) as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

/// `close(2)`: cancel every registration on `fd` (waking suspended
/// coroutines with an error) before dropping the registry entry and
/// calling the real close.
pub fn close(fd: RawFd) -> io::Result<()> {
    if let Some(ctx) = registry::get(fd, false) {
        ctx.mark_closed();
        if let Some(reactor) = IoReactor::current() {
            reactor.cancel_all(fd);
        }
    }
    registry::del(fd);
    let rc = unsafe { libc::close(fd) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn sleep_impl(dur: Duration) {
    let reactor = IoReactor::current().expect("sleep requires a running IoReactor worker");
    let co = Coroutine::current_running();
    reactor.add_timer(
        dur.as_millis() as u64,
        move || {
            // Fired from the reactor's idle loop thread, not the
            // sleeping coroutine's: schedule it rather than resuming
            // it directly.
            if let Some(r) = IoReactor::current() {
                r.schedule_coroutine(co.clone(), None);
            }
        },
        false,
    );
    Coroutine::yield_to_hold();
}

pub fn sleep(secs: u32) -> u32 {
    sleep_impl(Duration::from_secs(secs as u64));
    0
}

pub fn usleep(usecs: u32) {
    sleep_impl(Duration::from_micros(usecs as u64));
}

pub fn nanosleep(req: &libc::timespec) {
    let dur = Duration::new(req.tv_sec as u64, req.tv_nsec as u32);
    sleep_impl(dur);
}

/// `fcntl`: only `F_GETFL`/`F_SETFL` are shimmed; the
/// kernel-level nonblock bit stays whatever the shim wants, while
/// `F_GETFL` reports what the user last asked for.
pub fn fcntl_getfl(fd: RawFd) -> io::Result<i32> {
    let real = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if real < 0 {
        return Err(io::Error::last_os_error());
    }
    match registry::get(fd, false) {
        Some(ctx) if ctx.is_socket() => {
            let mut flags = real & !libc::O_NONBLOCK;
            if ctx.get_user_nonblock() {
                flags |= libc::O_NONBLOCK;
            }
            Ok(flags)
        }
        _ => Ok(real),
    }
}

pub fn fcntl_setfl(fd: RawFd, flags: i32) -> io::Result<()> {
    match registry::get(fd, false) {
        Some(ctx) if ctx.is_socket() => {
            ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            let forced = flags | libc::O_NONBLOCK;
            let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, forced) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            ctx.set_system_nonblock(true);
            Ok(())
        }
        _ => {
            let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }
}

/// `ioctl(fd, FIONBIO, &v)`: same nonblock-lying discipline as
/// `fcntl`.
pub fn ioctl_fionbio(fd: RawFd, user_wants_nonblock: bool) -> io::Result<()> {
    match registry::get(fd, false) {
        Some(ctx) if ctx.is_socket() => {
            ctx.set_user_nonblock(user_wants_nonblock);
            Ok(())
        }
        _ => {
            let mut v: libc::c_int = user_wants_nonblock as libc::c_int;
            let rc = unsafe { libc::ioctl(fd, libc::FIONBIO, &mut v) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }
}

/// `getsockopt(SO_RCVTIMEO/SO_SNDTIMEO)`: read back the shim's
/// recorded timeout rather than the kernel's (which never has one set,
/// since the shim never installs a real `SO_*TIMEO`).
pub fn getsockopt_timeout(fd: RawFd, which: TimeoutWhich) -> io::Result<Option<u64>> {
    match registry::get(fd, false) {
        Some(ctx) => Ok(ctx.get_timeout(which)),
        None => Err(io::Error::from_raw_os_error(libc::EBADF)),
    }
}

/// `setsockopt(SO_RCVTIMEO/SO_SNDTIMEO)`: record the timeout for
/// `do_io`'s conditional timer to use; never reaches the kernel.
pub fn setsockopt_timeout(fd: RawFd, which: TimeoutWhich, ms: Option<u64>) -> io::Result<()> {
    match registry::get(fd, true) {
        ctx_opt @ Some(_) => {
            ctx_opt.unwrap().set_timeout(which, ms);
            Ok(())
        }
        None => Err(io::Error::from_raw_os_error(libc::EBADF)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_enabled_defaults_true_and_is_thread_local() {
        assert!(is_hook_enabled());
        set_hook_enabled(false);
        assert!(!is_hook_enabled());
        set_hook_enabled(true);
    }

    #[test]
    fn socket_registers_fd_as_socket() {
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        let ctx = registry::get(fd, false).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.get_system_nonblock());
        unsafe {
            libc::close(fd);
        }
        registry::del(fd);
    }

    #[test]
    fn setsockopt_then_getsockopt_timeout_round_trips() {
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        setsockopt_timeout(fd, TimeoutWhich::Recv, Some(250)).unwrap();
        assert_eq!(getsockopt_timeout(fd, TimeoutWhich::Recv).unwrap(), Some(250));
        unsafe {
            libc::close(fd);
        }
        registry::del(fd);
    }
}
