//! Small helpers shared by the rest of procpipe.

use std::ops::{Deref, DerefMut};
use std::os::fd::{BorrowedFd, RawFd};

/// Exit without running destructors or atexit handlers. This is the only way out of a forked
/// child that failed to exec.
pub fn exit_without_destructors(code: libc::c_int) -> ! {
    unsafe { libc::_exit(code) };
}

/// Write a buffer to a raw fd, returning the number of bytes written.
/// This does NOT retry on EINTR or EAGAIN, it simply returns.
pub fn write_to_fd(input: &[u8], fd: RawFd) -> nix::Result<usize> {
    nix::unistd::write(unsafe { BorrowedFd::borrow_raw(fd) }, input)
}

/// A scoped manager which runs a callback on the value it holds when it goes out of scope.
///
/// The `ScopeGuard` is considered to be the exclusive owner of the passed value for the
/// duration of its lifetime. Use the guard itself (through [`Deref`] and [`DerefMut`]) to keep
/// using the value:
///
/// ```rust
/// use procpipe::common::ScopeGuard;
///
/// let mut log = ScopeGuard::new(Vec::new(), |log| log.push("goodbye"));
/// log.push("hello");
/// assert_eq!(ScopeGuard::commit(log), ["hello", "goodbye"]);
/// ```
pub struct ScopeGuard<T, F: FnOnce(&mut T)>(Option<(T, F)>);

impl<T, F: FnOnce(&mut T)> ScopeGuard<T, F> {
    /// Creates a new `ScopeGuard` wrapping `value`. The `on_drop` callback is executed when the
    /// ScopeGuard's lifetime expires or when it is manually dropped.
    pub fn new(value: T, on_drop: F) -> Self {
        Self(Some((value, on_drop)))
    }

    /// Invokes the callback and returns the wrapped value, consuming the ScopeGuard.
    pub fn commit(mut guard: Self) -> T {
        let (mut value, on_drop) = guard.0.take().expect("Should always have Some value");
        on_drop(&mut value);
        value
    }
}

impl<T, F: FnOnce(&mut T)> Deref for ScopeGuard<T, F> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0.as_ref().unwrap().0
    }
}

impl<T, F: FnOnce(&mut T)> DerefMut for ScopeGuard<T, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0.as_mut().unwrap().0
    }
}

impl<T, F: FnOnce(&mut T)> Drop for ScopeGuard<T, F> {
    fn drop(&mut self) {
        if let Some((mut value, on_drop)) = self.0.take() {
            on_drop(&mut value);
        }
    }
}

/// A trait expressing what ScopeGuard can do, so that functions may return
/// `impl ScopeGuarding` without naming the callback type.
pub trait ScopeGuarding: DerefMut {
    /// Invokes the callback and returns the wrapped value, consuming the ScopeGuard.
    fn commit(guard: Self) -> Self::Target;
}

impl<T, F: FnOnce(&mut T)> ScopeGuarding for ScopeGuard<T, F> {
    fn commit(guard: Self) -> T {
        ScopeGuard::commit(guard)
    }
}

pub const fn assert_send<T: Send>() {}
pub const fn assert_sync<T: Sync>() {}
