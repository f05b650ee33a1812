//! Background threads used to feed and drain pipes while a child process runs.

use crate::common::ScopeGuard;
use crate::flog::{FloggableDebug, FLOG};
use std::io;
use std::mem::MaybeUninit;
use std::thread::JoinHandle;

impl FloggableDebug for std::thread::ThreadId {}

/// Spawn a named thread running `callback`.
///
/// The spawned thread inherits our signal mask. Temporarily block signals, spawn the thread, and
/// then restore it, so that signals aimed at this process are never delivered to a pipe worker.
/// But we must not block SIGBUS, SIGFPE, SIGILL, or SIGSEGV; that's undefined. Conservatively
/// don't try to mask SIGKILL or SIGSTOP either.
pub fn spawn<T, F>(name: &str, callback: F) -> io::Result<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let saved_set = unsafe {
        let mut new_set = MaybeUninit::uninit();
        let new_set = new_set.as_mut_ptr();
        libc::sigfillset(new_set);
        libc::sigdelset(new_set, libc::SIGILL); // bad jump
        libc::sigdelset(new_set, libc::SIGFPE); // divide-by-zero
        libc::sigdelset(new_set, libc::SIGBUS); // unaligned memory access
        libc::sigdelset(new_set, libc::SIGSEGV); // bad memory access
        libc::sigdelset(new_set, libc::SIGSTOP); // unblockable
        libc::sigdelset(new_set, libc::SIGKILL); // unblockable

        let mut saved_set: libc::sigset_t = std::mem::zeroed();
        let result = libc::pthread_sigmask(libc::SIG_BLOCK, new_set, &mut saved_set as *mut _);
        assert_eq!(result, 0, "Failed to override thread signal mask!");
        saved_set
    };
    // Restore our sigmask whichever way we leave.
    let _restore = ScopeGuard::new(saved_set, |saved_set| unsafe {
        let result =
            libc::pthread_sigmask(libc::SIG_SETMASK, saved_set as *const _, std::ptr::null_mut());
        assert_eq!(result, 0, "Failed to restore thread signal mask!");
    });

    match std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(callback)
    {
        Ok(handle) => {
            FLOG!(iothread, "thread", name, handle.thread().id(), "spawned");
            Ok(handle)
        }
        Err(err) => {
            FLOG!(error, "thread spawn failure:", err);
            Err(err)
        }
    }
}

/// A unit of work owned by whoever started it, run on its own thread.
///
/// The task starts running in [`BackgroundTask::start`], before the caller's next statement, and
/// its outcome is collected exactly once with [`BackgroundTask::join`].
pub struct BackgroundTask<T> {
    name: String,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> BackgroundTask<T> {
    pub fn start<F>(name: &str, work: F) -> io::Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let handle = spawn(name, work)?;
        Ok(BackgroundTask {
            name: name.to_owned(),
            handle: Some(handle),
        })
    }

    /// Whether the work has finished. Never blocks.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Block until the work is done and return its outcome.
    /// Returns None if it was already joined.
    /// A panic on the task is surfaced as an error rather than propagated.
    pub fn join(&mut self) -> Option<io::Result<T>> {
        let handle = self.handle.take()?;
        let res = handle.join().map_err(|_| {
            FLOG!(error, "background task", self.name, "panicked");
            io::Error::new(
                io::ErrorKind::Other,
                format!("background task {} panicked", self.name),
            )
        });
        FLOG!(iothread, "joined", self.name);
        Some(res)
    }
}

impl<T> Drop for BackgroundTask<T> {
    fn drop(&mut self) {
        // Dropping the handle detaches the thread; it finishes on its own once its pipe closes.
        if self.handle.is_some() {
            FLOG!(iothread, "detaching", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BackgroundTask;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_task_result_and_single_join() {
        let mut task = BackgroundTask::start("adder", || 1 + 2).unwrap();
        assert_eq!(task.join().unwrap().unwrap(), 3);
        assert!(task.join().is_none());
        assert!(task.is_finished());
    }

    #[test]
    fn test_task_starts_before_join() {
        let (tx, rx) = mpsc::channel();
        let mut task = BackgroundTask::start("sender", move || tx.send(42).unwrap()).unwrap();
        // The task runs without anyone joining it.
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)), Ok(42));
        task.join().unwrap().unwrap();
    }

    #[test]
    fn test_task_panic_is_an_error() {
        let mut task = BackgroundTask::start("panicker", || -> u8 { panic!("boom") }).unwrap();
        assert!(task.join().unwrap().is_err());
    }
}
