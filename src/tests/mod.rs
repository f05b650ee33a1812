mod pipe;

pub mod prelude {
    use crate::common::{ScopeGuard, ScopeGuarding};
    use once_cell::sync::OnceCell;
    use std::os::fd::RawFd;
    use std::sync::mpsc;
    use std::time::Duration;

    pub use serial_test::serial;

    /// How long a test waits for something that should finish promptly.
    pub const LONG_TIMEOUT: Duration = Duration::from_secs(30);

    /// How long a test waits for something that should never finish.
    pub const SHORT_TIMEOUT: Duration = Duration::from_millis(300);

    pub fn test_init() -> impl ScopeGuarding<Target = ()> {
        static DONE: OnceCell<()> = OnceCell::new();
        DONE.get_or_init(|| {
            crate::flog::init_from_env();
        });
        ScopeGuard::new((), |()| {})
    }

    /// The descriptors open in this process. Only meaningful in `#[serial]` tests, since other
    /// tests open descriptors concurrently.
    pub fn open_fds() -> Vec<RawFd> {
        crate::fds::lsof().unwrap()
    }

    /// Run `f` on its own thread. The receiver yields its result; receive with a timeout to
    /// detect a hang.
    pub fn in_background<T, F>(f: F) -> mpsc::Receiver<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(f());
        });
        rx
    }
}
