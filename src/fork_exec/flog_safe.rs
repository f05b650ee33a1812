//! FLOG for a forked child that has not exec'd yet: no allocation, no locks.

use std::ffi::CStr;

/// Room for any i32 in decimal, sign included.
pub struct IntBuf([u8; 12]);

impl IntBuf {
    pub const fn new() -> Self {
        IntBuf([0; 12])
    }

    fn format(&mut self, val: i32) -> &[u8] {
        let mut rest = val.unsigned_abs();
        let mut start = self.0.len();
        loop {
            start -= 1;
            self.0[start] = b'0' + (rest % 10) as u8;
            rest /= 10;
            if rest == 0 {
                break;
            }
        }
        if val < 0 {
            start -= 1;
            self.0[start] = b'-';
        }
        &self.0[start..]
    }
}

/// Something a child may log between fork and exec.
pub trait AsyncSafeBytes {
    fn async_safe_bytes<'a>(&'a self, buf: &'a mut IntBuf) -> &'a [u8];
}

impl AsyncSafeBytes for &str {
    fn async_safe_bytes<'a>(&'a self, _buf: &'a mut IntBuf) -> &'a [u8] {
        self.as_bytes()
    }
}

impl AsyncSafeBytes for &CStr {
    fn async_safe_bytes<'a>(&'a self, _buf: &'a mut IntBuf) -> &'a [u8] {
        self.to_bytes()
    }
}

impl AsyncSafeBytes for i32 {
    fn async_safe_bytes<'a>(&'a self, buf: &'a mut IntBuf) -> &'a [u8] {
        buf.format(*self)
    }
}

/// Write one piece of a log line with a single write(2). Errors are dropped.
pub fn write_async_safe(fd: i32, piece: impl AsyncSafeBytes) {
    if fd < 0 {
        return;
    }
    let mut buf = IntBuf::new();
    let bytes = piece.async_safe_bytes(&mut buf);
    unsafe {
        let _ = libc::write(fd, bytes.as_ptr().cast(), bytes.len());
    }
}

/// Like FLOG, for use after fork(). Pieces are written back to back with no separator.
macro_rules! FLOG_SAFE {
    ($category:ident, $($elem:expr),+ $(,)*) => {
        if crate::flog::categories::$category
            .enabled
            .load(std::sync::atomic::Ordering::Relaxed)
        {
            use crate::fork_exec::flog_safe::write_async_safe;
            let fd = crate::flog::get_flog_file_fd();
            write_async_safe(fd, crate::flog::categories::$category.name);
            write_async_safe(fd, ": ");
            $(
                write_async_safe(fd, $elem);
            )+
            write_async_safe(fd, "\n");
        }
    };
}

pub(crate) use FLOG_SAFE;

#[cfg(test)]
mod tests {
    use super::{AsyncSafeBytes, IntBuf};
    use std::ffi::CStr;

    #[test]
    fn test_errno_formatting() {
        for val in [0, 7, -7, 10, 127, -4096, i32::MAX, i32::MIN] {
            let mut buf = IntBuf::new();
            assert_eq!(val.async_safe_bytes(&mut buf), val.to_string().as_bytes());
        }
    }

    #[test]
    fn test_program_name_bytes() {
        let mut buf = IntBuf::new();
        let program = CStr::from_bytes_with_nul(b"/usr/bin/tr\0").unwrap();
        assert_eq!(program.async_safe_bytes(&mut buf), b"/usr/bin/tr");
        assert_eq!("errno ".async_safe_bytes(&mut buf), b"errno ");
    }
}
