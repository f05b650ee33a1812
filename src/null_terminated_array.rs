//! argv/envp arrays for exec and posix_spawn, built before forking so the child never allocates.

use crate::common::{assert_send, assert_sync};
use std::ffi::{c_char, CStr, CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::pin::Pin;
use std::ptr;

/// A container which exposes a null-terminated array of pointers to strings that it owns.
pub struct OwningNullTerminatedArray {
    // `pointers` points into the pinned strings, so they must never move.
    strings: Pin<Box<[CString]>>,
    pointers: Box<[*const c_char]>,
}

/// Safety: the pointers only ever point into `strings`, which is immutable.
unsafe impl Send for OwningNullTerminatedArray {}
unsafe impl Sync for OwningNullTerminatedArray {}

const _: () = assert_send::<OwningNullTerminatedArray>();
const _: () = assert_sync::<OwningNullTerminatedArray>();

impl OwningNullTerminatedArray {
    /// Construct, taking ownership of a list of strings.
    pub fn new(strs: Vec<CString>) -> Self {
        let strings = Pin::new(strs.into_boxed_slice());
        let mut pointers = Vec::with_capacity(strings.len() + 1);
        pointers.extend(strings.iter().map(|s| s.as_ptr()));
        pointers.push(ptr::null());
        OwningNullTerminatedArray {
            strings,
            pointers: pointers.into_boxed_slice(),
        }
    }

    /// Construct from OS strings, failing if any contains an interior NUL.
    pub fn from_os_strs<S: AsRef<OsStr>>(strs: &[S]) -> Option<Self> {
        let strings = strs
            .iter()
            .map(|s| CString::new(s.as_ref().as_bytes()).ok())
            .collect::<Option<Vec<_>>>()?;
        Some(Self::new(strings))
    }

    /// Return the list of pointers, appropriate for envp or argv.
    /// We freely give out mutable pointers even though we are not mut; this is because the C
    /// interfaces expect the array to be mutable even though they do not mutate it.
    pub fn get(&self) -> *const *mut c_char {
        self.pointers.as_ptr().cast()
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CStr> {
        self.strings.iter().map(|s| s.as_c_str())
    }
}

#[cfg(test)]
mod tests {
    use super::OwningNullTerminatedArray;
    use std::ffi::{CStr, CString, OsStr};
    use std::os::unix::ffi::OsStrExt;
    use std::ptr;

    #[test]
    fn test_owning_null_terminated_array() {
        let owned_strs = vec![CString::new("foo").unwrap(), CString::new("bar").unwrap()];
        let arr = OwningNullTerminatedArray::new(owned_strs);
        let ptr = arr.get();
        unsafe {
            assert_eq!(CStr::from_ptr(*ptr).to_str().unwrap(), "foo");
            assert_eq!(CStr::from_ptr(*ptr.add(1)).to_str().unwrap(), "bar");
            assert_eq!(*ptr.add(2), ptr::null_mut());
        }
        assert_eq!(arr.len(), 2);
        let mut iter = arr.iter();
        assert_eq!(iter.next().map(|s| s.to_str().unwrap()), Some("foo"));
        assert_eq!(iter.next().map(|s| s.to_str().unwrap()), Some("bar"));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_from_os_strs() {
        let arr = OwningNullTerminatedArray::from_os_strs(&["echo", "hi"]).unwrap();
        assert_eq!(arr.len(), 2);
        let nul = OsStr::from_bytes(b"a\0b");
        assert!(OwningNullTerminatedArray::from_os_strs(&[nul]).is_none());
        let empty: [&str; 0] = [];
        let arr = OwningNullTerminatedArray::from_os_strs(&empty).unwrap();
        assert!(arr.is_empty());
        assert_eq!(unsafe { *arr.get() }, ptr::null_mut());
    }
}
