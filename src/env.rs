//! The environment handed to a child process.
//!
//! Children get exactly the variables in their [`Env`]. Nothing is inherited from our own
//! environment unless asked for with [`Env::inherit`].

use crate::null_terminated_array::OwningNullTerminatedArray;
use std::collections::BTreeMap;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

/// Search path used for program lookup when neither the child's environment nor ours has one.
pub const DEFAULT_PATH: &str = "/usr/bin:/bin";

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Env {
    vars: BTreeMap<OsString, OsString>,
}

impl Env {
    /// An empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of our own environment.
    pub fn inherit() -> Self {
        std::env::vars_os().collect()
    }

    pub fn set(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> &mut Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.set(key, value);
        self
    }

    pub fn remove(&mut self, key: impl AsRef<OsStr>) -> Option<OsString> {
        self.vars.remove(key.as_ref())
    }

    pub fn get(&self, key: impl AsRef<OsStr>) -> Option<&OsStr> {
        self.vars.get(key.as_ref()).map(|v| v.as_os_str())
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    /// The search path for programs: ours if set, else our process's, else [`DEFAULT_PATH`].
    pub fn search_path(&self) -> OsString {
        self.get("PATH")
            .map(OsStr::to_owned)
            .or_else(|| std::env::var_os("PATH"))
            .unwrap_or_else(|| DEFAULT_PATH.into())
    }

    /// Export as `KEY=VALUE` strings. Entries whose key contains '=' or whose key or value
    /// contains NUL cannot be represented and are skipped.
    pub fn export(&self) -> OwningNullTerminatedArray {
        let strings = self
            .iter()
            .filter(|(k, _)| !k.is_empty() && !k.as_bytes().contains(&b'='))
            .filter_map(|(k, v)| {
                let mut entry = k.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(v.as_bytes());
                CString::new(entry).ok()
            })
            .collect();
        OwningNullTerminatedArray::new(strings)
    }
}

impl<K: Into<OsString>, V: Into<OsString>> FromIterator<(K, V)> for Env {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Env {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Env;
    use std::ffi::OsStr;

    #[test]
    fn test_empty_by_default() {
        let env = Env::default();
        assert!(env.is_empty());
        assert!(env.export().is_empty());
    }

    #[test]
    fn test_export() {
        let env = Env::new().with("B", "2").with("A", "1").with("BAD=KEY", "x");
        let exported: Vec<_> = env
            .export()
            .iter()
            .map(|s| s.to_str().unwrap().to_owned())
            .collect();
        assert_eq!(exported, ["A=1", "B=2"]);
    }

    #[test]
    fn test_search_path_prefers_child_env() {
        let env = Env::new().with("PATH", "/opt/bin");
        assert_eq!(env.search_path(), OsStr::new("/opt/bin"));
    }

    #[test]
    fn test_inherit_snapshot() {
        let mut env = Env::inherit();
        assert_eq!(env.len(), std::env::vars_os().count());
        if let Some(path) = std::env::var_os("PATH") {
            assert_eq!(env.remove("PATH"), Some(path));
            assert_eq!(env.get("PATH"), None);
        }
    }
}
