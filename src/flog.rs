use crate::common::write_to_fd;
use libc::c_int;
use std::sync::atomic::{AtomicI32, Ordering};

/// The environment variable holding a category pattern applied by [`init_from_env`].
pub const DEBUG_VAR: &str = "PROCPIPE_DEBUG";

#[rustfmt::skip::macros(category)]
pub mod categories {
    use std::sync::atomic::AtomicBool;

    pub struct category_t {
        pub name: &'static str,
        pub description: &'static str,
        pub enabled: AtomicBool,
    }

    /// Macro to declare a static variable identified by $var,
    /// with the given name and description, and optionally enabled by default.
    macro_rules! declare_category {
        (
            ($var:ident, $name:literal, $description:literal, $enabled:expr)
        ) => {
            pub static $var: category_t = category_t {
                name: $name,
                description: $description,
                enabled: AtomicBool::new($enabled),
            };
        };
        (
            ($var:ident, $name:expr, $description:expr)
        ) => {
            declare_category!(($var, $name, $description, false));
        };
    }

    /// Macro to extract the variable name for a category.
    macro_rules! category_name {
        (($var:ident, $name:literal, $description:literal, $enabled:expr)) => {
            $var
        };
        (($var:ident, $name:literal, $description:literal)) => {
            $var
        };
    }

    macro_rules! categories {
        (
            // A repetition of categories, separated by semicolons.
            $($cats:tt);*

            // Allow trailing semicolon.
            $(;)?
        ) => {
            $(
                declare_category!($cats);
            )*

            pub fn all_categories() -> Vec<&'static category_t> {
                vec![
                    $(
                        & category_name!($cats),
                    )*
                ]
            }
        };
    }

    categories!(
        (error, "error", "Serious unexpected errors (on by default)", true);

        (warning, "warning", "Warnings (on by default)", true);

        (exec, "exec", "Commands that failed to start");

        (exec_fork, "exec-fork", "Calls to fork()");

        (spawn, "spawn", "Spawn backend selection and fallback");

        (pipe, "pipe", "Pipe creation, writers and readers");

        (iothread, "iothread", "Background writer and reader threads");

        (proc_reap, "proc-reap", "Reaping child processes");
    );
}

/// FLOG formats values. By default we would like to use Display, and fall back to Debug.
/// However that would require specialization. So instead we make two "separate" traits, bring them both in scope,
/// and let Rust figure it out.
/// Clients can opt a Debug type into Floggable by implementing FloggableDebug:
///    impl FloggableDebug for MyType {}
pub trait FloggableDisplay {
    /// Return a string representation of this thing.
    fn to_flog_str(&self) -> String;
}

impl<T: std::fmt::Display> FloggableDisplay for T {
    fn to_flog_str(&self) -> String {
        self.to_string()
    }
}

pub trait FloggableDebug: std::fmt::Debug {
    fn to_flog_str(&self) -> String {
        format!("{:?}", self)
    }
}

/// Write to our FLOG file.
pub fn flog_impl(s: &str) {
    let fd = get_flog_file_fd();
    if fd < 0 {
        return;
    }
    let _ = write_to_fd(s.as_bytes(), fd);
}

/// The entry point for flogging.
#[macro_export]
macro_rules! FLOG {
    ($category:ident, $($elem:expr),+ $(,)*) => {
        if $crate::flog::categories::$category.enabled.load(std::sync::atomic::Ordering::Relaxed) {
            #[allow(unused_imports)]
            use $crate::flog::{FloggableDisplay, FloggableDebug};
            let mut vs = vec![format!("{}:", $crate::flog::categories::$category.name)];
            $(
                {
                   vs.push($elem.to_flog_str())
                }
            )+
            // We don't use locking here so we have to append our own newline to avoid multiple writes.
            let mut v = vs.join(" ");
            v.push('\n');
            $crate::flog::flog_impl(&v);
        }
    };
}

pub use FLOG;

/// Match `s` against a glob supporting `*` and `?`.
fn wildcard_match(s: &str, pattern: &str) -> bool {
    let s: Vec<char> = s.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    let (mut si, mut pi) = (0, 0);
    // Position of the last '*' and the string index it was tried against.
    let mut backtrack: Option<(usize, usize)> = None;
    while si < s.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == s[si]) {
            si += 1;
            pi += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, si));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            si = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// For each category, if its name matches the wildcard, set its enabled to the given sense.
/// Return whether any category matched.
fn apply_one_wildcard(wc: &str, sense: bool) -> bool {
    let mut match_found = false;
    for cat in categories::all_categories() {
        if wildcard_match(cat.name, wc) {
            cat.enabled.store(sense, Ordering::Relaxed);
            match_found = true;
        }
    }
    if !match_found {
        FLOG!(warning, "Failed to match debug category:", wc);
    }
    match_found
}

/// Set the active flog categories according to the given wildcard `wc`.
/// A leading '-' disables the matching categories instead.
pub fn activate_flog_categories_by_pattern(wc: &str) {
    // Normalize underscores to dashes, allowing the user to be sloppy.
    let wc = wc.replace('_', "-");
    for s in wc.split(',').filter(|s| !s.is_empty()) {
        if let Some(negated) = s.strip_prefix('-') {
            apply_one_wildcard(negated, false);
        } else {
            apply_one_wildcard(s, true);
        }
    }
}

/// Apply the category pattern from [`DEBUG_VAR`], if set.
pub fn init_from_env() {
    if let Some(pattern) = std::env::var_os(DEBUG_VAR) {
        activate_flog_categories_by_pattern(&pattern.to_string_lossy());
    }
}

/// The flog output fd. Defaults to stderr. A value < 0 disables flog.
static FLOG_FD: AtomicI32 = AtomicI32::new(libc::STDERR_FILENO);

pub fn set_flog_file_fd(fd: c_int) {
    FLOG_FD.store(fd, Ordering::Relaxed);
}

#[inline]
pub fn get_flog_file_fd() -> c_int {
    FLOG_FD.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::{
        activate_flog_categories_by_pattern, categories, get_flog_file_fd, set_flog_file_fd,
        wildcard_match,
    };
    use crate::pipe::Pipe;
    use crate::tests::prelude::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("exec-fork", "exec*"));
        assert!(wildcard_match("exec", "exec*"));
        assert!(wildcard_match("pipe", "p?pe"));
        assert!(wildcard_match("proc-reap", "*reap"));
        assert!(!wildcard_match("spawn", "exec*"));
        assert!(!wildcard_match("exec", "exec?"));
        assert!(wildcard_match("anything", "*"));
    }

    #[test]
    #[serial]
    fn test_activate_by_pattern() {
        let _cleanup = test_init();
        let fork = &categories::exec_fork;
        let spawn = &categories::spawn;
        activate_flog_categories_by_pattern("exec_*,spawn");
        assert!(fork.enabled.load(Ordering::Relaxed));
        assert!(spawn.enabled.load(Ordering::Relaxed));
        activate_flog_categories_by_pattern("-exec-fork,-spawn");
        assert!(!fork.enabled.load(Ordering::Relaxed));
        assert!(!spawn.enabled.load(Ordering::Relaxed));
        // Default-on categories survive.
        assert!(categories::error.enabled.load(Ordering::Relaxed));
    }

    #[test]
    #[serial]
    fn test_flog_to_fd() {
        let _cleanup = test_init();
        let mut pipe = Pipe::new().unwrap();
        let saved = get_flog_file_fd();
        set_flog_file_fd(pipe.write_fd().raw().unwrap());
        FLOG!(warning, "flogged into a pipe:", 42);
        set_flog_file_fd(-1);
        FLOG!(warning, "dropped");
        set_flog_file_fd(saved);
        drop(pipe.take_write_fd());
        let out = String::from_utf8(pipe.read().unwrap()).unwrap();
        assert!(out.contains("warning: flogged into a pipe: 42\n"));
        assert!(!out.contains("dropped"));
    }
}
