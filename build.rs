#![allow(clippy::uninlined_format_args)]

use rsconf::Target;
use std::error::Error;

fn main() {
    rsconf::rebuild_if_paths_changed(&["src", "Cargo.toml", "build.rs"]);

    let mut build = cc::Build::new();
    // Add to the default library search path
    build.flag_if_supported("-L/usr/local/lib/");
    rsconf::add_library_search_path("/usr/local/lib");
    let mut target = Target::new_from(build).unwrap();
    target.set_verbose(true);
    detect_cfgs(&mut target);
}

/// Check target system support for the spawn and pipe primitives when the build is invoked.
///
/// We use [`rsconf::declare_cfg()`] rather than cargo features: these describe what the platform
/// supports, not something a user would reasonably toggle.
#[rustfmt::skip]
fn detect_cfgs(target: &mut Target) {
    for (name, handler) in [
        // Ignore the first entry, it just sets up the type inference.
        (
            "",
            &(|_: &Target| Ok(false)) as &dyn Fn(&Target) -> Result<bool, Box<dyn Error>>,
        ),
        ("have_posix_spawn", &|target| {
            Ok(target.has_header("spawn.h"))
        }),
        ("have_pipe2", &|target| {
            Ok(target.has_symbol("pipe2"))
        }),
    ] {
        if name.is_empty() {
            continue;
        }
        match handler(target) {
            Err(e) => {
                rsconf::warn!("{}: {}", name, e);
                rsconf::declare_cfg(name, false);
            },
            Ok(enabled) => rsconf::declare_cfg(name, enabled),
        }
    }
}
