//! Process-wide session state.
//!
//! `chdir`, `setenv` and `setumask` exist so a resident worker behaves like
//! a short-lived invocation launched from the client's shell. Isolation
//! between sessions comes from the process boundary, so these are plain
//! mutations of global state, confined to this module.

use std::collections::HashSet;
use std::env;
use std::ffi::OsString;
use std::io;
use std::path::Path;

use nix::sys::stat::{Mode, umask};

use hearth_common::protocol::split_nul_strings;

pub fn chdir(path: &Path) -> io::Result<()> {
    env::set_current_dir(path)
}

/// Replace the whole environment with `vars`. Variables not in the new set
/// are removed, so a client that unset something sees it unset here too.
///
/// The worker has no other threads while the session sits between
/// commands, which is the only time this runs; that is what makes the
/// edition-2024 unsafety of `set_var`/`remove_var` sound.
#[allow(unsafe_code)]
pub fn set_environment(vars: &[(String, String)]) {
    let incoming: HashSet<&str> = vars.iter().map(|(k, _)| k.as_str()).collect();
    let stale: Vec<OsString> = env::vars_os()
        .map(|(k, _)| k)
        .filter(|k| k.to_str().is_none_or(|s| !incoming.contains(s)))
        .collect();
    // SAFETY: single threaded at this point, no concurrent env access
    unsafe {
        for key in stale {
            env::remove_var(key);
        }
        for (key, value) in vars {
            env::set_var(key, value);
        }
    }
}

/// Install a new umask and return the previous one.
pub fn set_umask(mask: u32) -> u32 {
    umask(Mode::from_bits_truncate(mask as nix::libc::mode_t)).bits() as u32
}

/// Decode the NUL-separated `k=v` payload of `setenv`. Entries without a
/// `=` or with an empty name are dropped rather than trusted.
pub fn parse_env_block(data: &[u8]) -> Vec<(String, String)> {
    split_nul_strings(data)
        .into_iter()
        .filter_map(|item| {
            let (k, v) = item.split_once('=')?;
            if k.is_empty() {
                return None;
            }
            Some((k.to_owned(), v.to_owned()))
        })
        .collect()
}
