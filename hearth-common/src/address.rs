//! Socket addressing.
//!
//! Servers listen on hash-qualified paths (`<base>-<confighash>`) and keep
//! the plain base path as a symlink to the preferred one. Clients that know
//! their config hash dial the qualified path directly; everything else
//! follows the symlink.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Hash-qualified socket path for `base`.
///
/// The basename is cut at its first `.` so a server can bind
/// `server.tmp<pid>` and atomically rename into place; the temp name and the
/// final name then map to the same qualified path.
pub fn hash_address(base: &Path, confighash: &str) -> PathBuf {
    let name = match base.file_name() {
        Some(n) => n.to_string_lossy().into_owned(),
        None => String::new(),
    };
    let stem = match name.split_once('.') {
        Some((stem, _)) => stem,
        None => name.as_str(),
    };
    let qualified = format!("{stem}-{confighash}");
    match base.parent() {
        Some(dir) => dir.join(qualified),
        None => PathBuf::from(qualified),
    }
}

/// The base socket address: explicit config, else the per-user runtime
/// directory, else a per-user directory under the system temp dir.
pub fn default_base_address(config: &Config) -> PathBuf {
    if let Some(path) = config.socket_path() {
        return path;
    }
    let dir = match dirs::runtime_dir() {
        Some(runtime) => runtime.join("hearth"),
        None => {
            let user = std::env::var("USER")
                .or_else(|_| std::env::var("LOGNAME"))
                .unwrap_or_else(|_| "default".to_owned());
            std::env::temp_dir().join(format!("hearth-{user}"))
        }
    };
    dir.join("server")
}

/// Create the socket directory with owner-only permissions. Unix sockets
/// are access-controlled through their directory.
pub fn prepare_socket_dir(base: &Path) -> io::Result<()> {
    if let Some(dir) = base.parent() {
        fs::create_dir_all(dir)?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_path_appends_the_hash() {
        assert_eq!(
            hash_address(Path::new("/run/user/hearth/server"), "0a1b2c3d4e5f"),
            PathBuf::from("/run/user/hearth/server-0a1b2c3d4e5f")
        );
    }

    #[test]
    fn basename_is_cut_at_the_first_dot() {
        assert_eq!(
            hash_address(Path::new("/tmp/h/server.tmp1234"), "cafe"),
            PathBuf::from("/tmp/h/server-cafe")
        );
        assert_eq!(
            hash_address(Path::new("/tmp/h/server.a.b"), "cafe"),
            PathBuf::from("/tmp/h/server-cafe")
        );
    }

    #[test]
    fn relative_base_stays_relative() {
        assert_eq!(
            hash_address(Path::new("sock"), "ff"),
            PathBuf::from("sock-ff")
        );
    }

    #[test]
    fn socket_dir_is_created_private() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("deep").join("server");
        prepare_socket_dir(&base).unwrap();
        let meta = fs::metadata(base.parent().unwrap()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
    }
}
