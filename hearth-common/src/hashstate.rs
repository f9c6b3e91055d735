//! Staleness detection state.
//!
//! A resident server answers for one exact configuration. Two digests pin it
//! down: `config_hash` covers the sensitive config sections plus the
//! sensitive environment variables, and names the socket the server listens
//! on; `mtime_hash` covers the on-disk identity (size, mtime) of the plugin
//! files and the server executable. `validate` recomputes both against the
//! baseline captured at bind time and tells the client how to proceed.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::UNIX_EPOCH;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::address::hash_address;
use crate::config::Config;
use crate::errors::ProtocolError;
use crate::protocol::{join_nul, split_nul_strings};

/// Environment variable carrying the daemon-to-worker handoff JSON.
pub const HANDOFF_ENV: &str = "HEARTH_SERVER_HANDOFF";

/// Config sections whose items invalidate a resident server when they
/// change.
const SENSITIVE_SECTIONS: &[&str] = &["plugins", "aliases", "ui"];

/// Environment variables that feed the config hash. Loaders, locale and
/// terminal variables change behavior without touching any config file.
static SENSITIVE_ENV: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:HEARTH.*|LANG(?:UAGE)?|LC_.*|LD_.*|PATH|TERM(?:INFO)?|TZ)$")
        .expect("sensitive env pattern is a valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashState {
    pub config_hash: String,
    pub mtime_hash: String,
    pub mtime_paths: Vec<PathBuf>,
}

impl HashState {
    /// Full state for a freshly loaded configuration.
    pub fn compute(config: &Config) -> HashState {
        Self::with_paths(config, watched_paths(config))
    }

    /// State with the watched path list pinned. `validate` recomputes over
    /// the baseline's paths so that a plugin added to the config shows up as
    /// a config change, not as a silent new watch.
    pub fn with_paths(config: &Config, mtime_paths: Vec<PathBuf>) -> HashState {
        HashState {
            config_hash: config_hash(config),
            mtime_hash: mtime_hash(&mtime_paths),
            mtime_paths,
        }
    }
}

fn watched_paths(config: &Config) -> Vec<PathBuf> {
    let mut paths = config.plugin_paths();
    if let Ok(exe) = env::current_exe() {
        paths.push(exe);
    }
    paths.sort();
    paths.dedup();
    paths
}

fn config_hash(config: &Config) -> String {
    let mut env_items: Vec<(String, String)> = env::vars()
        .filter(|(k, _)| k != HANDOFF_ENV && SENSITIVE_ENV.is_match(k))
        .collect();
    env_items.sort();
    config_hash_parts(config, &env_items)
}

/// Section digest and environment digest, 6 hex chars each. Split out so
/// tests can hash a synthetic environment.
fn config_hash_parts(config: &Config, env_items: &[(String, String)]) -> String {
    let mut sections = blake3::Hasher::new();
    for name in SENSITIVE_SECTIONS {
        feed(&mut sections, name.as_bytes());
        for (k, v) in config.section_items(name) {
            feed(&mut sections, k.as_bytes());
            feed(&mut sections, v.as_bytes());
        }
    }
    let mut envh = blake3::Hasher::new();
    for (k, v) in env_items {
        feed(&mut envh, k.as_bytes());
        feed(&mut envh, v.as_bytes());
    }
    format!("{}{}", hex_prefix(&sections, 6), hex_prefix(&envh, 6))
}

/// Digest over (mtime, size) of every watched path, 12 hex chars. Any stat
/// failure yields the empty hash: the server cannot vouch for files it
/// cannot see, and the empty baseline changes how `validate` answers.
fn mtime_hash(paths: &[PathBuf]) -> String {
    let mut hasher = blake3::Hasher::new();
    for path in paths {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(_) => return String::new(),
        };
        let (secs, nanos) = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| (d.as_secs(), d.subsec_nanos()))
            .unwrap_or((0, 0));
        hasher.update(&secs.to_le_bytes());
        hasher.update(&nanos.to_le_bytes());
        hasher.update(&meta.len().to_le_bytes());
    }
    hex_prefix(&hasher, 12)
}

fn feed(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn hex_prefix(hasher: &blake3::Hasher, n: usize) -> String {
    hasher.finalize().to_hex()[..n].to_owned()
}

// ── Validate instructions ────────────────────────────────────────────────

/// What a stale (or current) server tells its client to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Remove a socket the server no longer vouches for.
    Unlink(PathBuf),
    /// Reconnect to the same address; a fresh server will take the name.
    Reconnect,
    /// Connect to this address instead.
    Redirect(PathBuf),
    /// Give up with this exit code (configuration is unloadable).
    Exit(i32),
}

impl Instruction {
    pub fn render(&self) -> String {
        match self {
            Instruction::Unlink(path) => format!("unlink {}", path.display()),
            Instruction::Reconnect => "reconnect".to_owned(),
            Instruction::Redirect(path) => format!("redirect {}", path.display()),
            Instruction::Exit(code) => format!("exit {code}"),
        }
    }

    pub fn parse(raw: &str) -> Result<Instruction, ProtocolError> {
        if let Some(path) = raw.strip_prefix("unlink ") {
            Ok(Instruction::Unlink(PathBuf::from(path)))
        } else if let Some(path) = raw.strip_prefix("redirect ") {
            Ok(Instruction::Redirect(PathBuf::from(path)))
        } else if raw == "reconnect" {
            Ok(Instruction::Reconnect)
        } else if let Some(code) = raw.strip_prefix("exit ") {
            code.parse()
                .map(Instruction::Exit)
                .map_err(|_| ProtocolError::Malformed(format!("bad exit code {code:?}")))
        } else {
            Err(ProtocolError::Malformed(format!(
                "unknown instruction {raw:?}"
            )))
        }
    }
}

/// NUL-joined wire form; no instructions is a single NUL, never empty.
pub fn render_instructions(insts: &[Instruction]) -> Vec<u8> {
    if insts.is_empty() {
        return vec![0];
    }
    join_nul(insts.iter().map(|i| i.render().into_bytes()))
}

pub fn parse_instructions(payload: &[u8]) -> Result<Vec<Instruction>, ProtocolError> {
    split_nul_strings(payload)
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| Instruction::parse(s))
        .collect()
}

/// The `validate` decision. `fresh` must have been computed over the
/// baseline's watched paths.
///
/// A changed mtime hash means this server's code or plugins changed on disk:
/// its socket is unlinked so nobody else dials it, and the client reconnects
/// to let a fresh server take the name. When the baseline hash is empty the
/// files were already unreadable at bind time; the socket still goes away
/// but no reconnect is promised, because a fresh server would fare no
/// better. A changed config hash simply names a different socket.
pub fn validate_decision(
    base_address: &Path,
    baseline: &HashState,
    fresh: &HashState,
) -> Vec<Instruction> {
    let mut insts = Vec::new();
    if fresh.mtime_hash != baseline.mtime_hash {
        insts.push(Instruction::Unlink(hash_address(
            base_address,
            &baseline.config_hash,
        )));
        if !baseline.mtime_hash.is_empty() {
            insts.push(Instruction::Reconnect);
        }
    }
    if fresh.config_hash != baseline.config_hash {
        insts.push(Instruction::Redirect(hash_address(
            base_address,
            &fresh.config_hash,
        )));
    }
    insts
}

// ── Daemon-to-worker handoff ─────────────────────────────────────────────

/// Everything a session worker needs from the daemon that spawned it,
/// carried as JSON in [`HANDOFF_ENV`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHandoff {
    /// Plain base address (the symlink).
    pub base_address: PathBuf,
    /// Hash-qualified address the daemon is actually bound to.
    pub address: PathBuf,
    /// Baseline hash state captured when the daemon bound the socket.
    pub hash: HashState,
    /// Datagram socket for worker-to-daemon notices, when the daemon
    /// listens for them.
    pub mailbox: Option<PathBuf>,
}

impl ServerHandoff {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<ServerHandoff, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
