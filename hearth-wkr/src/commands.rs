//! Built-in command table.
//!
//! The reference command set a session dispatches: repository creation,
//! snapshots, history display, bookmarks and the destructive maintenance
//! commands (`strip`, `rollback`, `recover`, `unbundle`). Argv arrives
//! NUL-separated from the client and is parsed here with the early options
//! (`-R`, `--cwd`, `--config`) that every command shares.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing::info;

use hearth_common::config::{Config, ConfigError};
use hearth_common::errors::ProtocolError;
use hearth_store::repo::HEARTH_DIR;
use hearth_store::{ChangesetMeta, NodeId, Repository, StoreError, StripOptions};

use crate::ui::Ui;

#[derive(Parser)]
#[command(name = "hearth", version, about = "Versioned archive tool", no_binary_name = true)]
struct Cli {
    /// Repository root (default: discovered from the working directory).
    #[arg(short = 'R', long = "repository", global = true, value_name = "DIR")]
    repository: Option<PathBuf>,

    /// Run as if invoked from this directory.
    #[arg(long, global = true, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Extra configuration, `section.key=value`, applied last.
    #[arg(long, global = true, value_name = "ITEM")]
    config: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a repository.
    Init {
        /// Directory to create (default: the working directory).
        dest: Option<PathBuf>,
    },
    /// Record file contents as a new changeset.
    Snapshot {
        /// Changeset message; prompted for when missing.
        #[arg(short, long)]
        message: Option<String>,
        /// Recorded author (default: `ui.username`, else `$USER`).
        #[arg(short, long)]
        user: Option<String>,
        /// Files to record.
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },
    /// Show changesets, newest first.
    Log {
        /// Limit the number of changesets shown.
        #[arg(short, long, value_name = "NUM")]
        limit: Option<usize>,
    },
    /// Show the current repository heads.
    Heads,
    /// Print a file's content as of a revision.
    Cat {
        /// Revision spec (default: tip).
        #[arg(short, long, value_name = "REV")]
        rev: Option<String>,
        file: String,
    },
    /// List bookmarks, or point one at a revision.
    Bookmark {
        /// Delete the named bookmark.
        #[arg(short, long, requires = "name")]
        delete: bool,
        /// Revision to point at (default: tip).
        #[arg(short, long, value_name = "REV", conflicts_with = "delete")]
        rev: Option<String>,
        name: Option<String>,
    },
    /// Remove revisions and all their descendants from the store.
    Strip {
        /// Skip the backup bundle of the stripped revisions.
        #[arg(long)]
        no_backup: bool,
        /// Revisions to strip.
        #[arg(required = true, value_name = "REV")]
        revs: Vec<String>,
    },
    /// Apply changesets from a bundle file (`-` reads standard input).
    Unbundle { bundle: String },
    /// Undo the most recent transaction.
    Rollback,
    /// Replay the journal of an interrupted transaction.
    Recover,
}

/// What one dispatched command leaves behind for the session.
pub struct Dispatched {
    pub code: i32,
    /// Repository the command touched; reported to the daemon so it can
    /// refresh its handle cache.
    pub repo_root: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum CommandError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The connection itself failed; the session cannot continue.
    #[error(transparent)]
    Session(ProtocolError),
}

impl From<ProtocolError> for CommandError {
    fn from(err: ProtocolError) -> Self {
        CommandError::Session(err)
    }
}

impl From<io::Error> for CommandError {
    fn from(err: io::Error) -> Self {
        CommandError::Session(ProtocolError::Io(err))
    }
}

/// Parse and run one command line. User-level failures are reported on the
/// session channels and folded into the exit code; only connection failures
/// surface as errors.
pub fn dispatch(
    args: &[String],
    baseline: &Config,
    ui: &mut Ui,
) -> Result<Dispatched, ProtocolError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => return usage(ui, err).map_err(Into::into),
    };
    match run(cli, baseline, ui) {
        Ok(dispatched) => Ok(dispatched),
        Err(CommandError::Store(err)) => {
            report_store_error(ui, &err)?;
            Ok(Dispatched {
                code: err.exit_code(),
                repo_root: None,
            })
        }
        Err(CommandError::Config(err)) => {
            ui.warn(&format!("abort: {err}\n"))?;
            Ok(Dispatched {
                code: 255,
                repo_root: None,
            })
        }
        Err(CommandError::Session(err)) => Err(err),
    }
}

fn usage(ui: &mut Ui, err: clap::Error) -> io::Result<Dispatched> {
    let text = err.render().to_string();
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            ui.write(text.as_bytes())?;
            Ok(Dispatched {
                code: 0,
                repo_root: None,
            })
        }
        _ => {
            ui.warn(&text)?;
            Ok(Dispatched {
                code: 255,
                repo_root: None,
            })
        }
    }
}

fn run(cli: Cli, baseline: &Config, ui: &mut Ui) -> Result<Dispatched, CommandError> {
    let _cwd = match cli.cwd.as_deref() {
        Some(dir) => Some(CwdGuard::enter(dir).map_err(StoreError::from)?),
        None => None,
    };

    // every command gets the baseline plus the repository's own config
    // plus its --config overrides; nothing leaks into the next command
    let mut config = baseline.clone();
    if let Some(root) = find_root(cli.repository.as_deref()) {
        config.merge_optional_file(&root.join(HEARTH_DIR).join("config.toml"))?;
    }
    for spec in &cli.config {
        config.apply_override(spec)?;
    }
    ui.set_message_output(config.message_output_channel());

    let repository = cli.repository.as_deref();
    match cli.command {
        Command::Init { dest } => init(dest),
        Command::Snapshot {
            message,
            user,
            files,
        } => snapshot(repo_for(repository)?, message, user, &files, &config, ui),
        Command::Log { limit } => log(repo_for(repository)?, limit, ui),
        Command::Heads => heads(repo_for(repository)?, ui),
        Command::Cat { rev, file } => cat(repo_for(repository)?, rev, &file, ui),
        Command::Bookmark { delete, rev, name } => {
            bookmark(repo_for(repository)?, delete, rev, name, &config, ui)
        }
        Command::Strip { no_backup, revs } => {
            strip(repo_for(repository)?, no_backup, &revs, &config, ui)
        }
        Command::Unbundle { bundle } => unbundle(repo_for(repository)?, &bundle, &config, ui),
        Command::Rollback => rollback(repo_for(repository)?, &config, ui),
        Command::Recover => recover(repo_for(repository)?, &config, ui),
    }
}

fn repo_for(explicit: Option<&Path>) -> Result<Repository, StoreError> {
    match explicit {
        Some(dir) => Repository::open(dir),
        None => Repository::discover(&std::env::current_dir()?),
    }
}

/// Repository root for the config merge, found without opening anything.
fn find_root(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(dir) => Some(dir.to_owned()),
        None => {
            let mut dir = std::env::current_dir().ok()?;
            loop {
                if dir.join(HEARTH_DIR).is_dir() {
                    return Some(dir);
                }
                if !dir.pop() {
                    return None;
                }
            }
        }
    }
}

fn done(code: i32, repo: &Repository) -> Dispatched {
    Dispatched {
        code,
        repo_root: Some(repo.root().to_owned()),
    }
}

fn init(dest: Option<PathBuf>) -> Result<Dispatched, CommandError> {
    let root = match dest {
        Some(dir) => dir,
        None => std::env::current_dir().map_err(StoreError::from)?,
    };
    let repo = Repository::init(&root)?;
    info!(root = %repo.root().display(), "repository initialized");
    Ok(done(0, &repo))
}

fn snapshot(
    mut repo: Repository,
    message: Option<String>,
    user: Option<String>,
    files: &[PathBuf],
    config: &Config,
    ui: &mut Ui,
) -> Result<Dispatched, CommandError> {
    let message = match message {
        Some(m) => m,
        None => ui.prompt_line("snapshot message: ")?,
    };
    if message.trim().is_empty() {
        ui.warn("abort: empty snapshot message\n")?;
        return Ok(done(255, &repo));
    }
    let user = user.unwrap_or_else(|| username(config));

    let mut contents: Vec<(String, Vec<u8>)> = Vec::new();
    for path in files {
        let bytes = fs::read(path).map_err(StoreError::from)?;
        contents.push((store_path(&repo, path), bytes));
    }

    let wait = config.lock_wait();
    let _working = repo.lock_working(wait, |msg| {
        let _ = ui.warn(msg);
    })?;
    let _store = repo.lock_store(wait, |msg| {
        let _ = ui.warn(msg);
    })?;
    match repo.snapshot(&message, &user, None, &contents) {
        Ok((rev, node)) => {
            info!(rev, node = %node.short(), "snapshot recorded");
            Ok(done(0, &repo))
        }
        Err(StoreError::NothingChanged) => {
            ui.status("nothing changed\n")?;
            Ok(done(1, &repo))
        }
        Err(err) => Err(err.into()),
    }
}

/// Repository-relative name for a snapshot file, falling back to the path
/// as given when it lies outside the root.
fn store_path(repo: &Repository, path: &Path) -> String {
    path.canonicalize()
        .ok()
        .and_then(|abs| {
            abs.strip_prefix(repo.root())
                .ok()
                .map(|rel| rel.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn log(mut repo: Repository, limit: Option<usize>, ui: &mut Ui) -> Result<Dispatched, CommandError> {
    let entries = repo.recent(limit)?;
    let marks = repo.bookmarks()?;
    for (i, (rev, node, meta)) in entries.iter().enumerate() {
        if i > 0 {
            ui.write(b"\n")?;
        }
        let names: Vec<&str> = marks
            .iter()
            .filter(|(_, n)| *n == node)
            .map(|(name, _)| name.as_str())
            .collect();
        show_changeset(ui, *rev, node, meta, &names)?;
    }
    Ok(done(0, &repo))
}

fn heads(mut repo: Repository, ui: &mut Ui) -> Result<Dispatched, CommandError> {
    let heads = repo.heads()?;
    if heads.is_empty() {
        return Ok(done(1, &repo));
    }
    let marks = repo.bookmarks()?;
    for (i, (rev, node)) in heads.iter().enumerate() {
        if i > 0 {
            ui.write(b"\n")?;
        }
        let (_, meta) = repo.changeset(*rev)?;
        let names: Vec<&str> = marks
            .iter()
            .filter(|(_, n)| *n == node)
            .map(|(name, _)| name.as_str())
            .collect();
        show_changeset(ui, *rev, node, &meta, &names)?;
    }
    Ok(done(0, &repo))
}

fn cat(
    mut repo: Repository,
    rev: Option<String>,
    file: &str,
    ui: &mut Ui,
) -> Result<Dispatched, CommandError> {
    let rev = repo.resolve(rev.as_deref().unwrap_or("tip"))?;
    let content = repo.cat(rev, file)?;
    ui.write(&content)?;
    Ok(done(0, &repo))
}

fn bookmark(
    mut repo: Repository,
    delete: bool,
    rev: Option<String>,
    name: Option<String>,
    config: &Config,
    ui: &mut Ui,
) -> Result<Dispatched, CommandError> {
    let Some(name) = name else {
        let marks = repo.bookmarks()?;
        if marks.is_empty() {
            ui.status("no bookmarks set\n")?;
            return Ok(done(1, &repo));
        }
        let mut text = String::new();
        for (name, node) in &marks {
            let rev = repo.resolve(name)?;
            text.push_str(&format!("   {name:<24} {rev}:{}\n", node.short()));
        }
        ui.write(text.as_bytes())?;
        return Ok(done(0, &repo));
    };

    let wait = config.lock_wait();
    let target = if delete {
        None
    } else {
        Some(repo.resolve(rev.as_deref().unwrap_or("tip"))?)
    };
    let _working = repo.lock_working(wait, |msg| {
        let _ = ui.warn(msg);
    })?;
    let _store = repo.lock_store(wait, |msg| {
        let _ = ui.warn(msg);
    })?;
    match target {
        Some(rev) => {
            repo.set_bookmark(&name, rev)?;
        }
        None => {
            repo.delete_bookmark(&name)?;
        }
    }
    Ok(done(0, &repo))
}

fn strip(
    mut repo: Repository,
    no_backup: bool,
    revs: &[String],
    config: &Config,
    ui: &mut Ui,
) -> Result<Dispatched, CommandError> {
    let mut targets = Vec::with_capacity(revs.len());
    for spec in revs {
        targets.push(repo.resolve(spec)?);
    }
    let wait = config.lock_wait();
    let _working = repo.lock_working(wait, |msg| {
        let _ = ui.warn(msg);
    })?;
    let _store = repo.lock_store(wait, |msg| {
        let _ = ui.warn(msg);
    })?;
    let outcome = hearth_store::strip(&mut repo, &targets, &StripOptions { no_backup })?;
    if let Some(path) = &outcome.backup {
        ui.status(&format!("saved backup bundle to {}\n", path.display()))?;
    }
    info!(stripped = outcome.stripped, "strip complete");
    Ok(done(0, &repo))
}

fn unbundle(
    mut repo: Repository,
    bundle: &str,
    config: &Config,
    ui: &mut Ui,
) -> Result<Dispatched, CommandError> {
    let wait = config.lock_wait();
    let _working = repo.lock_working(wait, |msg| {
        let _ = ui.warn(msg);
    })?;
    let _store = repo.lock_store(wait, |msg| {
        let _ = ui.warn(msg);
    })?;
    let added = if bundle == "-" {
        let data = ui.read_to_end()?;
        let tmp = repo
            .hearth_dir()
            .join(format!("incoming-{}.bundle", std::process::id()));
        fs::write(&tmp, &data).map_err(StoreError::from)?;
        let applied = repo.unbundle(&tmp);
        let _ = fs::remove_file(&tmp);
        applied?
    } else {
        repo.unbundle(Path::new(bundle))?
    };
    ui.status(&format!("added {added} changesets\n"))?;
    Ok(done(0, &repo))
}

fn rollback(
    mut repo: Repository,
    config: &Config,
    ui: &mut Ui,
) -> Result<Dispatched, CommandError> {
    let wait = config.lock_wait();
    match repo.rollback(wait, |msg| {
        let _ = ui.warn(msg);
    }) {
        Ok(()) => {
            ui.status("repository tip rolled back\n")?;
            Ok(done(0, &repo))
        }
        Err(StoreError::NothingToUndo) => {
            ui.warn("no rollback information available\n")?;
            Ok(done(1, &repo))
        }
        Err(err) => Err(err.into()),
    }
}

fn recover(
    mut repo: Repository,
    config: &Config,
    ui: &mut Ui,
) -> Result<Dispatched, CommandError> {
    let wait = config.lock_wait();
    if repo.recover(wait, |msg| {
        let _ = ui.warn(msg);
    })? {
        ui.status("rolled back abandoned transaction\n")?;
        Ok(done(0, &repo))
    } else {
        ui.status("no abandoned transaction found\n")?;
        Ok(done(1, &repo))
    }
}

fn show_changeset(
    ui: &mut Ui,
    rev: u32,
    node: &NodeId,
    meta: &ChangesetMeta,
    bookmarks: &[&str],
) -> io::Result<()> {
    let mut text = format!("changeset:   {rev}:{}\n", node.short());
    for name in bookmarks {
        text.push_str(&format!("bookmark:    {name}\n"));
    }
    text.push_str(&format!("user:        {}\n", meta.user));
    text.push_str(&format!(
        "date:        {}\n",
        meta.date.format("%a %b %d %H:%M:%S %Y %z")
    ));
    if !meta.files.is_empty() {
        text.push_str(&format!("files:       {}\n", meta.files.join(" ")));
    }
    if let Some(line) = meta.message.lines().next() {
        text.push_str(&format!("summary:     {line}\n"));
    }
    ui.write(text.as_bytes())
}

/// The failure text every command failure ends in. Strip failures name
/// their bundles and the exact command that re-applies them.
fn report_store_error(ui: &mut Ui, err: &StoreError) -> io::Result<()> {
    if let StoreError::StripFailed {
        backup,
        temp,
        source,
    } = err
    {
        if let Some(path) = backup {
            ui.warn(&format!(
                "strip failed, backup bundle stored in {}\n",
                path.display()
            ))?;
        }
        if let Some(path) = temp {
            ui.warn(&format!(
                "strip failed, unrecovered changes stored in {}\n",
                path.display()
            ))?;
            ui.warn(&format!(
                "(fix the problem, then recover the changesets with \"hearth unbundle {}\")\n",
                path.display()
            ))?;
        }
        return ui.warn(&format!("abort: {source}\n"));
    }
    ui.warn(&format!("abort: {err}\n"))
}

fn username(config: &Config) -> String {
    if let Some(name) = config.get_str("ui", "username") {
        return name;
    }
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_owned())
}

/// Scoped `--cwd`: the working directory comes back when the command is
/// done, however it ends.
struct CwdGuard {
    original: PathBuf,
}

impl CwdGuard {
    fn enter(dir: &Path) -> io::Result<CwdGuard> {
        let original = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        Ok(CwdGuard { original })
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.original);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_common::config::LoadOptions;
    use hearth_common::protocol::{channel, read_frame};
    use std::os::unix::net::UnixStream;

    /// Run one command line against a scratch Ui and collect what reached
    /// the client. Absolute `-R` paths and explicit `-u` keep these tests
    /// independent of the process-wide cwd and environment.
    fn run_dispatch(args: &[&str]) -> (i32, String, String) {
        let (server, client) = UnixStream::pair().unwrap();
        let mut ui = Ui::new(&server, false).unwrap();
        let baseline = Config::load(&LoadOptions::isolated()).unwrap();
        let argv: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let dispatched = dispatch(&argv, &baseline, &mut ui).unwrap();
        ui.flush().unwrap();
        drop(ui);
        drop(server);

        let mut client = client;
        let (mut stdout, mut stderr) = (Vec::new(), Vec::new());
        loop {
            match read_frame(&mut client) {
                Ok(frame) => match frame.channel {
                    channel::OUTPUT => stdout.extend_from_slice(&frame.payload),
                    channel::ERROR => stderr.extend_from_slice(&frame.payload),
                    _ => {}
                },
                Err(err) if err.is_disconnect() => break,
                Err(err) => panic!("unexpected frame error: {err}"),
            }
        }
        (
            dispatched.code,
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        )
    }

    fn fixture() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        let root_str = root.to_string_lossy().into_owned();
        let (code, _, _) = run_dispatch(&["init", &root_str]);
        assert_eq!(code, 0);
        (dir, root_str)
    }

    fn snap(root: &str, name: &str, content: &[u8], message: &str) {
        let path = Path::new(root).join(name);
        fs::write(&path, content).unwrap();
        let (code, _, stderr) = run_dispatch(&[
            "-R",
            root,
            "snapshot",
            "-m",
            message,
            "-u",
            "test",
            path.to_str().unwrap(),
        ]);
        assert_eq!(code, 0, "snapshot failed: {stderr}");
    }

    #[test]
    fn init_snapshot_log_round_trip() {
        let (_dir, root) = fixture();
        snap(&root, "notes.txt", b"first\n", "add notes");
        let (code, stdout, _) = run_dispatch(&["-R", &root, "log"]);
        assert_eq!(code, 0);
        assert!(stdout.contains("changeset:   0:"), "{stdout}");
        assert!(stdout.contains("user:        test"), "{stdout}");
        assert!(stdout.contains("summary:     add notes"), "{stdout}");
        assert!(stdout.contains("files:       notes.txt"), "{stdout}");
    }

    #[test]
    fn unchanged_snapshot_reports_nothing_changed() {
        let (_dir, root) = fixture();
        snap(&root, "a.txt", b"same\n", "one");
        let path = Path::new(&root).join("a.txt");
        let (code, stdout, _) = run_dispatch(&[
            "-R",
            &root,
            "snapshot",
            "-m",
            "two",
            "-u",
            "test",
            path.to_str().unwrap(),
        ]);
        assert_eq!(code, 1);
        assert_eq!(stdout, "nothing changed\n");
    }

    #[test]
    fn cat_restores_recorded_content() {
        let (_dir, root) = fixture();
        snap(&root, "a.txt", b"old\n", "one");
        snap(&root, "a.txt", b"new\n", "two");
        let (code, stdout, _) = run_dispatch(&["-R", &root, "cat", "-r", "0", "a.txt"]);
        assert_eq!(code, 0);
        assert_eq!(stdout, "old\n");
        let (code, stdout, _) = run_dispatch(&["-R", &root, "cat", "a.txt"]);
        assert_eq!(code, 0);
        assert_eq!(stdout, "new\n");
    }

    #[test]
    fn unknown_revision_aborts() {
        let (_dir, root) = fixture();
        snap(&root, "a.txt", b"x\n", "one");
        let (code, _, stderr) = run_dispatch(&["-R", &root, "cat", "-r", "99", "a.txt"]);
        assert_eq!(code, 255);
        assert!(stderr.contains("abort: unknown revision"), "{stderr}");
    }

    #[test]
    fn bookmarks_list_set_and_guard_their_flags() {
        let (_dir, root) = fixture();
        snap(&root, "a.txt", b"x\n", "one");
        let (code, stdout, _) = run_dispatch(&["-R", &root, "bookmark"]);
        assert_eq!(code, 1);
        assert_eq!(stdout, "no bookmarks set\n");

        let (code, _, _) = run_dispatch(&["-R", &root, "bookmark", "main"]);
        assert_eq!(code, 0);
        let (code, stdout, _) = run_dispatch(&["-R", &root, "bookmark"]);
        assert_eq!(code, 0);
        assert!(stdout.contains("main"), "{stdout}");
        assert!(stdout.contains("0:"), "{stdout}");

        // --delete without a name is a usage error
        let (code, _, stderr) = run_dispatch(&["-R", &root, "bookmark", "--delete"]);
        assert_eq!(code, 255);
        assert!(!stderr.is_empty());

        let (code, _, _) = run_dispatch(&["-R", &root, "bookmark", "--delete", "main"]);
        assert_eq!(code, 0);
        let (code, _, _) = run_dispatch(&["-R", &root, "bookmark"]);
        assert_eq!(code, 1);
    }

    #[test]
    fn rollback_without_undo_information_fails_politely() {
        let (_dir, root) = fixture();
        let (code, _, stderr) = run_dispatch(&["-R", &root, "rollback"]);
        assert_eq!(code, 1);
        assert_eq!(stderr, "no rollback information available\n");
    }

    #[test]
    fn rollback_undoes_the_last_snapshot() {
        let (_dir, root) = fixture();
        snap(&root, "a.txt", b"one\n", "one");
        snap(&root, "a.txt", b"two\n", "two");
        let (code, stdout, _) = run_dispatch(&["-R", &root, "rollback"]);
        assert_eq!(code, 0);
        assert_eq!(stdout, "repository tip rolled back\n");
        let (_, stdout, _) = run_dispatch(&["-R", &root, "log"]);
        assert!(stdout.contains("summary:     one"), "{stdout}");
        assert!(!stdout.contains("summary:     two"), "{stdout}");
    }

    #[test]
    fn strip_saves_a_backup_and_unbundle_restores_it() {
        let (_dir, root) = fixture();
        snap(&root, "a.txt", b"one\n", "one");
        snap(&root, "a.txt", b"two\n", "two");

        let (code, stdout, stderr) = run_dispatch(&["-R", &root, "strip", "1"]);
        assert_eq!(code, 0, "{stderr}");
        let bundle = stdout
            .lines()
            .find_map(|l| l.strip_prefix("saved backup bundle to "))
            .expect("backup path in output")
            .to_owned();
        let (_, stdout, _) = run_dispatch(&["-R", &root, "log"]);
        assert!(!stdout.contains("summary:     two"), "{stdout}");

        let (code, stdout, stderr) = run_dispatch(&["-R", &root, "unbundle", &bundle]);
        assert_eq!(code, 0, "{stderr}");
        assert_eq!(stdout, "added 1 changesets\n");
        let (_, stdout, _) = run_dispatch(&["-R", &root, "log"]);
        assert!(stdout.contains("summary:     two"), "{stdout}");
    }

    #[test]
    fn recover_reports_when_there_is_nothing_to_do() {
        let (_dir, root) = fixture();
        let (code, stdout, _) = run_dispatch(&["-R", &root, "recover"]);
        assert_eq!(code, 1);
        assert_eq!(stdout, "no abandoned transaction found\n");
    }

    #[test]
    fn repo_local_config_reaches_the_command() {
        let (_dir, root) = fixture();
        snap(&root, "a.txt", b"x\n", "one");
        fs::write(
            Path::new(&root).join(HEARTH_DIR).join("config.toml"),
            "[ui]\nusername = \"from repo config\"\n",
        )
        .unwrap();
        let path = Path::new(&root).join("a.txt");
        fs::write(&path, b"y\n").unwrap();
        let (code, _, _) = run_dispatch(&[
            "-R",
            &root,
            "snapshot",
            "-m",
            "two",
            path.to_str().unwrap(),
        ]);
        assert_eq!(code, 0);
        let (_, stdout, _) = run_dispatch(&["-R", &root, "log", "-l", "1"]);
        assert!(stdout.contains("user:        from repo config"), "{stdout}");
    }

    #[test]
    fn missing_repository_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let nowhere = dir.path().join("void").to_string_lossy().into_owned();
        let (code, _, stderr) = run_dispatch(&["-R", &nowhere, "log"]);
        assert_eq!(code, 255);
        assert!(stderr.contains("abort: no repository found"), "{stderr}");
    }
}
