use std::ffi::OsString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, RouterError};
use crate::exec;

/// Replicates one directory tree into another.
#[async_trait]
pub trait Mirror: Send + Sync {
    /// Mirror `source` into `dest`. With `files`, only those paths (relative to `source`) are
    /// transferred; entries that vanished in the meantime must be tolerated.
    async fn replicate(&self, source: &Path, dest: &Path, files: Option<&[PathBuf]>) -> Result<()>;
}

/// Flags preserving hard links, ownership, permissions, timestamps, ACLs and xattrs, staying on
/// one filesystem and writing in place.
pub const DEFAULT_RSYNC_FLAGS: &[&str] = &[
    "--hard-links",
    "--times",
    "--whole-file",
    "--inplace",
    "--partial",
    "--verbose",
    "--progress",
    "--one-file-system",
    "--recursive",
    "--perms",
    "--group",
    "--owner",
    "--devices",
    "--specials",
    "--acls",
    "--xattrs",
    "--itemize-changes",
];

/// rsync exit status for source files that disappeared during the transfer.
const RSYNC_VANISHED: i32 = 24;

/// [`Mirror`] backed by an `rsync` subprocess.
#[derive(Clone)]
pub struct RsyncMirror {
    program: PathBuf,
    flags: Vec<OsString>,
}

impl fmt::Debug for RsyncMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsyncMirror")
            .field("program", &self.program)
            .field("flags", &self.flags.len())
            .finish()
    }
}

impl Default for RsyncMirror {
    fn default() -> Self {
        Self::new("rsync")
    }
}

impl RsyncMirror {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            flags: DEFAULT_RSYNC_FLAGS.iter().map(OsString::from).collect(),
        }
    }

    /// Replace the default flag set.
    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.flags = flags.into_iter().map(Into::into).collect();
        self
    }

    /// Build the invocation. The source gets a trailing slash so its contents, not the
    /// directory itself, land in `dest`.
    fn command(&self, source: &Path, dest: &Path, files_from: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.flags);
        if let Some(list) = files_from {
            cmd.arg("--from0").arg("--files-from").arg(list).arg("--relative");
        }
        cmd.arg(with_trailing_slash(source)).arg(dest);
        cmd
    }
}

#[async_trait]
impl Mirror for RsyncMirror {
    async fn replicate(&self, source: &Path, dest: &Path, files: Option<&[PathBuf]>) -> Result<()> {
        let Some(files) = files else {
            return exec::execute(self.command(source, dest, None), "rsync").await;
        };

        let list = tempfile::NamedTempFile::new()?;
        let mut contents = Vec::new();
        for file in files {
            contents.extend_from_slice(file.as_os_str().as_bytes());
            contents.push(0);
        }
        tokio::fs::write(list.path(), contents).await?;
        debug!(
            target: "qbrouter::sync",
            count = files.len(),
            list = %list.path().display(),
            "wrote file list"
        );

        // `list` is removed when dropped, whatever the outcome.
        match exec::execute(self.command(source, dest, Some(list.path())), "rsync").await {
            Err(RouterError::Subprocess {
                code: Some(RSYNC_VANISHED),
                ..
            }) => {
                debug!(target: "qbrouter::sync", "some listed files vanished before transfer");
                Ok(())
            }
            other => other,
        }
    }
}

fn with_trailing_slash(path: &Path) -> OsString {
    let mut raw = path.as_os_str().to_owned();
    if !raw.as_bytes().ends_with(b"/") {
        raw.push("/");
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn full_mirror_appends_slash_to_source() {
        let mirror = RsyncMirror::default();
        let cmd = mirror.command(Path::new("/hot/data"), Path::new("/cold/data"), None);
        let args = args(&cmd);

        assert_eq!(cmd.as_std().get_program(), "rsync");
        assert!(args.contains(&"--hard-links".to_string()));
        assert!(!args.contains(&"--files-from".to_string()));
        assert_eq!(&args[args.len() - 2..], ["/hot/data/", "/cold/data"]);
    }

    #[test]
    fn file_list_mode_uses_relative_paths() {
        let mirror = RsyncMirror::new("/usr/bin/rsync").with_flags(["--archive"]);
        let cmd = mirror.command(
            Path::new("/hot/data/"),
            Path::new("/cold/data"),
            Some(Path::new("/tmp/list")),
        );

        assert_eq!(
            args(&cmd),
            [
                "--archive",
                "--from0",
                "--files-from",
                "/tmp/list",
                "--relative",
                "/hot/data/",
                "/cold/data"
            ]
        );
    }
}
