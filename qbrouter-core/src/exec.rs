//! Subprocess execution with streamed output.
//!
//! The child's stdout and stderr are read line by line while it runs, so a long mirror pass
//! shows progress in the log instead of dumping everything at exit.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{error, info};

use crate::error::{Result, RouterError};

/// Spawn `command`, stream its output to the log, and wait for it to exit.
///
/// stdout lines are logged at INFO and stderr lines at ERROR, both tagged with `label`. A
/// non-zero exit becomes [`RouterError::Subprocess`].
pub async fn execute(mut command: Command, label: &str) -> Result<()> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| RouterError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    tokio::join!(
        forward_lines(stdout, |line| info!(target: "qbrouter::exec", label, "{line}")),
        forward_lines(stderr, |line| error!(target: "qbrouter::exec", label, "{line}")),
    );

    let status = child.wait().await?;
    if !status.success() {
        return Err(RouterError::Subprocess {
            program,
            code: status.code(),
        });
    }

    Ok(())
}

async fn forward_lines<R, F>(stream: Option<R>, mut log: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let Some(stream) = stream else {
        return;
    };

    // Raw bytes: file names are not guaranteed to be UTF-8, and the pipe must stay open
    // until the child closes it.
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let trimmed = line.trim_end();
                if !trimmed.is_empty() {
                    log(trimmed);
                }
            }
        }
    }
}
