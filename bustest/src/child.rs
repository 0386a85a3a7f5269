//! Helpers shared by everything that owns a child process.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;

/// How a child ended up exiting after [`terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    /// Exited on its own within the grace period.
    Graceful(ExitStatus),
    /// Had to be killed.
    Forced,
}

/// Ask the child to exit with SIGTERM, then SIGKILL after `grace`.
#[cfg(unix)]
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<Termination> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already reaped.
        return child.wait().await.map(Termination::Graceful);
    };
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

    tokio::select! {
        result = child.wait() => result.map(Termination::Graceful),
        _ = tokio::time::sleep(grace) => {
            child.kill().await?;
            Ok(Termination::Forced)
        }
    }
}

#[cfg(not(unix))]
pub(crate) async fn terminate(child: &mut Child, _grace: Duration) -> std::io::Result<Termination> {
    child.kill().await?;
    Ok(Termination::Forced)
}

/// Forward each line of a child stream to tracing under `bustest::output`.
pub(crate) fn forward_lines<R>(stream: R, task: String, source: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(target: "bustest::output", task = %task, source, "{line}");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(task = %task, source, error = %e, "output stream closed");
                    break;
                }
            }
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_terminate_graceful_on_sigterm() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let outcome = terminate(&mut child, Duration::from_secs(5)).await.unwrap();
        // `sleep` dies from the signal itself, which still counts as exiting in time.
        assert!(matches!(outcome, Termination::Graceful(_)));
    }

    #[tokio::test]
    async fn test_terminate_forces_when_sigterm_ignored() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = terminate(&mut child, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(outcome, Termination::Forced);
    }

    #[tokio::test]
    async fn test_terminate_already_exited() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();
        let outcome = terminate(&mut child, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(outcome, Termination::Graceful(status) if status.success()));
    }
}
