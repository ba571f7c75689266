//! Relay subprocess control.
//!
//! Children run with stdin piped (the transcoder treats 'q' as a quit
//! request), stderr piped for the monitor, and stdout discarded.
//! `kill_on_drop` covers exit paths that never reach [`RelayProcess::stop`].

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, Command};

use crate::error::{Error, Result};

/// Substitutes "{source}" and "{target}" through the argument template.
#[must_use]
pub fn build_args(template: &[String], source: &str, target: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| arg.replace("{source}", source).replace("{target}", target))
        .collect()
}

#[derive(Debug)]
pub struct RelayProcess {
    child: Child,
}

pub fn spawn_relay(program: &str, args: &[String]) -> Result<RelayProcess> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Spawn(format!("failed to start '{program}': {e}")))?;
    Ok(RelayProcess { child })
}

impl RelayProcess {
    /// Hands the stderr pipe to the caller. Present exactly once per spawn.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Two-phase stop: a quit request over stdin, a bounded wait for a
    /// clean exit, then the kill.
    pub async fn stop(mut self, grace: Duration) -> Option<ExitStatus> {
        if let Some(mut stdin) = self.child.stdin.take() {
            let _ = stdin.write_all(b"q\n").await;
            let _ = stdin.shutdown().await;
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(_)) => None,
            Err(_) => {
                let _ = self.child.start_kill();
                self.child.wait().await.ok()
            }
        }
    }
}

/// Runs "<program> -version" and returns the first output line.
///
/// Catches a missing or non-executable relay binary before any camera is
/// wired to it.
pub async fn probe_program(program: &str) -> Result<String> {
    let output = Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::Program(format!("'{program}' is not runnable: {e}")))?;
    let first_line = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    if !output.status.success() && first_line.is_empty() {
        return Err(Error::Program(format!(
            "'{program} -version' exited with {}",
            output.status
        )));
    }
    Ok(first_line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_build_args_substitution() {
        let template = strings(&["-i", "{source}", "-f", "rtsp", "{target}"]);
        let args = build_args(&template, "rtsp://cam/in", "rtsp://relay/out");
        assert_eq!(
            args,
            strings(&["-i", "rtsp://cam/in", "-f", "rtsp", "rtsp://relay/out"])
        );
    }

    #[test]
    fn test_build_args_without_placeholders_is_identity() {
        let template = strings(&["5"]);
        assert_eq!(build_args(&template, "a", "b"), strings(&["5"]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawn_missing_program_errors() {
        let err = spawn_relay("camflux-no-such-relay", &[]).unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_graceful_stop_closes_stdin() {
        // cat exits on stdin EOF, which the quit phase produces.
        let process = spawn_relay("cat", &[]).unwrap();
        let status = process.stop(Duration::from_secs(5)).await;
        assert!(status.is_some_and(|s| s.success()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_kills_after_grace() {
        // sleep ignores stdin, so the kill phase has to fire.
        let process = spawn_relay("sleep", &strings(&["5"])).unwrap();
        let status = process.stop(Duration::from_millis(200)).await;
        assert!(status.is_some_and(|s| !s.success()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_probe_existing_program() {
        assert!(probe_program("echo").await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_probe_missing_program() {
        let err = probe_program("camflux-no-such-relay").await.unwrap_err();
        assert!(matches!(err, Error::Program(_)));
    }
}
