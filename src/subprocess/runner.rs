use super::{ExitStatus, ProcessCommand, ProcessError, ProcessOutput, ProcessRunner};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, trace};

/// Runs commands as children of this process.
///
/// Stdin is fed while stdout and stderr are drained, so large requests
/// cannot deadlock against a chatty child. Children are killed when the
/// future driving them is dropped: an aborted rank leaves no engine behind.
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    fn spawn(command: &ProcessCommand) -> Result<Child, ProcessError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn().map_err(|source| match source.kind() {
            ErrorKind::NotFound => ProcessError::CommandNotFound(command.program.clone()),
            _ => ProcessError::Spawn {
                program: command.program.clone(),
                source,
            },
        })
    }

    async fn communicate(
        mut child: Child,
        input: Option<&str>,
    ) -> Result<std::process::Output, ProcessError> {
        let pipe = child.stdin.take();
        let (fed, output) = tokio::join!(feed(pipe, input), child.wait_with_output());
        match fed {
            // The child may exit without reading its input.
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                trace!("Child closed stdin early")
            }
            Err(e) => return Err(ProcessError::Io(e)),
            Ok(()) => {}
        }
        Ok(output?)
    }

    fn exit_status(status: std::process::ExitStatus) -> ExitStatus {
        if status.success() {
            return ExitStatus::Success;
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitStatus::Signal(signal);
            }
        }
        ExitStatus::Code(status.code().unwrap_or(-1))
    }
}

async fn feed(pipe: Option<ChildStdin>, input: Option<&str>) -> std::io::Result<()> {
    let (Some(mut pipe), Some(input)) = (pipe, input) else {
        return Ok(());
    };
    pipe.write_all(input.as_bytes()).await?;
    pipe.shutdown().await
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        debug!("Running {} {}", command.program, command.args.join(" "));
        let started = Instant::now();

        let child = Self::spawn(&command)?;
        let run = Self::communicate(child, command.stdin.as_deref());
        let output = match command.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| ProcessError::Timeout {
                    program: command.program.clone(),
                    limit,
                })??,
            None => run.await?,
        };

        let duration = started.elapsed();
        trace!("{} finished in {:?}", command.program, duration);
        Ok(ProcessOutput {
            status: Self::exit_status(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration,
        })
    }
}
