use super::{ExitStatus, ProcessCommand, ProcessError, ProcessOutput, ProcessRunner};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Runner that answers from scripted replies and records every command.
///
/// Clones share replies and history, so a test can keep one handle while
/// the engine under test owns another.
#[derive(Clone, Default)]
pub struct MockProcessRunner {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    replies: Vec<Scripted>,
    calls: Vec<ProcessCommand>,
}

struct Scripted {
    program: String,
    operation: Option<String>,
    output: ProcessOutput,
    remaining: Option<usize>,
}

/// One scripted reply, installed with [`MockReply::install`]
pub struct MockReply {
    runner: MockProcessRunner,
    scripted: Scripted,
}

impl MockProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start scripting the reply for `program`
    pub fn on(&self, program: &str) -> MockReply {
        MockReply {
            runner: self.clone(),
            scripted: Scripted {
                program: program.to_string(),
                operation: None,
                output: ProcessOutput {
                    status: ExitStatus::Success,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: Duration::ZERO,
                },
                remaining: None,
            },
        }
    }

    /// Every command run so far, oldest first
    pub fn calls(&self) -> Vec<ProcessCommand> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, operation: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.operation() == Some(operation))
            .count()
    }
}

#[async_trait]
impl ProcessRunner for MockProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(command.clone());

        let reply = state.replies.iter_mut().find(|r| {
            r.program == command.program
                && r.remaining != Some(0)
                && r
                    .operation
                    .as_deref()
                    .map_or(true, |op| command.operation() == Some(op))
        });

        match reply {
            Some(reply) => {
                if let Some(remaining) = reply.remaining.as_mut() {
                    *remaining -= 1;
                }
                Ok(reply.output.clone())
            }
            None => Err(ProcessError::Unscripted(format!(
                "{} {}",
                command.program,
                command.args.join(" ")
            ))),
        }
    }
}

impl MockReply {
    /// Only answer when the last argument is `operation`
    pub fn for_operation(mut self, operation: &str) -> Self {
        self.scripted.operation = Some(operation.to_string());
        self
    }

    pub fn stdout(mut self, stdout: &str) -> Self {
        self.scripted.output.stdout = stdout.to_string();
        self
    }

    pub fn stderr(mut self, stderr: &str) -> Self {
        self.scripted.output.stderr = stderr.to_string();
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.scripted.output.status = match code {
            0 => ExitStatus::Success,
            code => ExitStatus::Code(code),
        };
        self
    }

    /// Answer at most `n` times
    pub fn times(mut self, n: usize) -> Self {
        self.scripted.remaining = Some(n);
        self
    }

    pub fn install(self) {
        self.runner
            .state
            .lock()
            .unwrap()
            .replies
            .push(self.scripted);
    }
}
