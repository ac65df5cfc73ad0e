// src/sys/traits.rs

use async_trait::async_trait;

use crate::error::AgentError;
use crate::sys::remote::{CommandOutput, CommandTemplate};

/// Contract between the orchestration side and the remote command
/// transport. Implementations must only accept members of the
/// [`CommandTemplate`] allow-list; there is no method taking a raw
/// command line.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &CommandTemplate) -> Result<CommandOutput, AgentError>;
}

#[cfg(test)]
pub mod testing {
    //! A recording executor for engine and reload-controller tests.

    use std::sync::Mutex;

    use super::*;

    /// Scripted, call-recording stand-in for the SSH executor.
    pub struct RecordingExecutor {
        pub calls: Mutex<Vec<CommandTemplate>>,
        /// Labels of templates that should fail with a non-zero exit.
        pub fail_on: Vec<&'static str>,
    }

    impl RecordingExecutor {
        pub fn new() -> Self {
            Self { calls: Mutex::new(Vec::new()), fail_on: Vec::new() }
        }

        pub fn failing_on(labels: &[&'static str]) -> Self {
            Self { calls: Mutex::new(Vec::new()), fail_on: labels.to_vec() }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub fn labels(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().iter().map(|c| c.label()).collect()
        }
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn execute(&self, command: &CommandTemplate) -> Result<CommandOutput, AgentError> {
            // Render first, like the real executor: template guards apply
            // to spies too.
            command.render()?;
            self.calls.lock().unwrap().push(command.clone());
            if self.fail_on.contains(&command.label()) {
                return Err(AgentError::CommandFailed {
                    exit_code: 1,
                    stderr: format!("{} scripted to fail", command.label()),
                });
            }
            Ok(CommandOutput { exit_code: 0, stdout: String::new(), stderr: String::new() })
        }
    }
}
