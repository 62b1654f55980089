//! VirtualHere client invocation
//!
//! Every agent command is a single process run: `<client> -t "<COMMAND>"`.
//! The agent answers in plain text; interpreting it is left to the callers.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent exited with code {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
    #[error("failed to start agent client: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("agent did not answer within {0:?}")]
    Timeout(Duration),
    #[error("agent rejected the command: {0}")]
    Rejected(String),
}

/// Command-execution interface of the device-sharing agent
pub trait DeviceAgent: Send + Sync + 'static {
    /// Runs one line command (`LIST`, `USE,1-2`, ...) and returns its stdout
    fn execute(&self, command: &str) -> impl Future<Output = Result<String, AgentError>> + Send;
}

impl<T: DeviceAgent> DeviceAgent for std::sync::Arc<T> {
    fn execute(&self, command: &str) -> impl Future<Output = Result<String, AgentError>> + Send {
        (**self).execute(command)
    }
}

/// Drives the VirtualHere command-line client
#[derive(Debug, Clone)]
pub struct VirtualHereCli {
    client_path: String,
    timeout: Duration,
}

impl VirtualHereCli {
    pub fn new(client_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client_path: client_path.into(),
            timeout,
        }
    }
}

impl DeviceAgent for VirtualHereCli {
    async fn execute(&self, command: &str) -> Result<String, AgentError> {
        debug!(command, "Executing agent command");

        let child = AsyncCommand::new(&self.client_path)
            .arg("-t")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| AgentError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(AgentError::Exit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    //! Agent double answering from a script

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum Reply {
        Ok(String),
        Fail(i32),
        Hang,
    }

    /// Replies are keyed by exact command; unscripted commands fail with exit 1
    #[derive(Default)]
    pub struct ScriptedAgent {
        replies: Mutex<HashMap<String, Reply>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedAgent {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(&self, command: &str, reply: Reply) {
            self.replies.lock().unwrap().insert(command.to_string(), reply);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, command: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| *c == command).count()
        }
    }

    impl DeviceAgent for ScriptedAgent {
        async fn execute(&self, command: &str) -> Result<String, AgentError> {
            self.calls.lock().unwrap().push(command.to_string());
            let reply = self.replies.lock().unwrap().get(command).cloned();

            match reply {
                Some(Reply::Ok(out)) => Ok(out),
                Some(Reply::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(AgentError::Timeout(Duration::from_secs(3600)))
                }
                Some(Reply::Fail(code)) => Err(AgentError::Exit {
                    code: Some(code),
                    stderr: "scripted failure".into(),
                }),
                None => Err(AgentError::Exit {
                    code: Some(1),
                    stderr: format!("unscripted command {command}"),
                }),
            }
        }
    }
}
