// src/sys/remote.rs

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use tokio::sync::{Mutex, Semaphore};
use zeroize::Zeroize;

use crate::config::Configuration;
use crate::error::AgentError;
use crate::sys::secrets::Credential;
use crate::sys::traits::CommandExecutor;

/// Captured result of a remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// The closed set of commands the agent may run on the managed host.
///
/// There is deliberately no variant carrying a free-form command line:
/// every command the executor can issue is enumerated here, and the only
/// parameterized one validates its parameter before rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandTemplate {
    DaemonReload,
    ApacheReload,
    NginxReload,
    ApacheConfigTest,
    NginxConfigTest,
    SvnAdminCreate { repository_root: PathBuf, name: String },
}

impl CommandTemplate {
    pub fn label(&self) -> &'static str {
        match self {
            CommandTemplate::DaemonReload => "daemon-reload",
            CommandTemplate::ApacheReload => "apache-reload",
            CommandTemplate::NginxReload => "nginx-reload",
            CommandTemplate::ApacheConfigTest => "apache-configtest",
            CommandTemplate::NginxConfigTest => "nginx-configtest",
            CommandTemplate::SvnAdminCreate { .. } => "svnadmin-create",
        }
    }

    /// Renders the fixed command line. Template parameters never reach the
    /// shell unvalidated and unquoted.
    pub fn render(&self) -> Result<String, AgentError> {
        match self {
            CommandTemplate::DaemonReload => Ok("sudo systemctl daemon-reload".to_string()),
            CommandTemplate::ApacheReload => Ok("sudo service apache2 reload".to_string()),
            CommandTemplate::NginxReload => Ok("sudo service nginx reload".to_string()),
            CommandTemplate::ApacheConfigTest => Ok("sudo apache2ctl configtest".to_string()),
            CommandTemplate::NginxConfigTest => Ok("sudo nginx -t".to_string()),
            CommandTemplate::SvnAdminCreate { repository_root, name } => {
                guard_parameter("repository name", name)?;
                let target = repository_root.join(name);
                let target = target.to_str().ok_or_else(|| {
                    AgentError::Internal("repository path is not valid UTF-8".to_string())
                })?;
                Ok(format!("sudo svnadmin create {}", shell_quote(target)))
            }
        }
    }
}

/// Argument-injection guard for template parameters: a leading dash would
/// be parsed as an option, and path separators would escape the
/// configured root.
fn guard_parameter(what: &str, value: &str) -> Result<(), AgentError> {
    if value.is_empty() || value.starts_with('-') {
        return Err(AgentError::Validation(format!("suspicious {}: '{}'", what, value)));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
        return Err(AgentError::Validation(format!("invalid characters in {}: '{}'", what, value)));
    }
    if value == "." || value == ".." {
        return Err(AgentError::Validation(format!("suspicious {}: '{}'", what, value)));
    }
    Ok(())
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

enum Auth {
    Password(Credential),
    KeyFile(PathBuf),
}

struct PanelClient;

#[async_trait]
impl client::Handler for PanelClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // The managed host is the one named in the installer-generated
        // configuration; there is no host database to pin against.
        Ok(true)
    }
}

struct IdleSession {
    handle: client::Handle<PanelClient>,
    parked_at: Instant,
}

/// Pooled SSH executor for the managed host.
///
/// Sessions are created on demand up to `limits.max_sessions`; callers
/// suspend on the semaphore when the pool is saturated. Idle sessions
/// past the idle deadline are evicted on the next checkout pass.
pub struct SshExecutor {
    config: Arc<Configuration>,
    auth: Auth,
    permits: Semaphore,
    idle: Mutex<Vec<IdleSession>>,
}

impl SshExecutor {
    pub fn new(config: Arc<Configuration>) -> Result<Self, AgentError> {
        let auth = if config.ssh.password_required {
            let password = config
                .ssh
                .password
                .clone()
                .ok_or_else(|| AgentError::Internal("ssh password missing".to_string()))?;
            Auth::Password(Credential::from_secret(password))
        } else {
            let key_path = config
                .ssh
                .key_path
                .clone()
                .ok_or_else(|| AgentError::Internal("ssh key path missing".to_string()))?;
            Auth::KeyFile(key_path)
        };
        Ok(Self {
            permits: Semaphore::new(config.limits.max_sessions),
            idle: Mutex::new(Vec::new()),
            auth,
            config,
        })
    }

    /// Pops a usable pooled session, evicting stale or dead ones, or
    /// connects a fresh session with bounded retries.
    async fn checkout(&self) -> Result<client::Handle<PanelClient>, AgentError> {
        let idle_deadline = self.config.limits.idle_timeout();
        let mut idle = self.idle.lock().await;
        while let Some(session) = idle.pop() {
            if session.parked_at.elapsed() > idle_deadline || session.handle.is_closed() {
                close_session(session.handle);
                continue;
            }
            return Ok(session.handle);
        }
        drop(idle);
        self.connect_with_retry().await
    }

    async fn park(&self, handle: client::Handle<PanelClient>) {
        if handle.is_closed() {
            return;
        }
        let mut idle = self.idle.lock().await;
        idle.push(IdleSession { handle, parked_at: Instant::now() });
    }

    async fn connect_with_retry(&self) -> Result<client::Handle<PanelClient>, AgentError> {
        let attempts = self.config.limits.connect_attempts;
        let mut delay = self.config.limits.backoff_base();
        let mut last_err = AgentError::Connection("no connect attempt made".to_string());
        for attempt in 1..=attempts {
            match self.connect_once().await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, host = %self.config.ssh.host, "ssh connect failed");
                    last_err = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
        Err(last_err)
    }

    async fn connect_once(&self) -> Result<client::Handle<PanelClient>, AgentError> {
        let ssh_config = Arc::new(client::Config::default());
        let addr = (self.config.ssh.host.as_str(), self.config.ssh.port);

        let connect = client::connect(ssh_config, addr, PanelClient);
        let mut handle = tokio::time::timeout(self.config.limits.command_timeout(), connect)
            .await
            .map_err(|_| {
                AgentError::Connection(format!("connect to {} timed out", self.config.ssh.host))
            })?
            .map_err(|e| AgentError::Connection(format!("connect failed: {}", e)))?;

        let user = self.config.ssh.user.clone();
        let authed = match &self.auth {
            Auth::Password(credential) => {
                let password = credential.use_secret(|s| s.to_string());
                let result = handle
                    .authenticate_password(user, password)
                    .await
                    .map_err(|e| AgentError::Connection(format!("auth failed: {}", e)))?;
                result
            }
            Auth::KeyFile(path) => {
                let mut pem = tokio::fs::read_to_string(path).await.map_err(|e| {
                    AgentError::Connection(format!("cannot read key {}: {}", path.display(), e))
                })?;
                let keypair = russh_keys::decode_secret_key(&pem, None)
                    .map_err(|e| AgentError::Connection(format!("cannot decode key: {}", e)));
                pem.zeroize();
                handle
                    .authenticate_publickey(user, Arc::new(keypair?))
                    .await
                    .map_err(|e| AgentError::Connection(format!("auth failed: {}", e)))?
            }
        };
        if !authed {
            return Err(AgentError::Connection(format!(
                "ssh authentication rejected for user {}",
                self.config.ssh.user
            )));
        }
        Ok(handle)
    }
}

#[async_trait]
impl CommandExecutor for SshExecutor {
    async fn execute(&self, command: &CommandTemplate) -> Result<CommandOutput, AgentError> {
        let line = command.render()?;

        // Suspend for a slot rather than opening unbounded connections.
        let _permit = tokio::time::timeout(self.config.limits.acquire_wait(), self.permits.acquire())
            .await
            .map_err(|_| AgentError::Timeout("waiting for a free ssh session".to_string()))?
            .map_err(|_| AgentError::Internal("session pool closed".to_string()))?;

        let mut handle = self.checkout().await?;

        let result = tokio::time::timeout(
            self.config.limits.command_timeout(),
            run_command(&mut handle, &line),
        )
        .await;
        match result {
            Ok(Ok(output)) => {
                self.park(handle).await;
                if output.exit_code != 0 {
                    // The remote side already ran; retrying could double
                    // its side effects.
                    return Err(AgentError::CommandFailed {
                        exit_code: output.exit_code,
                        stderr: output.stderr,
                    });
                }
                tracing::debug!(command = command.label(), "remote command succeeded");
                Ok(output)
            }
            Ok(Err(e)) => {
                close_session(handle);
                Err(e)
            }
            Err(_) => {
                // The session state is unknown after an abandoned exec, so
                // the session is closed instead of parked. The permit is
                // released on drop either way.
                close_session(handle);
                Err(AgentError::Timeout(format!("remote command '{}' timed out", command.label())))
            }
        }
    }
}

async fn run_command(
    handle: &mut client::Handle<PanelClient>,
    line: &str,
) -> Result<CommandOutput, AgentError> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| AgentError::Connection(format!("channel open failed: {}", e)))?;
    channel
        .exec(true, line)
        .await
        .map_err(|e| AgentError::Connection(format!("exec failed: {}", e)))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code: Option<i32> = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status as i32),
            _ => {}
        }
    }

    Ok(CommandOutput {
        exit_code: exit_code.unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
    })
}

fn close_session(handle: client::Handle<PanelClient>) {
    tokio::spawn(async move {
        let _ = handle.disconnect(Disconnect::ByApplication, "steward-agent", "en").await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_templates_render_the_exact_panel_commands() {
        assert_eq!(CommandTemplate::DaemonReload.render().unwrap(), "sudo systemctl daemon-reload");
        assert_eq!(CommandTemplate::ApacheReload.render().unwrap(), "sudo service apache2 reload");
        assert_eq!(CommandTemplate::NginxReload.render().unwrap(), "sudo service nginx reload");
    }

    #[test]
    fn svnadmin_template_quotes_and_joins_under_the_root() {
        let t = CommandTemplate::SvnAdminCreate {
            repository_root: PathBuf::from("/var/svn"),
            name: "project1".to_string(),
        };
        assert_eq!(t.render().unwrap(), "sudo svnadmin create /var/svn/project1");
    }

    #[test]
    fn svnadmin_template_rejects_injection_attempts() {
        for name in ["", "-rf", "a;b", "a b", "../etc", "a/b", ".", "..", "a$(x)"] {
            let t = CommandTemplate::SvnAdminCreate {
                repository_root: PathBuf::from("/var/svn"),
                name: name.to_string(),
            };
            assert!(t.render().is_err(), "expected rejection for {:?}", name);
        }
    }

    #[test]
    fn shell_quote_wraps_unusual_arguments() {
        assert_eq!(shell_quote("/var/svn/p1"), "/var/svn/p1");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
    }

    #[tokio::test]
    async fn failed_attempts_do_not_leak_pool_permits() {
        // Port 1 on loopback refuses connections; with a single-slot pool,
        // a second execute only succeeds in *reaching* the connect stage if
        // the first attempt released its permit.
        let config = Arc::new(
            Configuration::from_json(
                r#"{
                    "ssh": {"host": "127.0.0.1", "port": 1, "user": "admin",
                            "password": "secret", "password_required": true},
                    "limits": {"max_sessions": 1, "connect_attempts": 1,
                               "backoff_ms": 10, "command_timeout_secs": 2,
                               "acquire_wait_secs": 1}
                }"#,
            )
            .unwrap(),
        );
        let executor = SshExecutor::new(config).unwrap();

        for _ in 0..2 {
            let err = executor.execute(&CommandTemplate::DaemonReload).await.unwrap_err();
            // A pool-acquisition timeout would surface as Timeout; a
            // released permit lets the call fail at the connection instead.
            assert!(
                matches!(err, AgentError::Connection(_)),
                "expected Connection, got {:?}",
                err
            );
        }
    }
}
