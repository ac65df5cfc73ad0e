// src/config.rs

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::AgentError;

/// Process-wide settings, loaded once at startup from the JSON file the
/// panel installer generates. Immutable afterwards; shared as
/// `Arc<Configuration>` by every component. No ambient global.
#[derive(Debug, Deserialize)]
pub struct Configuration {
    /// Panel modules enabled on this host.
    #[serde(default = "default_modules")]
    pub modules: Vec<String>,

    pub ssh: SshConfig,

    /// Per-service auto-reload flags. A disabled flag means the reload
    /// command is never issued, not even attempted.
    #[serde(default)]
    pub auto_reload: ReloadPermissions,

    #[serde(default)]
    pub svn: SvnConfig,

    #[serde(default)]
    pub web: WebConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub limits: Limits,

    /// Where the agent listens. Overridable via STEWARD_SOCKET_PATH.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// UID of the panel process allowed to connect. Overridable via
    /// STEWARD_PANEL_UID.
    #[serde(default = "default_panel_uid")]
    pub panel_uid: u32,
}

#[derive(Debug, Deserialize)]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    /// Only consulted when `password_required` is set.
    #[serde(default)]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub password_required: bool,
    /// PEM-encoded private key used when password auth is not required.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ReloadPermissions {
    /// sudo systemctl daemon-reload
    #[serde(default = "default_true")]
    pub daemon: bool,
    /// sudo service apache2 reload
    #[serde(default = "default_true")]
    pub apache: bool,
    /// sudo service nginx reload
    #[serde(default = "default_true")]
    pub nginx: bool,
}

impl Default for ReloadPermissions {
    fn default() -> Self {
        Self { daemon: true, apache: true, nginx: true }
    }
}

#[derive(Debug, Deserialize)]
pub struct SvnConfig {
    #[serde(default = "default_svn_authz")]
    pub authz_path: PathBuf,
    #[serde(default = "default_svn_passwd")]
    pub passwd_path: PathBuf,
    #[serde(default = "default_svn_repos")]
    pub repository_root: PathBuf,
    /// Group every new user joins; also the principal granted access to
    /// newly created repositories.
    #[serde(default = "default_svn_group")]
    pub default_group: String,
}

impl Default for SvnConfig {
    fn default() -> Self {
        Self {
            authz_path: default_svn_authz(),
            passwd_path: default_svn_passwd(),
            repository_root: default_svn_repos(),
            default_group: default_svn_group(),
        }
    }
}

/// Which web servers front the sites on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum WebMode {
    #[serde(rename = "nginx+apache")]
    NginxApache,
    #[serde(rename = "nginx")]
    Nginx,
    #[serde(rename = "apache")]
    Apache,
}

#[derive(Debug, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_mode")]
    pub mode: WebMode,
    #[serde(default = "default_apache_path")]
    pub apache_path: PathBuf,
    #[serde(default = "default_nginx_path")]
    pub nginx_path: PathBuf,
    #[serde(default = "default_sites_root")]
    pub sites_root: PathBuf,
    /// Backend address nginx proxies to in nginx+apache mode.
    #[serde(default = "default_apache_host")]
    pub apache_host: String,
    #[serde(default = "default_apache_port")]
    pub apache_port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            mode: default_web_mode(),
            apache_path: default_apache_path(),
            nginx_path: default_nginx_path(),
            sites_root: default_sites_root(),
            apache_host: default_apache_host(),
            apache_port: default_apache_port(),
        }
    }
}

/// A named pattern plus the message shown to the user when it fails.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub pattern: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_username_rule")]
    pub username: RuleSpec,
    #[serde(default = "default_password_rule")]
    pub password: RuleSpec,
    #[serde(default = "default_groupname_rule")]
    pub groupname: RuleSpec,
    #[serde(default = "default_sitename_rule")]
    pub sitename: RuleSpec,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            username: default_username_rule(),
            password: default_password_rule(),
            groupname: default_groupname_rule(),
            sitename: default_sitename_rule(),
        }
    }
}

/// Tunable limits. Defaults, not contracts.
#[derive(Debug, Deserialize)]
pub struct Limits {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_acquire_wait")]
    pub acquire_wait_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_lock_wait")]
    pub lock_wait_secs: u64,
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            connect_attempts: default_connect_attempts(),
            backoff_ms: default_backoff_ms(),
            command_timeout_secs: default_command_timeout(),
            acquire_wait_secs: default_acquire_wait(),
            idle_timeout_secs: default_idle_timeout(),
            lock_wait_secs: default_lock_wait(),
            backup_retention: default_backup_retention(),
        }
    }
}

impl Limits {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
    pub fn acquire_wait(&self) -> Duration {
        Duration::from_secs(self.acquire_wait_secs)
    }
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Configuration {
    /// Loads the installer-generated file, applies environment overrides,
    /// and validates the result. The agent refuses to start on any
    /// inconsistency rather than limping along with partial settings.
    pub fn load() -> Result<Self, AgentError> {
        let path = env::var("STEWARD_CONFIG")
            .unwrap_or_else(|_| "/etc/steward/agent.json".to_string());
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| AgentError::Internal(format!("config: cannot read {}: {}", path, e)))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, AgentError> {
        let mut config: Configuration = serde_json::from_str(raw)
            .map_err(|e| AgentError::Internal(format!("config: parse error: {}", e)))?;

        if let Ok(path) = env::var("STEWARD_SOCKET_PATH") {
            config.socket_path = PathBuf::from(path);
        }
        // Strict UID parse. A non-numeric value in the environment would
        // bypass the peer-credential check, so the agent refuses to start.
        if let Ok(uid) = env::var("STEWARD_PANEL_UID") {
            config.panel_uid = uid
                .parse::<u32>()
                .expect("STEWARD_PANEL_UID must be a valid numeric User ID");
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AgentError> {
        fn bad(field: &str, why: &str) -> AgentError {
            AgentError::Internal(format!("config: {}: {}", field, why))
        }
        fn absolute(field: &str, path: &Path) -> Result<(), AgentError> {
            if path.is_absolute() { Ok(()) } else { Err(bad(field, "path must be absolute")) }
        }

        if self.ssh.host.is_empty() {
            return Err(bad("ssh.host", "must not be empty"));
        }
        if self.ssh.port == 0 {
            return Err(bad("ssh.port", "must not be zero"));
        }
        if self.ssh.user.is_empty() {
            return Err(bad("ssh.user", "must not be empty"));
        }
        if self.ssh.password_required && self.ssh.password.is_none() {
            return Err(bad("ssh.password", "required when password_required is set"));
        }
        if !self.ssh.password_required && self.ssh.key_path.is_none() {
            return Err(bad("ssh.key_path", "required when password_required is not set"));
        }
        if let Some(key_path) = &self.ssh.key_path {
            absolute("ssh.key_path", key_path)?;
        }

        absolute("svn.authz_path", &self.svn.authz_path)?;
        absolute("svn.passwd_path", &self.svn.passwd_path)?;
        absolute("svn.repository_root", &self.svn.repository_root)?;
        if self.svn.default_group.is_empty() {
            return Err(bad("svn.default_group", "must not be empty"));
        }

        absolute("web.apache_path", &self.web.apache_path)?;
        absolute("web.nginx_path", &self.web.nginx_path)?;
        absolute("web.sites_root", &self.web.sites_root)?;

        for (field, rule) in [
            ("validation.username", &self.validation.username),
            ("validation.password", &self.validation.password),
            ("validation.groupname", &self.validation.groupname),
            ("validation.sitename", &self.validation.sitename),
        ] {
            regex::Regex::new(&rule.pattern)
                .map_err(|e| bad(field, &format!("pattern does not compile: {}", e)))?;
            if rule.message.is_empty() {
                return Err(bad(field, "message must not be empty"));
            }
        }

        if self.limits.max_sessions == 0 {
            return Err(bad("limits.max_sessions", "must be at least 1"));
        }
        if self.limits.connect_attempts == 0 {
            return Err(bad("limits.connect_attempts", "must be at least 1"));
        }
        if self.limits.backup_retention == 0 {
            return Err(bad("limits.backup_retention", "must be at least 1"));
        }

        Ok(())
    }
}

fn default_modules() -> Vec<String> {
    ["users", "svn", "sites", "files", "monitoring", "services", "ssh"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_true() -> bool {
    true
}
fn default_ssh_port() -> u16 {
    22
}
fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/steward/agent.sock")
}
fn default_panel_uid() -> u32 {
    1001
}
fn default_svn_authz() -> PathBuf {
    PathBuf::from("/etc/apache2/dav_svn.authz")
}
fn default_svn_passwd() -> PathBuf {
    PathBuf::from("/etc/apache2/dav_svn.passwd")
}
fn default_svn_repos() -> PathBuf {
    PathBuf::from("/var/svn")
}
fn default_svn_group() -> String {
    "everyone".to_string()
}
fn default_web_mode() -> WebMode {
    WebMode::NginxApache
}
fn default_apache_path() -> PathBuf {
    PathBuf::from("/etc/apache2")
}
fn default_nginx_path() -> PathBuf {
    PathBuf::from("/etc/nginx")
}
fn default_sites_root() -> PathBuf {
    PathBuf::from("/var/www")
}
fn default_apache_host() -> String {
    "127.0.0.1".to_string()
}
fn default_apache_port() -> u16 {
    8080
}
fn default_username_rule() -> RuleSpec {
    RuleSpec {
        pattern: "^([A-Za-z]+)([A-Za-z0-9_.-]*)$".to_string(),
        message: "The username can contain letters of the English alphabet, numbers, hyphens \
                  and underscores. The username must start with a letter."
            .to_string(),
    }
}
fn default_password_rule() -> RuleSpec {
    RuleSpec {
        pattern: "^(.{1,24})$".to_string(),
        message: "The password must contain 1 to 24 characters.".to_string(),
    }
}
fn default_groupname_rule() -> RuleSpec {
    RuleSpec {
        pattern: "^([A-Za-z]+)([A-Za-z0-9_.-]*)$".to_string(),
        message: "The name can contain letters of the English alphabet, numbers, hyphens and \
                  underscores. The name must start with a letter."
            .to_string(),
    }
}
fn default_sitename_rule() -> RuleSpec {
    RuleSpec {
        pattern: "^([A-Za-z0-9_-]+)([A-Za-z0-9_.-]*)$".to_string(),
        message: "Site name must begin with the letters of the English alphabet or numbers. \
                  The name must not contain special characters, except for: dash, the \
                  underscore character and dot."
            .to_string(),
    }
}
fn default_max_sessions() -> usize {
    4
}
fn default_connect_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_command_timeout() -> u64 {
    30
}
fn default_acquire_wait() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    60
}
fn default_lock_wait() -> u64 {
    5
}
fn default_backup_retention() -> usize {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "ssh": {
                "host": "203.0.113.10",
                "user": "admin",
                "password": "secret",
                "password_required": true
            }
        }"#
    }

    #[test]
    fn minimal_file_gets_panel_defaults() {
        let config = Configuration::from_json(minimal_json()).unwrap();
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.svn.authz_path, PathBuf::from("/etc/apache2/dav_svn.authz"));
        assert_eq!(config.svn.passwd_path, PathBuf::from("/etc/apache2/dav_svn.passwd"));
        assert_eq!(config.svn.default_group, "everyone");
        assert_eq!(config.web.mode, WebMode::NginxApache);
        assert!(config.auto_reload.daemon);
        assert!(config.auto_reload.apache);
        assert!(config.auto_reload.nginx);
        assert_eq!(config.validation.password.pattern, "^(.{1,24})$");
    }

    #[test]
    fn password_required_without_password_is_rejected() {
        let raw = r#"{"ssh": {"host": "h", "user": "u", "password_required": true}}"#;
        assert!(Configuration::from_json(raw).is_err());
    }

    #[test]
    fn key_auth_without_key_path_is_rejected() {
        let raw = r#"{"ssh": {"host": "h", "user": "u", "password_required": false}}"#;
        assert!(Configuration::from_json(raw).is_err());
    }

    #[test]
    fn relative_managed_path_is_rejected() {
        let raw = r#"{
            "ssh": {"host": "h", "user": "u", "password": "p", "password_required": true},
            "svn": {"authz_path": "relative/authz"}
        }"#;
        assert!(Configuration::from_json(raw).is_err());
    }

    #[test]
    fn bad_pattern_is_rejected_at_load() {
        let raw = r#"{
            "ssh": {"host": "h", "user": "u", "password": "p", "password_required": true},
            "validation": {"username": {"pattern": "([", "message": "m"}}
        }"#;
        assert!(Configuration::from_json(raw).is_err());
    }

    #[test]
    fn web_mode_names_match_panel_values() {
        let raw = r#"{
            "ssh": {"host": "h", "user": "u", "password": "p", "password_required": true},
            "web": {"mode": "nginx"}
        }"#;
        let config = Configuration::from_json(raw).unwrap();
        assert_eq!(config.web.mode, WebMode::Nginx);
    }
}
