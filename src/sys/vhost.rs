// src/sys/vhost.rs
//
// Vhost file resources for the sites module. Rendering only; the writes
// themselves go through the resource editor and the reloads through the
// gated reload controller, composed by the engine.

use std::path::PathBuf;

use crate::config::{WebConfig, WebMode};
use crate::error::AgentError;
use crate::sys::editor::NewState;

/// Per-site log directory, created next to the site content.
pub const LOG_DIR_NAME: &str = ".logs";

/// Strictly validates a site name before it becomes part of a path under
/// the web-server config directories.
pub fn guard_site_name(site: &str) -> Result<(), AgentError> {
    if site.is_empty() {
        return Err(AgentError::Validation("site name cannot be empty".to_string()));
    }
    if site.contains("..") || site.contains('/') || site.contains('\\') {
        return Err(AgentError::Validation(format!("path traversal detected in site name: '{}'", site)));
    }
    if !site.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')) {
        return Err(AgentError::Validation(format!("invalid characters in site name: '{}'", site)));
    }
    Ok(())
}

pub fn apache_site_path(web: &WebConfig, site: &str) -> PathBuf {
    web.apache_path.join("sites-enabled").join(format!("{}.conf", site))
}

pub fn nginx_site_path(web: &WebConfig, site: &str) -> PathBuf {
    web.nginx_path.join("sites-enabled").join(site)
}

/// Apache serves the site content. Behind nginx it binds the backend
/// port; standalone it binds :80.
pub fn apache_vhost(web: &WebConfig, site: &str) -> String {
    let listen_port = match web.mode {
        WebMode::NginxApache => web.apache_port,
        _ => 80,
    };
    let site_root = web.sites_root.join(site);
    let root = site_root.display();
    format!(
        r#"<VirtualHost *:{listen_port}>
    ServerName {site}
    DocumentRoot {root}
    ErrorLog {root}/{logs}/error.log
    CustomLog {root}/{logs}/access.log combined
    <Directory {root}>
        Options -Indexes +FollowSymLinks
        AllowOverride All
        Require all granted
    </Directory>
</VirtualHost>
"#,
        listen_port = listen_port,
        site = site,
        root = root,
        logs = LOG_DIR_NAME,
    )
}

/// Nginx either proxies to the apache backend (nginx+apache mode) or
/// serves the site root directly.
pub fn nginx_vhost(web: &WebConfig, site: &str) -> String {
    match web.mode {
        WebMode::NginxApache => format!(
            r#"server {{
    listen 80;
    server_name {site};

    access_log {root}/{logs}/nginx.access.log;

    location / {{
        proxy_pass http://{backend_host}:{backend_port};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
    }}
}}
"#,
            site = site,
            root = web.sites_root.join(site).display(),
            logs = LOG_DIR_NAME,
            backend_host = web.apache_host,
            backend_port = web.apache_port,
        ),
        _ => format!(
            r#"server {{
    listen 80;
    server_name {site};

    root {root};
    index index.html index.htm;

    access_log {root}/{logs}/nginx.access.log;

    location / {{
        try_files $uri $uri/ =404;
    }}
}}
"#,
            site = site,
            root = web.sites_root.join(site).display(),
            logs = LOG_DIR_NAME,
        ),
    }
}

/// Whole-file mutations for vhost resources. Unlike the svn files, a
/// vhost file is created and removed as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VhostMutation {
    Write { content: String },
    Remove,
}

impl VhostMutation {
    pub fn describe(&self) -> &'static str {
        match self {
            VhostMutation::Write { .. } => "write vhost",
            VhostMutation::Remove => "remove vhost",
        }
    }

    pub fn apply(
        &self,
        current: Option<&str>,
    ) -> Result<(NewState, Option<VhostMutation>), AgentError> {
        match self {
            VhostMutation::Write { content } => match current {
                Some(existing) if existing == content => Ok((NewState::Unchanged, None)),
                Some(existing) => Ok((
                    NewState::Content(content.clone()),
                    Some(VhostMutation::Write { content: existing.to_string() }),
                )),
                None => Ok((NewState::Content(content.clone()), Some(VhostMutation::Remove))),
            },
            VhostMutation::Remove => match current {
                Some(existing) => Ok((
                    NewState::Absent,
                    Some(VhostMutation::Write { content: existing.to_string() }),
                )),
                None => Ok((NewState::Unchanged, None)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebConfig;

    #[test]
    fn site_name_guard_rejects_traversal_and_injection() {
        assert!(guard_site_name("example.com").is_ok());
        assert!(guard_site_name("my-site_2").is_ok());
        for bad in ["", "../etc", "a/b", "a\\b", "a b", "a;b", "a\n"] {
            assert!(guard_site_name(bad).is_err(), "expected rejection for {:?}", bad);
        }
    }

    #[test]
    fn apache_vhost_binds_the_backend_port_behind_nginx() {
        let web = WebConfig::default();
        let conf = apache_vhost(&web, "example.com");
        assert!(conf.contains("<VirtualHost *:8080>"));
        assert!(conf.contains("ServerName example.com"));
        assert!(conf.contains("/var/www/example.com/.logs/error.log"));
    }

    #[test]
    fn nginx_vhost_proxies_to_apache_in_combined_mode() {
        let web = WebConfig::default();
        let conf = nginx_vhost(&web, "example.com");
        assert!(conf.contains("proxy_pass http://127.0.0.1:8080"));
        assert!(conf.contains("server_name example.com"));
    }

    #[test]
    fn nginx_vhost_serves_the_root_in_standalone_mode() {
        let web = WebConfig { mode: WebMode::Nginx, ..WebConfig::default() };
        let conf = nginx_vhost(&web, "example.com");
        assert!(conf.contains("root /var/www/example.com"));
        assert!(!conf.contains("proxy_pass"));
    }

    #[test]
    fn write_then_remove_invert_each_other() {
        let write = VhostMutation::Write { content: "server {}\n".to_string() };
        let (state, inverse) = write.apply(None).unwrap();
        assert!(matches!(state, NewState::Content(_)));
        assert_eq!(inverse, Some(VhostMutation::Remove));

        let (state, inverse) = VhostMutation::Remove.apply(Some("server {}\n")).unwrap();
        assert!(matches!(state, NewState::Absent));
        assert_eq!(inverse, Some(write));
    }

    #[test]
    fn rewriting_identical_content_is_a_no_op() {
        let write = VhostMutation::Write { content: "server {}\n".to_string() };
        let (state, inverse) = write.apply(Some("server {}\n")).unwrap();
        assert!(matches!(state, NewState::Unchanged));
        assert!(inverse.is_none());
    }
}
