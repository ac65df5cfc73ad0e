// src/sys/reload.rs

use std::sync::Arc;

use crate::config::ReloadPermissions;
use crate::error::AgentError;
use crate::sys::remote::CommandTemplate;
use crate::sys::traits::CommandExecutor;

/// The closed set of reloadable services. Nothing user-supplied is ever
/// mapped into this set implicitly; unknown names fail at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Daemon,
    Apache,
    Nginx,
}

impl Service {
    pub fn parse(name: &str) -> Result<Self, AgentError> {
        match name {
            "daemon" => Ok(Service::Daemon),
            "apache" => Ok(Service::Apache),
            "nginx" => Ok(Service::Nginx),
            other => Err(AgentError::Validation(format!("unknown service: '{}'", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Daemon => "daemon",
            Service::Apache => "apache",
            Service::Nginx => "nginx",
        }
    }

    /// The exact, fixed command for this service. Non-composable.
    fn template(&self) -> CommandTemplate {
        match self {
            Service::Daemon => CommandTemplate::DaemonReload,
            Service::Apache => CommandTemplate::ApacheReload,
            Service::Nginx => CommandTemplate::NginxReload,
        }
    }
}

/// Issues reload commands only for services whose auto-reload flag is
/// enabled. The flag is checked here, before any remote call: the
/// config-declared policy is authoritative.
pub struct ReloadController {
    permissions: ReloadPermissions,
    executor: Arc<dyn CommandExecutor>,
}

impl ReloadController {
    pub fn new(permissions: ReloadPermissions, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { permissions, executor }
    }

    pub fn permitted(&self, service: Service) -> bool {
        match service {
            Service::Daemon => self.permissions.daemon,
            Service::Apache => self.permissions.apache,
            Service::Nginx => self.permissions.nginx,
        }
    }

    pub async fn reload(&self, service: Service) -> Result<(), AgentError> {
        if !self.permitted(service) {
            return Err(AgentError::PermissionDenied(format!(
                "auto-reload is disabled for {}",
                service.as_str()
            )));
        }
        self.executor.execute(&service.template()).await?;
        tracing::info!(service = service.as_str(), "service reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::traits::testing::RecordingExecutor;

    fn permissions(daemon: bool, apache: bool, nginx: bool) -> ReloadPermissions {
        ReloadPermissions { daemon, apache, nginx }
    }

    #[tokio::test]
    async fn disabled_flag_never_reaches_the_executor() {
        let spy = Arc::new(RecordingExecutor::new());
        let controller = ReloadController::new(permissions(true, false, true), spy.clone());

        let err = controller.reload(Service::Apache).await.unwrap_err();
        assert!(matches!(err, AgentError::PermissionDenied(_)));
        assert_eq!(err.result_code(), 2);
        assert_eq!(spy.call_count(), 0);
    }

    #[tokio::test]
    async fn enabled_flag_issues_the_exact_mapped_command() {
        let spy = Arc::new(RecordingExecutor::new());
        let controller = ReloadController::new(permissions(true, true, true), spy.clone());

        controller.reload(Service::Nginx).await.unwrap();
        controller.reload(Service::Daemon).await.unwrap();

        assert_eq!(spy.labels(), vec!["nginx-reload", "daemon-reload"]);
    }

    #[test]
    fn unknown_service_names_fail_at_parse_time() {
        assert!(Service::parse("apache").is_ok());
        assert!(Service::parse("postgres").is_err());
        assert!(Service::parse("apache2; rm -rf /").is_err());
    }
}
