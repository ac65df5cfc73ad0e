// src/sys/engine.rs

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Configuration;
use crate::error::AgentError;
use crate::sys::editor::ResourceEditor;
use crate::sys::reload::{ReloadController, Service};
use crate::sys::remote::CommandTemplate;
use crate::sys::svn::SvnMutation;
use crate::sys::traits::CommandExecutor;
use crate::sys::validate::{RuleKind, ValidationRules};
use crate::sys::vhost::VhostMutation;

/// A mutation against one managed file, in either domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileMutation {
    Svn(SvnMutation),
    Vhost(VhostMutation),
}

impl FileMutation {
    fn apply(
        &self,
        current: Option<&str>,
    ) -> Result<(crate::sys::editor::NewState, Option<FileMutation>), AgentError> {
        match self {
            FileMutation::Svn(m) => {
                let (state, inverse) = m.apply(current)?;
                Ok((state, inverse.map(FileMutation::Svn)))
            }
            FileMutation::Vhost(m) => {
                let (state, inverse) = m.apply(current)?;
                Ok((state, inverse.map(FileMutation::Vhost)))
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            FileMutation::Svn(m) => m.describe(),
            FileMutation::Vhost(m) => m.describe().to_string(),
        }
    }
}

/// One side effect of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Edit { path: PathBuf, mutation: FileMutation },
    Remote { command: CommandTemplate },
    Reload { service: Service },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Edit { path, mutation } => {
                write!(f, "edit {}: {}", path.display(), mutation.describe())
            }
            Action::Remote { command } => write!(f, "run {}", command.label()),
            Action::Reload { service } => write!(f, "reload {}", service.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Step {
    pub label: String,
    pub action: Action,
    /// Static rollback action. Edit steps may instead derive their inverse
    /// from the content they actually changed; the static action, when
    /// present, wins.
    pub rollback: Option<Action>,
}

impl Step {
    pub fn new(label: impl Into<String>, action: Action) -> Self {
        Self { label: label.into(), action, rollback: None }
    }

    pub fn with_rollback(mut self, rollback: Action) -> Self {
        self.rollback = Some(rollback);
        self
    }
}

/// A named multi-step administrative action.
#[derive(Debug, Clone)]
pub struct Operation {
    pub name: String,
    /// All preconditions run before any mutating step.
    pub preconditions: Vec<(RuleKind, String)>,
    /// Reload capabilities the operation will exercise; checked up front
    /// so a disabled flag fails the operation before any side effect.
    pub required_permissions: Vec<Service>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every step's side effect is durably applied; terminal.
    Committed,
    /// Rejected during validation; nothing happened.
    Failed,
    /// A step failed after earlier steps applied; the rollback stack was
    /// unwound (best effort).
    RolledBack,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Committed => "committed",
            Outcome::Failed => "failed",
            Outcome::RolledBack => "rolled-back",
        }
    }
}

#[derive(Debug)]
pub struct OperationReport {
    pub operation: String,
    pub outcome: Outcome,
    /// Stable result code: 0 committed, 5 rolled back, otherwise the
    /// failing error's code.
    pub code: u8,
    pub detail: String,
    pub steps_completed: Vec<String>,
    /// Rollback actions that themselves failed; non-empty means an
    /// operator has to intervene manually.
    pub rollback_failures: Vec<String>,
}

const ROLLED_BACK_CODE: u8 = 5;

/// Engine states, traced per transition. `Committed`, `Failed` and
/// `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpState {
    Pending,
    Validating,
    Executing(usize),
    RollingBack,
}

/// Composes validation, file edits, remote commands and gated reloads
/// into transactional operations.
pub struct Engine {
    editor: ResourceEditor,
    executor: Arc<dyn CommandExecutor>,
    reload: ReloadController,
    validator: ValidationRules,
}

impl Engine {
    pub fn new(config: &Configuration, executor: Arc<dyn CommandExecutor>) -> Result<Self, AgentError> {
        Ok(Self {
            editor: ResourceEditor::new(config.limits.lock_wait(), config.limits.backup_retention),
            reload: ReloadController::new(config.auto_reload, executor.clone()),
            validator: ValidationRules::compile(&config.validation)?,
            executor,
        })
    }

    /// The compiled validation rules, shared with the operation catalog
    /// for the checks that must happen before an operation is built.
    pub fn rules(&self) -> &ValidationRules {
        &self.validator
    }

    pub async fn run(&self, op: Operation, cancel: &CancellationToken) -> OperationReport {
        let Operation { name, preconditions, required_permissions, steps } = op;
        let mut state = OpState::Pending;
        tracing::info!(operation = %name, state = ?state, "operation accepted");

        // ---- Validating: no side effects until everything passes ----
        state = OpState::Validating;
        tracing::debug!(operation = %name, state = ?state, "validating");

        for (kind, value) in &preconditions {
            if let Err(e) = self.validator.validate(*kind, value) {
                tracing::info!(operation = %name, kind = kind.as_str(), "validation rejected");
                return failed(&name, e);
            }
        }
        for service in &required_permissions {
            if !self.reload.permitted(*service) {
                let e = AgentError::PermissionDenied(format!(
                    "auto-reload is disabled for {}",
                    service.as_str()
                ));
                tracing::info!(operation = %name, service = service.as_str(), "permission denied");
                return failed(&name, e);
            }
        }

        // ---- Executing: strictly in declared order ----
        let mut completed: Vec<String> = Vec::new();
        let mut rollback_stack: Vec<(String, Action)> = Vec::new();

        for (index, step) in steps.iter().enumerate() {
            state = OpState::Executing(index);
            tracing::debug!(operation = %name, step = %step.label, state = ?state, "executing step");

            let result = if cancel.is_cancelled() {
                Err(AgentError::Cancelled(format!("before step '{}'", step.label)))
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        Err(AgentError::Cancelled(format!("during step '{}'", step.label)))
                    }
                    result = self.apply(&step.action) => result,
                }
            };

            match result {
                Ok(derived_rollback) => {
                    // The side effect is confirmed applied; only now does
                    // its undo join the stack.
                    completed.push(step.label.clone());
                    if let Some(action) = step.rollback.clone().or(derived_rollback) {
                        rollback_stack.push((step.label.clone(), action));
                    }
                }
                Err(e) => {
                    state = OpState::RollingBack;
                    tracing::warn!(
                        operation = %name,
                        step = %step.label,
                        error = %e,
                        state = ?state,
                        "step failed, rolling back"
                    );
                    let rollback_failures = self.unwind(&name, rollback_stack).await;
                    return OperationReport {
                        operation: name,
                        outcome: Outcome::RolledBack,
                        code: ROLLED_BACK_CODE,
                        detail: format!("step '{}' failed: {}", step.label, e),
                        steps_completed: completed,
                        rollback_failures,
                    };
                }
            }
        }

        tracing::info!(operation = %name, "operation committed");
        OperationReport {
            operation: name,
            outcome: Outcome::Committed,
            code: 0,
            detail: "committed".to_string(),
            steps_completed: completed,
            rollback_failures: Vec::new(),
        }
    }

    /// Applies one action, returning the rollback action derived from the
    /// change it actually made (edits only).
    async fn apply(&self, action: &Action) -> Result<Option<Action>, AgentError> {
        match action {
            Action::Edit { path, mutation } => {
                let (outcome, inverse) =
                    self.editor.edit(path, |current| mutation.apply(current)).await?;
                if !outcome.changed {
                    return Ok(None);
                }
                Ok(inverse.map(|m| Action::Edit { path: path.clone(), mutation: m }))
            }
            Action::Remote { command } => {
                self.executor.execute(command).await?;
                Ok(None)
            }
            Action::Reload { service } => {
                self.reload.reload(*service).await?;
                Ok(None)
            }
        }
    }

    /// Unwinds the rollback stack in reverse order. A rollback action's
    /// own failure is recorded and the unwind continues.
    async fn unwind(&self, operation: &str, stack: Vec<(String, Action)>) -> Vec<String> {
        let mut failures = Vec::new();
        for (label, action) in stack.into_iter().rev() {
            tracing::debug!(operation, step = %label, action = %action, "rolling back step");
            if let Err(e) = self.apply(&action).await {
                tracing::error!(operation, step = %label, error = %e, "rollback action failed");
                failures.push(format!("{}: {}", label, e));
            }
        }
        failures
    }
}

fn failed(operation: &str, error: AgentError) -> OperationReport {
    OperationReport {
        operation: operation.to_string(),
        outcome: Outcome::Failed,
        code: error.result_code(),
        detail: error.to_string(),
        steps_completed: Vec::new(),
        rollback_failures: Vec::new(),
    }
}
