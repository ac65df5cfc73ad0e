// src/sys/ops.rs
//
// Builds the catalog of named operations the panel may request. Each
// builder wires validation preconditions, the reload capabilities the
// operation will exercise, and the ordered steps with their rollback
// actions. The engine does the rest.

use serde::Deserialize;
use zeroize::Zeroize;

use crate::config::{Configuration, WebMode};
use crate::error::AgentError;
use crate::sys::engine::{Action, FileMutation, Operation, Step};
use crate::sys::reload::Service;
use crate::sys::remote::CommandTemplate;
use crate::sys::svn::{self, SvnMutation};
use crate::sys::validate::{RuleKind, ValidationRules};
use crate::sys::vhost::{self, VhostMutation};

#[derive(Deserialize)]
struct CreateUserParams {
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct UsernameParams {
    username: String,
}

#[derive(Deserialize)]
struct GroupParams {
    groupname: String,
}

#[derive(Deserialize)]
struct MembershipParams {
    groupname: String,
    username: String,
}

#[derive(Deserialize)]
struct RepositoryParams {
    name: String,
}

#[derive(Deserialize)]
struct SiteParams {
    sitename: String,
}

#[derive(Deserialize)]
struct ReloadParams {
    service: String,
}

/// Builds the named operation from its request parameters, or rejects the
/// request before the engine ever sees it.
///
/// Passwords are special-cased: they are validated and hashed here so the
/// plaintext never rides inside an `Operation` (whose steps are traced
/// and reported). Every other precondition is validated by the engine.
pub fn build(
    config: &Configuration,
    rules: &ValidationRules,
    name: &str,
    params: serde_json::Value,
) -> Result<Operation, AgentError> {
    require_module(config, name)?;
    match name {
        "svn.create-user" => create_user(config, rules, parse(params)?),
        "svn.delete-user" => delete_user(config, parse(params)?),
        "svn.set-password" => set_password(config, rules, parse(params)?),
        "svn.create-group" => create_group(config, parse(params)?),
        "svn.add-member" => add_member(config, parse(params)?),
        "svn.remove-member" => remove_member(config, parse(params)?),
        "svn.create-repository" => create_repository(config, parse(params)?),
        "site.create" => site_create(config, parse(params)?),
        "site.remove" => site_remove(config, parse(params)?),
        "service.reload" => service_reload(parse(params)?),
        other => Err(AgentError::Protocol(format!("unknown operation '{}'", other))),
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: serde_json::Value) -> Result<T, AgentError> {
    serde_json::from_value(params)
        .map_err(|e| AgentError::Protocol(format!("invalid parameters: {}", e)))
}

/// The installer decides which panel modules exist on this host; requests
/// against a disabled module are refused outright.
fn require_module(config: &Configuration, op_name: &str) -> Result<(), AgentError> {
    let module = match op_name.split_once('.') {
        Some(("svn", _)) => "svn",
        Some(("site", _)) => "sites",
        Some(("service", _)) => "services",
        _ => return Err(AgentError::Protocol(format!("unknown operation '{}'", op_name))),
    };
    if config.modules.iter().any(|m| m == module) {
        Ok(())
    } else {
        Err(AgentError::PermissionDenied(format!("module '{}' is not enabled", module)))
    }
}

fn edit_passwd(config: &Configuration, label: impl Into<String>, mutation: SvnMutation) -> Step {
    Step::new(
        label,
        Action::Edit {
            path: config.svn.passwd_path.clone(),
            mutation: FileMutation::Svn(mutation),
        },
    )
}

fn edit_authz(config: &Configuration, label: impl Into<String>, mutation: SvnMutation) -> Step {
    Step::new(
        label,
        Action::Edit {
            path: config.svn.authz_path.clone(),
            mutation: FileMutation::Svn(mutation),
        },
    )
}

fn reload_step(service: Service) -> Step {
    Step::new(format!("reload {}", service.as_str()), Action::Reload { service })
}

fn create_user(
    config: &Configuration,
    rules: &ValidationRules,
    mut p: CreateUserParams,
) -> Result<Operation, AgentError> {
    rules.validate(RuleKind::Password, &p.password)?;
    let entry = svn::htpasswd_entry(&p.password);
    p.password.zeroize();

    Ok(Operation {
        name: "svn.create-user".to_string(),
        preconditions: vec![(RuleKind::Username, p.username.clone())],
        required_permissions: vec![Service::Apache],
        steps: vec![
            edit_passwd(
                config,
                format!("add {} to passwd", p.username),
                SvnMutation::PutPasswdEntry { username: p.username.clone(), entry },
            ),
            edit_authz(
                config,
                format!("add {} to group {}", p.username, config.svn.default_group),
                SvnMutation::AddGroupMember {
                    group: config.svn.default_group.clone(),
                    username: p.username.clone(),
                },
            ),
            reload_step(Service::Apache),
        ],
    })
}

fn delete_user(config: &Configuration, p: UsernameParams) -> Result<Operation, AgentError> {
    Ok(Operation {
        name: "svn.delete-user".to_string(),
        preconditions: vec![(RuleKind::Username, p.username.clone())],
        required_permissions: vec![Service::Apache],
        steps: vec![
            edit_passwd(
                config,
                format!("remove {} from passwd", p.username),
                SvnMutation::RemovePasswdEntry { username: p.username.clone() },
            ),
            edit_authz(
                config,
                format!("remove {} from all groups", p.username),
                SvnMutation::RemoveUserFromAllGroups { username: p.username.clone() },
            ),
            reload_step(Service::Apache),
        ],
    })
}

fn set_password(
    config: &Configuration,
    rules: &ValidationRules,
    mut p: CreateUserParams,
) -> Result<Operation, AgentError> {
    rules.validate(RuleKind::Password, &p.password)?;
    let entry = svn::htpasswd_entry(&p.password);
    p.password.zeroize();

    Ok(Operation {
        name: "svn.set-password".to_string(),
        preconditions: vec![(RuleKind::Username, p.username.clone())],
        required_permissions: vec![Service::Apache],
        steps: vec![
            edit_passwd(
                config,
                format!("update passwd entry for {}", p.username),
                SvnMutation::PutPasswdEntry { username: p.username.clone(), entry },
            ),
            reload_step(Service::Apache),
        ],
    })
}

fn create_group(config: &Configuration, p: GroupParams) -> Result<Operation, AgentError> {
    Ok(Operation {
        name: "svn.create-group".to_string(),
        preconditions: vec![(RuleKind::Groupname, p.groupname.clone())],
        required_permissions: vec![Service::Apache],
        steps: vec![
            edit_authz(
                config,
                format!("create group {}", p.groupname),
                SvnMutation::EnsureGroupLine { group: p.groupname.clone() },
            ),
            reload_step(Service::Apache),
        ],
    })
}

fn add_member(config: &Configuration, p: MembershipParams) -> Result<Operation, AgentError> {
    Ok(Operation {
        name: "svn.add-member".to_string(),
        preconditions: vec![
            (RuleKind::Groupname, p.groupname.clone()),
            (RuleKind::Username, p.username.clone()),
        ],
        required_permissions: vec![Service::Apache],
        steps: vec![
            edit_authz(
                config,
                format!("add {} to group {}", p.username, p.groupname),
                SvnMutation::AddGroupMember {
                    group: p.groupname.clone(),
                    username: p.username.clone(),
                },
            ),
            reload_step(Service::Apache),
        ],
    })
}

fn remove_member(config: &Configuration, p: MembershipParams) -> Result<Operation, AgentError> {
    Ok(Operation {
        name: "svn.remove-member".to_string(),
        preconditions: vec![
            (RuleKind::Groupname, p.groupname.clone()),
            (RuleKind::Username, p.username.clone()),
        ],
        required_permissions: vec![Service::Apache],
        steps: vec![
            edit_authz(
                config,
                format!("remove {} from group {}", p.username, p.groupname),
                SvnMutation::RemoveGroupMember {
                    group: p.groupname.clone(),
                    username: p.username.clone(),
                },
            ),
            reload_step(Service::Apache),
        ],
    })
}

fn create_repository(config: &Configuration, p: RepositoryParams) -> Result<Operation, AgentError> {
    // The created repository directory is deliberately not removed on
    // rollback; destroying repository data is worse than leaving an
    // unreferenced directory for the operator.
    Ok(Operation {
        name: "svn.create-repository".to_string(),
        preconditions: vec![(RuleKind::Groupname, p.name.clone())],
        required_permissions: vec![Service::Apache],
        steps: vec![
            Step::new(
                format!("create repository {}", p.name),
                Action::Remote {
                    command: CommandTemplate::SvnAdminCreate {
                        repository_root: config.svn.repository_root.clone(),
                        name: p.name.clone(),
                    },
                },
            ),
            edit_authz(
                config,
                format!("grant {} access to {}", config.svn.default_group, p.name),
                SvnMutation::GrantRepoAccess {
                    repo: p.name.clone(),
                    group: config.svn.default_group.clone(),
                },
            ),
            reload_step(Service::Apache),
        ],
    })
}

fn web_services(mode: WebMode) -> (bool, bool) {
    match mode {
        WebMode::NginxApache => (true, true),
        WebMode::Apache => (true, false),
        WebMode::Nginx => (false, true),
    }
}

fn site_create(config: &Configuration, p: SiteParams) -> Result<Operation, AgentError> {
    vhost::guard_site_name(&p.sitename)?;
    let (apache, nginx) = web_services(config.web.mode);

    let mut required_permissions = Vec::new();
    let mut steps = Vec::new();

    if apache {
        required_permissions.push(Service::Apache);
        steps.push(Step::new(
            format!("write apache vhost for {}", p.sitename),
            Action::Edit {
                path: vhost::apache_site_path(&config.web, &p.sitename),
                mutation: FileMutation::Vhost(VhostMutation::Write {
                    content: vhost::apache_vhost(&config.web, &p.sitename),
                }),
            },
        ));
        steps.push(Step::new(
            "check apache config",
            Action::Remote { command: CommandTemplate::ApacheConfigTest },
        ));
        steps.push(reload_step(Service::Apache));
    }
    if nginx {
        required_permissions.push(Service::Nginx);
        steps.push(Step::new(
            format!("write nginx vhost for {}", p.sitename),
            Action::Edit {
                path: vhost::nginx_site_path(&config.web, &p.sitename),
                mutation: FileMutation::Vhost(VhostMutation::Write {
                    content: vhost::nginx_vhost(&config.web, &p.sitename),
                }),
            },
        ));
        steps.push(Step::new(
            "check nginx config",
            Action::Remote { command: CommandTemplate::NginxConfigTest },
        ));
        steps.push(reload_step(Service::Nginx));
    }

    Ok(Operation {
        name: "site.create".to_string(),
        preconditions: vec![(RuleKind::Sitename, p.sitename)],
        required_permissions,
        steps,
    })
}

fn site_remove(config: &Configuration, p: SiteParams) -> Result<Operation, AgentError> {
    vhost::guard_site_name(&p.sitename)?;
    let (apache, nginx) = web_services(config.web.mode);

    let mut required_permissions = Vec::new();
    let mut steps = Vec::new();

    if apache {
        required_permissions.push(Service::Apache);
        steps.push(Step::new(
            format!("remove apache vhost for {}", p.sitename),
            Action::Edit {
                path: vhost::apache_site_path(&config.web, &p.sitename),
                mutation: FileMutation::Vhost(VhostMutation::Remove),
            },
        ));
        steps.push(Step::new(
            "check apache config",
            Action::Remote { command: CommandTemplate::ApacheConfigTest },
        ));
        steps.push(reload_step(Service::Apache));
    }
    if nginx {
        required_permissions.push(Service::Nginx);
        steps.push(Step::new(
            format!("remove nginx vhost for {}", p.sitename),
            Action::Edit {
                path: vhost::nginx_site_path(&config.web, &p.sitename),
                mutation: FileMutation::Vhost(VhostMutation::Remove),
            },
        ));
        steps.push(Step::new(
            "check nginx config",
            Action::Remote { command: CommandTemplate::NginxConfigTest },
        ));
        steps.push(reload_step(Service::Nginx));
    }

    Ok(Operation {
        name: "site.remove".to_string(),
        preconditions: vec![(RuleKind::Sitename, p.sitename)],
        required_permissions,
        steps,
    })
}

fn service_reload(p: ReloadParams) -> Result<Operation, AgentError> {
    let service = Service::parse(&p.service)?;
    Ok(Operation {
        name: "service.reload".to_string(),
        preconditions: Vec::new(),
        required_permissions: vec![service],
        steps: vec![reload_step(service)],
    })
}
