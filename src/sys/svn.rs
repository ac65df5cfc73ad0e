// src/sys/svn.rs
//
// Line-level model of the two files mod_dav_svn authenticates against:
// the htpasswd-style passwd file and the authz access file. Mutations are
// pure functions of the current content and report the inverse mutation
// that undoes them, which the engine pushes onto its rollback stack.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::error::AgentError;
use crate::sys::editor::NewState;

/// Builds the credential part of a passwd line, `{SHA}` scheme
/// (base64 of the SHA-1 digest), which mod_authn_file accepts on every
/// platform without apr-specific iteration.
pub fn htpasswd_entry(password: &str) -> String {
    format!("{{SHA}}{}", BASE64.encode(Sha1::digest(password.as_bytes())))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SvnMutation {
    /// Add or replace `username`'s passwd line.
    PutPasswdEntry { username: String, entry: String },
    RemovePasswdEntry { username: String },
    /// Create or replace a `[groups]` line verbatim.
    SetGroupLine { group: String, members: Vec<String> },
    /// Create an empty group line when the group is missing; an existing
    /// group keeps its members.
    EnsureGroupLine { group: String },
    RemoveGroupLine { group: String },
    AddGroupMember { group: String, username: String },
    RemoveGroupMember { group: String, username: String },
    /// Strip `username` out of every group line.
    RemoveUserFromAllGroups { username: String },
    /// Give `@group` read-write access to a repository section, creating
    /// the section when missing.
    GrantRepoAccess { repo: String, group: String },
    RevokeRepoAccessLine { repo: String, group: String },
    RevokeRepoSection { repo: String },
    /// Apply several mutations to the same file in one edit.
    Batch(Vec<SvnMutation>),
}

impl SvnMutation {
    pub fn describe(&self) -> String {
        match self {
            SvnMutation::PutPasswdEntry { username, .. } => format!("put passwd entry for {}", username),
            SvnMutation::RemovePasswdEntry { username } => format!("remove passwd entry for {}", username),
            SvnMutation::SetGroupLine { group, .. } => format!("set group line {}", group),
            SvnMutation::EnsureGroupLine { group } => format!("ensure group {}", group),
            SvnMutation::RemoveGroupLine { group } => format!("remove group line {}", group),
            SvnMutation::AddGroupMember { group, username } => format!("add {} to group {}", username, group),
            SvnMutation::RemoveGroupMember { group, username } => format!("remove {} from group {}", username, group),
            SvnMutation::RemoveUserFromAllGroups { username } => format!("remove {} from all groups", username),
            SvnMutation::GrantRepoAccess { repo, group } => format!("grant @{} access to {}", group, repo),
            SvnMutation::RevokeRepoAccessLine { repo, group } => format!("revoke @{} access to {}", group, repo),
            SvnMutation::RevokeRepoSection { repo } => format!("revoke access section of {}", repo),
            SvnMutation::Batch(items) => items
                .iter()
                .map(|m| m.describe())
                .collect::<Vec<_>>()
                .join("; "),
        }
    }

    /// Applies the mutation to the current file content (`None` = the file
    /// does not exist yet). Returns the new state plus the inverse
    /// mutation when the change is invertible.
    pub fn apply(
        &self,
        current: Option<&str>,
    ) -> Result<(NewState, Option<SvnMutation>), AgentError> {
        let content = current.unwrap_or("");
        match self {
            SvnMutation::PutPasswdEntry { username, entry } => {
                put_passwd_entry(content, username, entry)
            }
            SvnMutation::RemovePasswdEntry { username } => remove_passwd_entry(content, username),
            SvnMutation::SetGroupLine { group, members } => set_group_line(content, group, members),
            SvnMutation::EnsureGroupLine { group } => ensure_group_line(content, group),
            SvnMutation::RemoveGroupLine { group } => remove_group_line(content, group),
            SvnMutation::AddGroupMember { group, username } => {
                add_group_member(content, group, username)
            }
            SvnMutation::RemoveGroupMember { group, username } => {
                remove_group_member(content, group, username)
            }
            SvnMutation::RemoveUserFromAllGroups { username } => {
                remove_user_from_all_groups(content, username)
            }
            SvnMutation::GrantRepoAccess { repo, group } => grant_repo_access(content, repo, group),
            SvnMutation::RevokeRepoAccessLine { repo, group } => {
                revoke_repo_access_line(content, repo, group)
            }
            SvnMutation::RevokeRepoSection { repo } => revoke_repo_section(content, repo),
            SvnMutation::Batch(items) => apply_batch(content, items),
        }
    }
}

// --- passwd file -------------------------------------------------------

fn passwd_username(line: &str) -> Option<&str> {
    line.split_once(':').map(|(user, _)| user)
}

fn put_passwd_entry(
    content: &str,
    username: &str,
    entry: &str,
) -> Result<(NewState, Option<SvnMutation>), AgentError> {
    let new_line = format!("{}:{}", username, entry);
    let mut lines: Vec<String> = content.lines().map(String::from).collect();

    if let Some(idx) = lines.iter().position(|l| passwd_username(l) == Some(username)) {
        if lines[idx] == new_line {
            return Ok((NewState::Unchanged, None));
        }
        let old_entry = lines[idx]
            .split_once(':')
            .map(|(_, e)| e.to_string())
            .unwrap_or_default();
        lines[idx] = new_line;
        let inverse = SvnMutation::PutPasswdEntry {
            username: username.to_string(),
            entry: old_entry,
        };
        return Ok((NewState::Content(render_lines(&lines)), Some(inverse)));
    }

    lines.push(new_line);
    let inverse = SvnMutation::RemovePasswdEntry { username: username.to_string() };
    Ok((NewState::Content(render_lines(&lines)), Some(inverse)))
}

fn remove_passwd_entry(
    content: &str,
    username: &str,
) -> Result<(NewState, Option<SvnMutation>), AgentError> {
    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    let Some(idx) = lines.iter().position(|l| passwd_username(l) == Some(username)) else {
        return Ok((NewState::Unchanged, None));
    };
    let old_entry = lines[idx]
        .split_once(':')
        .map(|(_, e)| e.to_string())
        .unwrap_or_default();
    lines.remove(idx);
    let inverse = SvnMutation::PutPasswdEntry { username: username.to_string(), entry: old_entry };
    Ok((NewState::Content(render_lines(&lines)), Some(inverse)))
}

// --- authz file --------------------------------------------------------

const GROUPS_HEADER: &str = "[groups]";

fn section_range(lines: &[String], header: &str) -> Option<(usize, usize)> {
    let start = lines.iter().position(|l| l.trim() == header)?;
    let end = lines[start + 1..]
        .iter()
        .position(|l| l.trim_start().starts_with('['))
        .map(|off| start + 1 + off)
        .unwrap_or(lines.len());
    Some((start, end))
}

fn parse_group_line(line: &str) -> Option<(String, Vec<String>)> {
    let (name, members) = line.split_once('=')?;
    let name = name.trim();
    if name.is_empty() || name.starts_with('[') || name.starts_with('#') {
        return None;
    }
    let members = members
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from)
        .collect();
    Some((name.to_string(), members))
}

fn render_group_line(group: &str, members: &[String]) -> String {
    if members.is_empty() {
        format!("{} =", group)
    } else {
        format!("{} = {}", group, members.join(", "))
    }
}

/// Index of `group`'s line inside `[groups]`, if both exist.
fn group_line_index(lines: &[String], group: &str) -> Option<usize> {
    let (start, end) = section_range(lines, GROUPS_HEADER)?;
    lines[start + 1..end]
        .iter()
        .position(|l| parse_group_line(l).map(|(name, _)| name == group).unwrap_or(false))
        .map(|off| start + 1 + off)
}

/// Ensures a `[groups]` section exists, returning the index right after
/// its header where new group lines can be inserted.
fn ensure_groups_section(lines: &mut Vec<String>) -> usize {
    if let Some((start, _)) = section_range(lines, GROUPS_HEADER) {
        return start + 1;
    }
    if !lines.is_empty() {
        lines.insert(0, String::new());
    }
    lines.insert(0, GROUPS_HEADER.to_string());
    1
}

fn set_group_line(
    content: &str,
    group: &str,
    members: &[String],
) -> Result<(NewState, Option<SvnMutation>), AgentError> {
    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    let new_line = render_group_line(group, members);

    if let Some(idx) = group_line_index(&lines, group) {
        if lines[idx] == new_line {
            return Ok((NewState::Unchanged, None));
        }
        let (_, old_members) = parse_group_line(&lines[idx])
            .ok_or_else(|| AgentError::Internal("group line vanished mid-edit".to_string()))?;
        lines[idx] = new_line;
        let inverse = SvnMutation::SetGroupLine { group: group.to_string(), members: old_members };
        return Ok((NewState::Content(render_lines(&lines)), Some(inverse)));
    }

    let insert_at = ensure_groups_section(&mut lines);
    lines.insert(insert_at, new_line);
    let inverse = SvnMutation::RemoveGroupLine { group: group.to_string() };
    Ok((NewState::Content(render_lines(&lines)), Some(inverse)))
}

fn ensure_group_line(
    content: &str,
    group: &str,
) -> Result<(NewState, Option<SvnMutation>), AgentError> {
    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    if group_line_index(&lines, group).is_some() {
        return Ok((NewState::Unchanged, None));
    }
    let insert_at = ensure_groups_section(&mut lines);
    lines.insert(insert_at, render_group_line(group, &[]));
    let inverse = SvnMutation::RemoveGroupLine { group: group.to_string() };
    Ok((NewState::Content(render_lines(&lines)), Some(inverse)))
}

fn remove_group_line(
    content: &str,
    group: &str,
) -> Result<(NewState, Option<SvnMutation>), AgentError> {
    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    let Some(idx) = group_line_index(&lines, group) else {
        return Ok((NewState::Unchanged, None));
    };
    let (_, old_members) = parse_group_line(&lines[idx])
        .ok_or_else(|| AgentError::Internal("group line vanished mid-edit".to_string()))?;
    lines.remove(idx);
    let inverse = SvnMutation::SetGroupLine { group: group.to_string(), members: old_members };
    Ok((NewState::Content(render_lines(&lines)), Some(inverse)))
}

fn add_group_member(
    content: &str,
    group: &str,
    username: &str,
) -> Result<(NewState, Option<SvnMutation>), AgentError> {
    let mut lines: Vec<String> = content.lines().map(String::from).collect();

    if let Some(idx) = group_line_index(&lines, group) {
        let (name, mut members) = parse_group_line(&lines[idx])
            .ok_or_else(|| AgentError::Internal("group line vanished mid-edit".to_string()))?;
        if members.iter().any(|m| m == username) {
            return Ok((NewState::Unchanged, None));
        }
        members.push(username.to_string());
        lines[idx] = render_group_line(&name, &members);
        let inverse = SvnMutation::RemoveGroupMember {
            group: group.to_string(),
            username: username.to_string(),
        };
        return Ok((NewState::Content(render_lines(&lines)), Some(inverse)));
    }

    let insert_at = ensure_groups_section(&mut lines);
    lines.insert(insert_at, render_group_line(group, &[username.to_string()]));
    let inverse = SvnMutation::RemoveGroupLine { group: group.to_string() };
    Ok((NewState::Content(render_lines(&lines)), Some(inverse)))
}

fn remove_group_member(
    content: &str,
    group: &str,
    username: &str,
) -> Result<(NewState, Option<SvnMutation>), AgentError> {
    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    let Some(idx) = group_line_index(&lines, group) else {
        return Ok((NewState::Unchanged, None));
    };
    let (name, mut members) = parse_group_line(&lines[idx])
        .ok_or_else(|| AgentError::Internal("group line vanished mid-edit".to_string()))?;
    let before = members.len();
    members.retain(|m| m != username);
    if members.len() == before {
        return Ok((NewState::Unchanged, None));
    }
    lines[idx] = render_group_line(&name, &members);
    let inverse = SvnMutation::AddGroupMember {
        group: group.to_string(),
        username: username.to_string(),
    };
    Ok((NewState::Content(render_lines(&lines)), Some(inverse)))
}

fn remove_user_from_all_groups(
    content: &str,
    username: &str,
) -> Result<(NewState, Option<SvnMutation>), AgentError> {
    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    let Some((start, end)) = section_range(&lines, GROUPS_HEADER) else {
        return Ok((NewState::Unchanged, None));
    };

    let mut removed_from = Vec::new();
    for line in lines[start + 1..end].iter_mut() {
        let Some((name, mut members)) = parse_group_line(line) else { continue };
        let before = members.len();
        members.retain(|m| m != username);
        if members.len() != before {
            removed_from.push(name.clone());
            *line = render_group_line(&name, &members);
        }
    }

    if removed_from.is_empty() {
        return Ok((NewState::Unchanged, None));
    }
    let inverse = SvnMutation::Batch(
        removed_from
            .into_iter()
            .map(|group| SvnMutation::AddGroupMember { group, username: username.to_string() })
            .collect(),
    );
    Ok((NewState::Content(render_lines(&lines)), Some(inverse)))
}

fn repo_header(repo: &str) -> String {
    format!("[{}:/]", repo)
}

fn grant_repo_access(
    content: &str,
    repo: &str,
    group: &str,
) -> Result<(NewState, Option<SvnMutation>), AgentError> {
    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    let header = repo_header(repo);
    let access_line = format!("@{} = rw", group);

    if let Some((start, end)) = section_range(&lines, &header) {
        if lines[start + 1..end].iter().any(|l| l.trim() == access_line) {
            return Ok((NewState::Unchanged, None));
        }
        lines.insert(end, access_line);
        let inverse = SvnMutation::RevokeRepoAccessLine {
            repo: repo.to_string(),
            group: group.to_string(),
        };
        return Ok((NewState::Content(render_lines(&lines)), Some(inverse)));
    }

    if !lines.is_empty() {
        lines.push(String::new());
    }
    lines.push(header);
    lines.push(access_line);
    let inverse = SvnMutation::RevokeRepoSection { repo: repo.to_string() };
    Ok((NewState::Content(render_lines(&lines)), Some(inverse)))
}

fn revoke_repo_access_line(
    content: &str,
    repo: &str,
    group: &str,
) -> Result<(NewState, Option<SvnMutation>), AgentError> {
    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    let header = repo_header(repo);
    let access_line = format!("@{} = rw", group);
    let Some((start, end)) = section_range(&lines, &header) else {
        return Ok((NewState::Unchanged, None));
    };
    let Some(off) = lines[start + 1..end].iter().position(|l| l.trim() == access_line) else {
        return Ok((NewState::Unchanged, None));
    };
    lines.remove(start + 1 + off);
    let inverse = SvnMutation::GrantRepoAccess { repo: repo.to_string(), group: group.to_string() };
    Ok((NewState::Content(render_lines(&lines)), Some(inverse)))
}

fn revoke_repo_section(
    content: &str,
    repo: &str,
) -> Result<(NewState, Option<SvnMutation>), AgentError> {
    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    let Some((start, mut end)) = section_range(&lines, &repo_header(repo)) else {
        return Ok((NewState::Unchanged, None));
    };
    // Take the blank separator above the header with it.
    let mut start = start;
    if start > 0 && lines[start - 1].trim().is_empty() {
        start -= 1;
    }
    while end > start && end <= lines.len() && end > 0 && lines[end - 1].trim().is_empty() {
        end -= 1;
    }
    lines.drain(start..end);
    Ok((NewState::Content(render_lines(&lines)), None))
}

fn apply_batch(
    content: &str,
    items: &[SvnMutation],
) -> Result<(NewState, Option<SvnMutation>), AgentError> {
    let mut working = content.to_string();
    let mut changed = false;
    let mut inverses = Vec::new();

    for item in items {
        let (state, inverse) = item.apply(Some(&working))?;
        match state {
            NewState::Unchanged => {}
            NewState::Content(new_content) => {
                working = new_content;
                changed = true;
            }
            NewState::Absent => {
                return Err(AgentError::Internal(
                    "batch mutations cannot remove the file".to_string(),
                ));
            }
        }
        if let Some(inv) = inverse {
            inverses.push(inv);
        }
    }

    if !changed {
        return Ok((NewState::Unchanged, None));
    }
    inverses.reverse();
    let inverse = if inverses.is_empty() { None } else { Some(SvnMutation::Batch(inverses)) };
    Ok((NewState::Content(working), inverse))
}

fn render_lines(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content_of(state: NewState) -> String {
        match state {
            NewState::Content(c) => c,
            NewState::Unchanged => panic!("expected a change"),
            NewState::Absent => panic!("unexpected removal"),
        }
    }

    #[test]
    fn htpasswd_entry_matches_the_apache_sha_scheme() {
        assert_eq!(htpasswd_entry("password"), "{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=");
    }

    #[test]
    fn put_passwd_entry_appends_and_inverts_to_removal() {
        let m = SvnMutation::PutPasswdEntry {
            username: "alice".to_string(),
            entry: "{SHA}abc=".to_string(),
        };
        let (state, inverse) = m.apply(None).unwrap();
        assert_eq!(content_of(state), "alice:{SHA}abc=\n");
        assert_eq!(inverse, Some(SvnMutation::RemovePasswdEntry { username: "alice".to_string() }));
    }

    #[test]
    fn put_passwd_entry_is_idempotent() {
        let m = SvnMutation::PutPasswdEntry {
            username: "alice".to_string(),
            entry: "{SHA}abc=".to_string(),
        };
        let (state, inverse) = m.apply(Some("alice:{SHA}abc=\n")).unwrap();
        assert!(matches!(state, NewState::Unchanged));
        assert!(inverse.is_none());
    }

    #[test]
    fn put_passwd_entry_replaces_and_inverts_to_old_entry() {
        let m = SvnMutation::PutPasswdEntry {
            username: "alice".to_string(),
            entry: "{SHA}new=".to_string(),
        };
        let (state, inverse) = m.apply(Some("alice:{SHA}old=\nbob:{SHA}b=\n")).unwrap();
        assert_eq!(content_of(state), "alice:{SHA}new=\nbob:{SHA}b=\n");
        assert_eq!(
            inverse,
            Some(SvnMutation::PutPasswdEntry {
                username: "alice".to_string(),
                entry: "{SHA}old=".to_string()
            })
        );
    }

    #[test]
    fn remove_passwd_entry_only_touches_the_named_user() {
        let m = SvnMutation::RemovePasswdEntry { username: "alice".to_string() };
        let (state, inverse) = m.apply(Some("alice:{SHA}a=\nbob:{SHA}b=\n")).unwrap();
        assert_eq!(content_of(state), "bob:{SHA}b=\n");
        assert_eq!(
            inverse,
            Some(SvnMutation::PutPasswdEntry {
                username: "alice".to_string(),
                entry: "{SHA}a=".to_string()
            })
        );
    }

    #[test]
    fn add_group_member_creates_the_groups_section_when_missing() {
        let m = SvnMutation::AddGroupMember {
            group: "everyone".to_string(),
            username: "alice".to_string(),
        };
        let (state, inverse) = m.apply(None).unwrap();
        assert_eq!(content_of(state), "[groups]\neveryone = alice\n");
        assert_eq!(inverse, Some(SvnMutation::RemoveGroupLine { group: "everyone".to_string() }));
    }

    #[test]
    fn add_group_member_appends_to_an_existing_group() {
        let authz = "[groups]\neveryone = alice\n\n[proj:/]\n@everyone = rw\n";
        let m = SvnMutation::AddGroupMember {
            group: "everyone".to_string(),
            username: "bob".to_string(),
        };
        let (state, inverse) = m.apply(Some(authz)).unwrap();
        assert_eq!(
            content_of(state),
            "[groups]\neveryone = alice, bob\n\n[proj:/]\n@everyone = rw\n"
        );
        assert_eq!(
            inverse,
            Some(SvnMutation::RemoveGroupMember {
                group: "everyone".to_string(),
                username: "bob".to_string()
            })
        );
    }

    #[test]
    fn add_group_member_is_idempotent() {
        let authz = "[groups]\neveryone = alice\n";
        let m = SvnMutation::AddGroupMember {
            group: "everyone".to_string(),
            username: "alice".to_string(),
        };
        let (state, _) = m.apply(Some(authz)).unwrap();
        assert!(matches!(state, NewState::Unchanged));
    }

    #[test]
    fn remove_user_from_all_groups_inverts_to_a_batch() {
        let authz = "[groups]\neveryone = alice, bob\ndevs = alice\nops = bob\n";
        let m = SvnMutation::RemoveUserFromAllGroups { username: "alice".to_string() };
        let (state, inverse) = m.apply(Some(authz)).unwrap();
        assert_eq!(content_of(state), "[groups]\neveryone = bob\ndevs =\nops = bob\n");
        let Some(SvnMutation::Batch(items)) = inverse else { panic!("expected batch inverse") };
        assert_eq!(items.len(), 2);
        assert!(items.contains(&SvnMutation::AddGroupMember {
            group: "everyone".to_string(),
            username: "alice".to_string()
        }));
        assert!(items.contains(&SvnMutation::AddGroupMember {
            group: "devs".to_string(),
            username: "alice".to_string()
        }));
    }

    #[test]
    fn grant_repo_access_creates_a_section_and_inverts_to_its_removal() {
        let authz = "[groups]\neveryone = alice\n";
        let m = SvnMutation::GrantRepoAccess {
            repo: "proj".to_string(),
            group: "everyone".to_string(),
        };
        let (state, inverse) = m.apply(Some(authz)).unwrap();
        let new_content = content_of(state);
        assert_eq!(new_content, "[groups]\neveryone = alice\n\n[proj:/]\n@everyone = rw\n");
        assert_eq!(inverse, Some(SvnMutation::RevokeRepoSection { repo: "proj".to_string() }));

        // Applying the inverse restores the original content.
        let inverse = inverse.unwrap();
        let (restored, _) = inverse.apply(Some(&new_content)).unwrap();
        assert_eq!(content_of(restored), authz);
    }

    #[test]
    fn batch_applies_in_order_and_inverts_in_reverse() {
        let m = SvnMutation::Batch(vec![
            SvnMutation::AddGroupMember {
                group: "everyone".to_string(),
                username: "alice".to_string(),
            },
            SvnMutation::AddGroupMember {
                group: "everyone".to_string(),
                username: "bob".to_string(),
            },
        ]);
        let (state, inverse) = m.apply(None).unwrap();
        let content = content_of(state);
        assert_eq!(content, "[groups]\neveryone = alice, bob\n");

        let Some(inverse) = inverse else { panic!("expected an inverse") };
        let (restored, _) = inverse.apply(Some(&content)).unwrap();
        // Undoing both additions leaves no members; the group line created
        // for alice is removed entirely.
        assert_eq!(content_of(restored), "[groups]\n");
    }
}
