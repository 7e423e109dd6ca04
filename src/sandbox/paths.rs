//! Workspace path containment and the single path-hiding egress filter.

use crate::errors::{ServerError, ServerResult};
use std::path::{Component, Path, PathBuf};

/// Normalize a path lexically (without touching the filesystem).
/// Resolves `.` and `..` components so that `/workspace/u/../etc/passwd`
/// correctly normalizes to `/workspace/etc/passwd` rather than passing
/// through as if it stays under `/workspace/u`.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                // Pop the last normal component (but never pop past root)
                if matches!(components.last(), Some(Component::Normal(_))) {
                    components.pop();
                } else if !matches!(components.first(), Some(Component::RootDir)) {
                    // Relative path escaping upward keeps its ".." so the
                    // containment check below can reject it.
                    components.push(component);
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// A user id doubles as a directory name inside the shared volume, so it must
/// be a single safe path component.
pub fn validate_user_id(user_id: &str) -> ServerResult<&str> {
    let trimmed = user_id.trim();
    let ok = !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && trimmed != "."
        && trimmed != "..";
    if ok {
        Ok(trimmed)
    } else {
        Err(ServerError::PathEscape(format!(
            "invalid user id '{}'",
            user_id
        )))
    }
}

/// Absolute workspace path for a user inside the sandbox.
pub fn workspace_path(root: &str, user_id: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), user_id)
}

/// Validate a workspace-relative path lexically: it must stay inside the
/// user's workspace after resolving `.`/`..`. Symbolic links are pinned by
/// the in-container `realpath` guard; this is the cheap host-side layer.
/// Returns the normalized relative path (empty string = the workspace root).
pub fn validate_relative(relative: &str) -> ServerResult<String> {
    let raw = relative.trim();
    if raw.starts_with('/') {
        return Err(ServerError::PathEscape(format!(
            "absolute paths are not allowed: {}",
            relative
        )));
    }
    let normalized = lexical_normalize(Path::new(raw));
    if normalized
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(ServerError::PathEscape(relative.to_string()));
    }
    Ok(normalized.to_string_lossy().into_owned())
}

/// The single egress filter hiding physical workspace paths from callers:
/// every occurrence of the absolute workspace path becomes `.` so the agent
/// never sees (or echoes) which tenant directory it runs in.
pub fn hide_workspace_paths(text: &str, workspace: &str) -> String {
    text.replace(workspace, ".")
}

/// Build the in-container guard that pins `relative` under `workspace` after
/// resolving symlinks, then runs `body` with `$target` bound. Escapes exit
/// with the dedicated path-escape code.
pub fn guarded_script(workspace: &str, relative: &str, body: &str) -> String {
    let quoted = shlex::try_quote(if relative.is_empty() { "." } else { relative })
        .map(std::borrow::Cow::into_owned)
        .unwrap_or_else(|_| format!("'{}'", relative.replace('\'', "'\\''")));
    format!(
        "set -e\n\
         target=$(realpath -m -- {quoted})\n\
         case \"$target\" in\n\
           '{ws}'/*|'{ws}') ;;\n\
           *) echo 'path-escape' >&2; exit {code} ;;\n\
         esac\n\
         {body}",
        quoted = quoted,
        ws = workspace,
        code = super::PATH_ESCAPE_EXIT_CODE,
        body = body,
    )
}
