//! Input validation for values that end up on a runtime command line.

use super::error::{BackendError, BackendResult};

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
/// Valid characters: alphanumeric, `.`, `-`, `_`, `/`, `:`, `@`
pub fn validate_image_name(image: &str) -> BackendResult<()> {
    if image.is_empty() {
        return Err(BackendError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(BackendError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };

    if !image.chars().all(valid_chars) {
        return Err(BackendError::InvalidInput(format!(
            "image name '{}' contains invalid characters; only alphanumeric, '.', '-', '_', '/', ':', '@' are allowed",
            image
        )));
    }

    if image.contains("..") {
        return Err(BackendError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container ID, container name or pod name.
///
/// Container IDs are hex strings, names are alphanumeric with `-` and `_`.
pub fn validate_handle_id(id: &str) -> BackendResult<()> {
    if id.is_empty() {
        return Err(BackendError::InvalidInput(
            "environment id cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(BackendError::InvalidInput(
            "environment id exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) {
        return Err(BackendError::InvalidInput(format!(
            "environment id '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Validate a Kubernetes namespace (RFC 1123 label).
pub fn validate_namespace(namespace: &str) -> BackendResult<()> {
    if namespace.is_empty() || namespace.len() > 63 {
        return Err(BackendError::InvalidInput(format!(
            "namespace '{}' must be 1-63 characters",
            namespace
        )));
    }

    let valid_chars = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-';
    if !namespace.chars().all(valid_chars)
        || namespace.starts_with('-')
        || namespace.ends_with('-')
    {
        return Err(BackendError::InvalidInput(format!(
            "namespace '{}' must be lowercase alphanumeric with inner '-'",
            namespace
        )));
    }

    Ok(())
}

/// Validate an environment variable key.
///
/// POSIX conventions: alphanumeric and underscores, starting with a letter or
/// underscore.
pub fn validate_env_var_key(key: &str) -> BackendResult<()> {
    let Some(first_char) = key.chars().next() else {
        return Err(BackendError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    };

    if key.len() > 256 {
        return Err(BackendError::InvalidInput(
            "environment variable key exceeds maximum length of 256 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(BackendError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '_';
    if !key.chars().all(valid_chars) {
        return Err(BackendError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters; only alphanumeric and '_' are allowed",
            key
        )));
    }

    Ok(())
}

/// Validate a path inside the environment.
pub fn validate_container_path(path: &str) -> BackendResult<()> {
    if path.is_empty() {
        return Err(BackendError::InvalidInput(
            "container path cannot be empty".to_string(),
        ));
    }

    if !path.starts_with('/') {
        return Err(BackendError::InvalidInput(
            "container path must be absolute (start with '/')".to_string(),
        ));
    }

    if path.contains('\0') || path.contains('\n') {
        return Err(BackendError::InvalidInput(
            "container path cannot contain null bytes or newlines".to_string(),
        ));
    }

    Ok(())
}

/// Resolve a remote path against `workdir` and collapse `.`/`..` lexically.
///
/// Relative paths are taken relative to the working directory. A `..` that
/// would climb above `/` is rejected instead of being clamped.
pub fn normalize_remote_path(path: &str, workdir: &str) -> BackendResult<String> {
    if path.is_empty() {
        return Err(BackendError::InvalidInput(
            "remote path cannot be empty".to_string(),
        ));
    }
    if path.contains('\0') || path.contains('\n') {
        return Err(BackendError::InvalidInput(
            "remote path cannot contain null bytes or newlines".to_string(),
        ));
    }

    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(BackendError::InvalidInput(format!(
                        "'{}' escapes the filesystem root",
                        path
                    )));
                }
            }
            other => parts.push(other),
        }
    }

    Ok(format!("/{}", parts.join("/")))
}

/// Whether a normalized path lies at or below one of `roots`.
pub fn is_within_roots(path: &str, roots: &[String]) -> bool {
    roots.iter().any(|root| {
        let root = root.trim_end_matches('/');
        root.is_empty() || path == root || path.starts_with(&format!("{}/", root))
    })
}

/// Split a normalized absolute path into parent directory and final component.
///
/// Returns `None` for `/`, which has no final component.
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    let idx = path.rfind('/')?;
    let name = &path[idx + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Some((parent, name))
}
