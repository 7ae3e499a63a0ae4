/*!
Input validation for everything a remote caller supplies.

These values end up interpolated into shell commands that run with elevated
privilege inside helper containers, and in container names handed to the
engine. Validation is the sole defense: reject before any runtime call is
made, never sanitize-and-continue.
*/

use once_cell::sync::Lazy;

use crate::errors::{BridgeError, Result};

pub const MAX_NAME_LEN: usize = 63;
pub const MAX_IMAGE_LEN: usize = 128;
pub const MAX_PATH_LEN: usize = 255;

/// Per-byte allow table for path characters.
static PATH_ALLOWED: Lazy<[bool; 256]> = Lazy::new(|| {
    let mut t = [false; 256];
    for b in 0u8..=255 {
        t[b as usize] = b.is_ascii_alphanumeric() || matches!(b, b' ' | b'.' | b'_' | b'/' | b'-');
    }
    t
});

/// Container names: alphanumeric start, then alphanumeric plus `_ . -`,
/// bounded length. Matches the engine's own naming constraints.
pub fn check_container_name(name: &str, field: &'static str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(BridgeError::validation(
            field,
            format!("must be 1..={} characters", MAX_NAME_LEN),
        ));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap_or('\0');
    if !first.is_ascii_alphanumeric() {
        return Err(BridgeError::validation(
            field,
            "must start with an alphanumeric character",
        ));
    }
    for c in chars {
        if !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
            return Err(BridgeError::validation(
                field,
                format!("character {:?} not allowed in a container name", c),
            ));
        }
    }
    Ok(())
}

/// Image references: lowercase repository path segments joined by `/`,
/// optional `:tag`.
pub fn check_image_name(image: &str, field: &'static str) -> Result<()> {
    if image.is_empty() || image.len() > MAX_IMAGE_LEN {
        return Err(BridgeError::validation(
            field,
            format!("must be 1..={} characters", MAX_IMAGE_LEN),
        ));
    }
    let (repo, tag) = match image.split_once(':') {
        Some((r, t)) => (r, Some(t)),
        None => (image, None),
    };
    for segment in repo.split('/') {
        if segment.is_empty() {
            return Err(BridgeError::validation(field, "empty repository segment"));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        {
            return Err(BridgeError::validation(
                field,
                format!("repository segment {:?} not allowed", segment),
            ));
        }
    }
    if let Some(tag) = tag {
        if tag.is_empty()
            || !tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(BridgeError::validation(field, "malformed image tag"));
        }
    }
    Ok(())
}

/// Links come in as `name:alias`; both halves must be valid container names.
pub fn check_link(link: &str, field: &'static str) -> Result<()> {
    match link.split_once(':') {
        Some((name, alias)) => {
            check_container_name(name, field)?;
            check_container_name(alias, field)
        }
        None => check_container_name(link, field),
    }
}

/// Paths inside a data container. Allow-listed characters only, no `..`
/// segment anywhere, no leading `-` (option injection into the helper
/// command), bounded length.
pub fn check_path(path: &str, field: &'static str) -> Result<()> {
    if path.is_empty() || path.len() > MAX_PATH_LEN {
        return Err(BridgeError::validation(
            field,
            format!("must be 1..={} characters", MAX_PATH_LEN),
        ));
    }
    if path.starts_with('-') {
        return Err(BridgeError::validation(field, "must not start with '-'"));
    }
    for b in path.bytes() {
        if !PATH_ALLOWED[b as usize] {
            return Err(BridgeError::validation(
                field,
                format!("character {:?} not allowed in a path", b as char),
            ));
        }
    }
    if path.split('/').any(|seg| seg == "..") {
        return Err(BridgeError::validation(field, "path traversal not allowed"));
    }
    Ok(())
}

/// File names inside the host staging directory: path rules, and additionally
/// no `/` so a caller cannot point outside the staging area.
pub fn check_transfer_name(name: &str, field: &'static str) -> Result<()> {
    check_path(name, field)?;
    if name.contains('/') {
        return Err(BridgeError::validation(
            field,
            "must be a plain file name without '/'",
        ));
    }
    Ok(())
}
