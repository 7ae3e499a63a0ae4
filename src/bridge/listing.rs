//! Parser for the helper's directory-walk output.
//!
//! The helper emits one line per entry: a one-character type marker (`d` or
//! `f`) immediately followed by the entry's path, in depth-first pre-order
//! starting at `.`. A node's children are exactly the subsequent entries
//! whose path has the node's path as a prefix, up to the first entry that is
//! not such a prefix.

use serde::Serialize;

use crate::errors::{BridgeError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileNode {
    pub name: String,
    pub isdir: bool,
    pub children: Vec<FileNode>,
}

impl FileNode {
    pub fn file(name: impl Into<String>) -> FileNode {
        FileNode {
            name: name.into(),
            isdir: false,
            children: Vec::new(),
        }
    }

    pub fn dir(name: impl Into<String>, children: Vec<FileNode>) -> FileNode {
        FileNode {
            name: name.into(),
            isdir: true,
            children,
        }
    }
}

/// Parse the marker lines into a tree rooted at the listed directory. The
/// root node carries an empty name.
pub fn parse_listing(text: &str) -> Result<FileNode> {
    let mut entries: Vec<(bool, String)> = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (isdir, path) = if let Some(p) = line.strip_prefix('d') {
            (true, p)
        } else if let Some(p) = line.strip_prefix('f') {
            (false, p)
        } else {
            return Err(BridgeError::protocol(format!(
                "unknown listing marker in {:?}",
                line
            )));
        };
        entries.push((isdir, path.to_string()));
    }

    let mut idx = 0;
    // The walk lists its starting point first.
    if entries.first().map(|(_, p)| p.as_str()) == Some(".") {
        idx = 1;
    }
    let children = build_children(&entries, &mut idx, ".");
    if idx < entries.len() {
        return Err(BridgeError::protocol(format!(
            "listing entry {:?} outside the walked tree",
            entries[idx].1
        )));
    }
    Ok(FileNode {
        name: String::new(),
        isdir: true,
        children,
    })
}

fn build_children(entries: &[(bool, String)], idx: &mut usize, prefix: &str) -> Vec<FileNode> {
    let mut out = Vec::new();
    let want = format!("{}/", prefix);
    while *idx < entries.len() {
        let (isdir, path) = &entries[*idx];
        if !path.starts_with(&want) {
            break;
        }
        *idx += 1;
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        let children = if *isdir {
            build_children(entries, idx, path)
        } else {
            Vec::new()
        };
        out.push(FileNode {
            name,
            isdir: *isdir,
            children,
        });
    }
    out
}
