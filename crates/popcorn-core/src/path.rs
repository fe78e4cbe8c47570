//! Path grammar.
//!
//! A path is a run of `<sep><name>` segments where `.` marks a concurrent
//! edge and `/` a variable edge. The root is the empty string.

use serde::Serialize;

use crate::errors::MachineError;

pub const ROOT: &str = "";

/// Edge kind between a parent and its children.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Concurrent,
    Variable,
}

impl Edge {
    pub fn separator(self) -> char {
        match self {
            Self::Concurrent => '.',
            Self::Variable => '/',
        }
    }

    pub fn from_separator(c: char) -> Option<Self> {
        match c {
            '.' => Some(Self::Concurrent),
            '/' => Some(Self::Variable),
            _ => None,
        }
    }
}

pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Validate `raw` and return its lowercased form.
pub fn normalize(raw: &str) -> Result<String, MachineError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(ROOT.to_string());
    }
    let mut segment_len = 0usize;
    for (i, c) in raw.chars().enumerate() {
        if Edge::from_separator(c).is_some() {
            if i > 0 && segment_len == 0 {
                return Err(MachineError::BadPath(raw.to_string()));
            }
            segment_len = 0;
        } else if i == 0 || !(c.is_ascii_alphanumeric() || c == '-') {
            return Err(MachineError::BadPath(raw.to_string()));
        } else {
            segment_len += 1;
        }
    }
    if segment_len == 0 {
        return Err(MachineError::BadPath(raw.to_string()));
    }
    Ok(raw.to_ascii_lowercase())
}

/// Split a normalized non-root path into `(parent, edge, name)`.
pub fn split_last(path: &str) -> Option<(&str, Edge, &str)> {
    let pos = path.rfind(['.', '/'])?;
    let edge = Edge::from_separator(path[pos..].chars().next()?)?;
    Some((&path[..pos], edge, &path[pos + 1..]))
}

pub fn join(parent: &str, edge: Edge, name: &str) -> String {
    format!("{parent}{}{name}", edge.separator())
}
