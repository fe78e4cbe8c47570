//! Primitive state-tree operations and their one-line wire form.

use std::fmt;

use crate::errors::MachineError;
use crate::path::{self, ROOT};

/// One primitive operation. Paths are stored normalized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    /// `P <path>`: ensure the path exists.
    Path(String),
    /// `C <path> <child>`: select the current child of a variable parent.
    Current { path: String, child: String },
    /// `D <path> <value>`: replace leaf data.
    Set { path: String, value: String },
    /// `A <path> <value>`: append to leaf data.
    Append { path: String, value: String },
    /// `E`: reset to the bare root.
    Empty,
    /// `X <path>`: delete a leaf.
    Delete(String),
}

impl Op {
    /// Parse one line. Blank lines and `#` comments yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, MachineError> {
        let line = line.trim();
        let Some(verb) = line.chars().next() else {
            return Ok(None);
        };
        if verb == '#' {
            return Ok(None);
        }
        let rest = &line[verb.len_utf8()..];
        let syntax = || MachineError::Syntax {
            op: verb,
            line: line.to_string(),
        };
        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            return Err(match verb {
                'E' => MachineError::EmptyNotAlone,
                'P' | 'C' | 'D' | 'A' | 'X' => syntax(),
                _ => MachineError::BadCommand(line.to_string()),
            });
        }

        let op = match verb {
            'P' => {
                let (raw, tail) = split_token(rest);
                if !tail.trim().is_empty() {
                    return Err(syntax());
                }
                Self::Path(path::normalize(raw)?)
            }
            'C' => {
                let (raw, tail) = split_token(rest);
                let (child, tail) = split_token(tail);
                if raw.is_empty() || !path::is_valid_name(child) || !tail.trim().is_empty() {
                    return Err(syntax());
                }
                let raw = if raw == "/" { ROOT } else { raw.strip_suffix('/').unwrap_or(raw) };
                Self::Current {
                    path: path::normalize(raw)?,
                    child: child.to_ascii_lowercase(),
                }
            }
            'D' | 'A' => {
                let (raw, tail) = split_token(rest);
                if raw.is_empty() {
                    return Err(syntax());
                }
                let path = path::normalize(raw)?;
                let value = tail.trim_start().to_string();
                if verb == 'D' {
                    Self::Set { path, value }
                } else {
                    Self::Append { path, value }
                }
            }
            'X' => {
                let (raw, tail) = split_token(rest);
                if raw.is_empty() || !tail.trim().is_empty() {
                    return Err(syntax());
                }
                Self::Delete(path::normalize(raw)?)
            }
            'E' => {
                if !rest.trim().is_empty() {
                    return Err(MachineError::EmptyNotAlone);
                }
                Self::Empty
            }
            _ => return Err(MachineError::BadCommand(line.to_string())),
        };
        Ok(Some(op))
    }

    /// Parse a whole block. `E` must be the only op in its block.
    pub fn parse_block<I, S>(lines: I) -> Result<Vec<Self>, MachineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ops = Vec::new();
        for line in lines {
            if let Some(op) = Self::parse(line.as_ref())? {
                ops.push(op);
            }
        }
        if ops.len() > 1 && ops.contains(&Self::Empty) {
            return Err(MachineError::EmptyNotAlone);
        }
        Ok(ops)
    }

    pub fn verb(&self) -> char {
        match self {
            Self::Path(_) => 'P',
            Self::Current { .. } => 'C',
            Self::Set { .. } => 'D',
            Self::Append { .. } => 'A',
            Self::Empty => 'E',
            Self::Delete(_) => 'X',
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) if path.is_empty() => f.write_str("P"),
            Self::Path(path) => write!(f, "P {path}"),
            Self::Current { path, child } if path.is_empty() => write!(f, "C / {child}"),
            Self::Current { path, child } => write!(f, "C {path} {child}"),
            Self::Set { path, value } | Self::Append { path, value } if value.is_empty() => {
                write!(f, "{} {path}", self.verb())
            }
            Self::Set { path, value } | Self::Append { path, value } => {
                write!(f, "{} {path} {value}", self.verb())
            }
            Self::Empty => f.write_str("E"),
            Self::Delete(path) => write!(f, "X {path}"),
        }
    }
}

/// Split off the first whitespace-delimited token; the tail keeps its
/// leading whitespace.
fn split_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], &s[pos..]),
        None => (s, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Op {
        Op::parse(line).unwrap().unwrap()
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        assert_eq!(Op::parse("").unwrap(), None);
        assert_eq!(Op::parse("   ").unwrap(), None);
        assert_eq!(Op::parse("# P .a").unwrap(), None);
    }

    #[test]
    fn parse_each_verb() {
        assert_eq!(parse("P .Hinge/Open"), Op::Path(".hinge/open".into()));
        assert_eq!(parse("P"), Op::Path(String::new()));
        assert_eq!(parse("P "), Op::Path(String::new()));
        assert_eq!(
            parse("C .hinge closed"),
            Op::Current { path: ".hinge".into(), child: "closed".into() }
        );
        assert_eq!(
            parse("C .hinge/ closed"),
            Op::Current { path: ".hinge".into(), child: "closed".into() }
        );
        assert_eq!(
            parse("C / b"),
            Op::Current { path: String::new(), child: "b".into() }
        );
        assert_eq!(
            parse("D .bolt/locked foo bar  "),
            Op::Set { path: ".bolt/locked".into(), value: "foo bar".into() }
        );
        assert_eq!(
            parse("D .bolt/locked"),
            Op::Set { path: ".bolt/locked".into(), value: String::new() }
        );
        assert_eq!(
            parse("A .log   line one"),
            Op::Append { path: ".log".into(), value: "line one".into() }
        );
        assert_eq!(parse("E"), Op::Empty);
        assert_eq!(parse("X .a.b"), Op::Delete(".a.b".into()));
    }

    #[test]
    fn value_case_is_preserved() {
        assert_eq!(
            parse("D .A MixedCase"),
            Op::Set { path: ".a".into(), value: "MixedCase".into() }
        );
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(Op::parse("P foo"), Err(MachineError::BadPath(_))));
        assert!(matches!(Op::parse("P .a .b"), Err(MachineError::Syntax { op: 'P', .. })));
        assert!(matches!(Op::parse("C .hinge"), Err(MachineError::Syntax { op: 'C', .. })));
        assert!(matches!(Op::parse("D"), Err(MachineError::Syntax { op: 'D', .. })));
        assert!(matches!(Op::parse("Pfoo"), Err(MachineError::Syntax { .. })));
        assert!(matches!(Op::parse("E now"), Err(MachineError::EmptyNotAlone)));
        assert!(matches!(Op::parse("Z .a"), Err(MachineError::BadCommand(_))));
    }

    #[test]
    fn empty_must_stand_alone() {
        assert_eq!(Op::parse_block(["E"]).unwrap(), vec![Op::Empty]);
        assert_eq!(Op::parse_block(["# reset", "E", ""]).unwrap(), vec![Op::Empty]);
        assert!(matches!(
            Op::parse_block(["E", "P .a"]),
            Err(MachineError::EmptyNotAlone)
        ));
    }

    #[test]
    fn display_is_reparseable() {
        for line in [
            "P",
            "P .hinge/open",
            "C .hinge closed",
            "C / b",
            "D .bolt/locked foo",
            "D .bolt/locked",
            "A .log x y",
            "A .log",
            "E",
            "X .a",
        ] {
            let op = parse(line);
            assert_eq!(op.to_string(), line);
            assert_eq!(parse(&op.to_string()), op);
        }
    }
}
