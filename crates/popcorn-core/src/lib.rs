//! State-tree model shared by every popcorn crate.
//!
//! A [`Machine`] is a path-keyed tree of concurrent parents, variable
//! parents and data leaves, mutated only through atomic blocks of [`Op`]s.

pub mod errors;
pub mod ids;
pub mod machine;
pub mod ops;
pub mod path;

pub use errors::MachineError;
pub use machine::{join_ops, BlockListener, Data, Machine, SharedMachine, MAX_DATA_LENGTH};
pub use ops::Op;
pub use path::Edge;

/// Machine names are a single lowercase alphanumeric token.
pub fn is_valid_machine_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}
