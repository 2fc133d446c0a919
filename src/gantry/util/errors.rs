use std::fmt;

use crate::core::interning::InternedString;

pub type GantryResult<T> = anyhow::Result<T>;

/// An error for conditions that are a bug in gantry itself rather than a
/// mistake in the user's build description.
pub fn internal<S: fmt::Display>(error: S) -> anyhow::Error {
    anyhow::format_err!("internal error: {}", error)
}

/// A dependency cycle found while closing a module set to link order.
///
/// The cycle is diagnosed when an archive or executable rule is realized,
/// not when the dependency scanner runs; scan output is allowed to contain
/// cycles that no link closure ever walks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    pub modules: Vec<InternedString>,
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dependency cycle between modules: ")?;
        for (i, m) in self.modules.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{}", m)?;
        }
        Ok(())
    }
}

impl std::error::Error for CycleError {}
