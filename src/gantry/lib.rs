//! Gantry is the rule-generation core of a build system for OCaml
//! projects. It consumes typed per-directory build stanzas and produces a
//! *rule graph*: a list of build edges, each declaring its input paths, its
//! target paths and the action that turns the former into the latter.
//!
//! Scheduling, hashing and action execution belong to an external build
//! engine. The contract with that engine is spelled out on [`core::build`]:
//! every path an action reads is declared as an input, every path it writes
//! as a target, and dynamic dependencies (values that only exist once
//! earlier rules have run) are routed through persisted value files.

pub use crate::util::errors::{internal, GantryResult};

pub mod core;
pub mod ops;
pub mod util;
