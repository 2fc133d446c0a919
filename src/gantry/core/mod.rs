pub use self::build::{Arg, Action, Build, Rule};
pub use self::interning::InternedString;
pub use self::paths::Path;

pub mod build;
pub mod compiler;
pub mod depscan;
pub mod interning;
pub mod libdb;
pub mod modules;
pub mod ordered_set_lang;
pub mod package;
pub mod paths;
pub mod preprocess;
pub mod rule_graph;
pub mod stanza;
pub mod vfile;
