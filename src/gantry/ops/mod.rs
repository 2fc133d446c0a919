pub use self::gen_rules::{gen_rules, DirStanzas};
pub use self::install::{gen_install_rules, ProjectPackage};
pub use self::merlin::gen_merlin_rules;

pub mod expand;
pub mod gen_rules;
pub mod install;
pub mod merlin;
