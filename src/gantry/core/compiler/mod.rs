pub use self::context::{BinInstall, Config, Context, PpxDriver};

pub mod archive;
pub mod context;
pub mod executable;
pub mod module_rules;
pub mod stubs;

use serde::Serialize;

/// Code-generation mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Mode {
    Byte,
    Native,
}

impl Mode {
    pub fn compiled_unit_ext(self) -> &'static str {
        match self {
            Mode::Byte => "cmo",
            Mode::Native => "cmx",
        }
    }

    pub fn compiled_lib_ext(self) -> &'static str {
        match self {
            Mode::Byte => "cma",
            Mode::Native => "cmxa",
        }
    }

    pub fn cm_kind(self) -> CmKind {
        match self {
            Mode::Byte => CmKind::Cmo,
            Mode::Native => CmKind::Cmx,
        }
    }

    pub fn both() -> std::collections::BTreeSet<Mode> {
        [Mode::Byte, Mode::Native].into_iter().collect()
    }
}

/// Compiled-module artifact kind: interface, bytecode or native.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum CmKind {
    Cmi,
    Cmo,
    Cmx,
}

impl CmKind {
    pub fn ext(self) -> &'static str {
        match self {
            CmKind::Cmi => "cmi",
            CmKind::Cmo => "cmo",
            CmKind::Cmx => "cmx",
        }
    }

    pub fn mode(self) -> Mode {
        match self {
            CmKind::Cmi | CmKind::Cmo => Mode::Byte,
            CmKind::Cmx => Mode::Native,
        }
    }

    pub fn all() -> [CmKind; 3] {
        [CmKind::Cmi, CmKind::Cmo, CmKind::Cmx]
    }
}
