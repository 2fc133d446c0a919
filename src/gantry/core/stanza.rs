//! The typed stanza model.
//!
//! A stanza is one top-level declaration in a directory's build
//! description. The surface S-expression syntax is the concern of an
//! external parser; gantry consumes these typed values.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::compiler::Mode;
use crate::core::interning::InternedString;
use crate::core::ordered_set_lang::OrderedSetLang;

#[derive(Clone, Debug)]
pub enum Stanza {
    Library(LibSpec),
    Executables(Executables),
    Rule(UserRule),
    Ocamllex(Ocamllex),
    Ocamlyacc(Ocamlyacc),
    Install(InstallStanza),
    Provides(Provides),
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LibKind {
    Normal,
    PpxRewriter,
    PpxTypeConvPlugin,
}

impl LibKind {
    /// Rewriter-style libraries are linked whole into drivers, so their
    /// archives get `-linkall`.
    pub fn is_ppx(self) -> bool {
        matches!(self, LibKind::PpxRewriter | LibKind::PpxTypeConvPlugin)
    }
}

/// One alternative of a `Select` dependency: taken when every package in
/// `required` resolves and none in `forbidden` does. An empty-`required`
/// choice is the conventional default.
#[derive(Clone, Debug)]
pub struct SelectChoice {
    pub required: BTreeSet<InternedString>,
    pub forbidden: BTreeSet<InternedString>,
    pub file: String,
}

#[derive(Clone, Debug)]
pub enum LibDep {
    Direct(InternedString),
    Select {
        choices: Vec<SelectChoice>,
        result_file: String,
    },
}

impl LibDep {
    pub fn direct(name: &str) -> LibDep {
        LibDep::Direct(InternedString::new(name))
    }
}

/// Per-module preprocessing choice.
#[derive(Clone, Debug, PartialEq)]
pub enum Preprocess {
    NoPreprocessing,
    /// Macro-style rewriting with the fixed metaquot plugin.
    Metaquot,
    /// An ad-hoc shell command run over the source file.
    Command(String),
    /// A plugin-driver pipeline.
    Pps {
        pps: Vec<InternedString>,
        flags: Vec<String>,
    },
}

#[derive(Clone, Debug)]
pub struct PreprocessMap {
    pub default: Preprocess,
    pub per_module: BTreeMap<InternedString, Preprocess>,
}

impl PreprocessMap {
    pub fn no_preprocessing() -> PreprocessMap {
        PreprocessMap {
            default: Preprocess::NoPreprocessing,
            per_module: BTreeMap::new(),
        }
    }

    pub fn pps_for_all(pps: &[&str]) -> PreprocessMap {
        PreprocessMap {
            default: Preprocess::Pps {
                pps: pps.iter().map(|p| InternedString::new(p)).collect(),
                flags: Vec::new(),
            },
            per_module: BTreeMap::new(),
        }
    }

    pub fn get(&self, module: InternedString) -> &Preprocess {
        self.per_module.get(&module).unwrap_or(&self.default)
    }

    /// Every plugin named anywhere in the map; the consuming library's
    /// runtime dependencies are derived from this set.
    pub fn all_pps(&self) -> BTreeSet<InternedString> {
        let mut out = BTreeSet::new();
        for choice in std::iter::once(&self.default).chain(self.per_module.values()) {
            if let Preprocess::Pps { pps, .. } = choice {
                out.extend(pps.iter().copied());
            }
        }
        out
    }
}

impl Default for PreprocessMap {
    fn default() -> PreprocessMap {
        PreprocessMap::no_preprocessing()
    }
}

/// A declared non-library dependency of a stanza.
#[derive(Clone, Debug)]
pub enum DepConf {
    File(String),
    Glob(String),
    FilesRecursivelyIn(String),
}

#[derive(Clone, Debug)]
pub struct LibSpec {
    pub name: InternedString,
    pub public_name: Option<InternedString>,
    pub synopsis: Option<String>,
    pub wrapped: bool,
    pub modes: BTreeSet<Mode>,
    pub kind: LibKind,
    pub optional: bool,
    pub libraries: Vec<LibDep>,
    pub ppx_runtime_libraries: Vec<LibDep>,
    pub preprocess: PreprocessMap,
    pub preprocessor_deps: Vec<DepConf>,
    pub virtual_deps: Vec<InternedString>,
    pub modules: OrderedSetLang,
    pub flags: OrderedSetLang,
    pub ocamlc_flags: OrderedSetLang,
    pub ocamlopt_flags: OrderedSetLang,
    pub c_flags: OrderedSetLang,
    pub cxx_flags: OrderedSetLang,
    pub link_flags: OrderedSetLang,
    pub library_flags: OrderedSetLang,
    pub c_library_flags: OrderedSetLang,
    pub c_names: Vec<String>,
    pub cxx_names: Vec<String>,
    pub install_c_headers: Vec<String>,
    pub self_build_stubs_archive: Option<String>,
    pub js_artifacts: Vec<String>,
}

impl LibSpec {
    pub fn new(name: &str) -> LibSpec {
        LibSpec {
            name: InternedString::new(name),
            public_name: None,
            synopsis: None,
            wrapped: true,
            modes: Mode::both(),
            kind: LibKind::Normal,
            optional: false,
            libraries: Vec::new(),
            ppx_runtime_libraries: Vec::new(),
            preprocess: PreprocessMap::no_preprocessing(),
            preprocessor_deps: Vec::new(),
            virtual_deps: Vec::new(),
            modules: OrderedSetLang::Standard,
            flags: OrderedSetLang::Standard,
            ocamlc_flags: OrderedSetLang::Standard,
            ocamlopt_flags: OrderedSetLang::Standard,
            c_flags: OrderedSetLang::Standard,
            cxx_flags: OrderedSetLang::Standard,
            link_flags: OrderedSetLang::Standard,
            library_flags: OrderedSetLang::Standard,
            c_library_flags: OrderedSetLang::Standard,
            c_names: Vec::new(),
            cxx_names: Vec::new(),
            install_c_headers: Vec::new(),
            self_build_stubs_archive: None,
            js_artifacts: Vec::new(),
        }
    }

    /// The canonical identity: public name if declared, local name
    /// otherwise. Used for persisted closures and deduplication.
    pub fn best_name(&self) -> InternedString {
        self.public_name.unwrap_or(self.name)
    }

    pub fn has_stubs(&self) -> bool {
        !self.c_names.is_empty()
            || !self.cxx_names.is_empty()
            || self.self_build_stubs_archive.is_some()
    }

    /// Base name of the stubs archive (without the `lib` prefix or the
    /// extension).
    pub fn stubs_name(&self) -> String {
        match &self.self_build_stubs_archive {
            Some(base) => format!("{}_stubs", base),
            None => format!("{}_stubs", self.name),
        }
    }

    pub fn uses_pps(&self) -> bool {
        !self.preprocess.all_pps().is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct Executables {
    pub names: Vec<String>,
    /// Parallel to `names`; a `Some` installs the executable under that
    /// public name in the owning package's `bin` section.
    pub public_names: Vec<Option<String>>,
    pub package: Option<InternedString>,
    pub libraries: Vec<LibDep>,
    pub preprocess: PreprocessMap,
    pub preprocessor_deps: Vec<DepConf>,
    pub modules: OrderedSetLang,
    pub flags: OrderedSetLang,
    pub ocamlc_flags: OrderedSetLang,
    pub ocamlopt_flags: OrderedSetLang,
    pub link_flags: OrderedSetLang,
    pub modes: BTreeSet<Mode>,
}

impl Executables {
    pub fn new(names: &[&str]) -> Executables {
        Executables {
            names: names.iter().map(|n| n.to_string()).collect(),
            public_names: vec![None; names.len()],
            package: None,
            libraries: Vec::new(),
            preprocess: PreprocessMap::no_preprocessing(),
            preprocessor_deps: Vec::new(),
            modules: OrderedSetLang::Standard,
            flags: OrderedSetLang::Standard,
            ocamlc_flags: OrderedSetLang::Standard,
            ocamlopt_flags: OrderedSetLang::Standard,
            link_flags: OrderedSetLang::Standard,
            modes: Mode::both(),
        }
    }
}

/// The action of a user-declared rule, before variable expansion.
#[derive(Clone, Debug)]
pub enum UserAction {
    Run { prog: String, args: Vec<String> },
    Bash(String),
}

#[derive(Clone, Debug)]
pub struct UserRule {
    pub targets: Vec<String>,
    pub deps: Vec<DepConf>,
    pub action: UserAction,
}

#[derive(Clone, Debug)]
pub struct Ocamllex {
    pub names: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Ocamlyacc {
    pub names: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstallSection {
    Lib,
    Libexec,
    Stublibs,
    Doc,
    Bin,
    Etc,
}

impl InstallSection {
    pub fn keyword(self) -> &'static str {
        match self {
            InstallSection::Lib => "lib",
            InstallSection::Libexec => "libexec",
            InstallSection::Stublibs => "stublibs",
            InstallSection::Doc => "doc",
            InstallSection::Bin => "bin",
            InstallSection::Etc => "etc",
        }
    }
}

#[derive(Clone, Debug)]
pub struct InstallFileEntry {
    pub src: String,
    pub dst: Option<String>,
}

#[derive(Clone, Debug)]
pub struct InstallStanza {
    pub section: InstallSection,
    pub files: Vec<InstallFileEntry>,
    pub package: InternedString,
}

/// Registers a file in the directory as a named artifact, resolvable from
/// user actions through `${bin:name}`-style references.
#[derive(Clone, Debug)]
pub struct Provides {
    pub name: InternedString,
    pub file: String,
}
