//! The generation-scoped context: toolchain configuration, the library
//! database, the rule accumulator and the preprocessor-driver memo.
//!
//! All state that is "process-wide" during rule generation lives here and
//! is passed explicitly; nothing is a true global. The executor never
//! sees this type, only the rules it accumulates.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;

use crate::core::build::{Action, Build, Rule};
use crate::core::interning::InternedString;
use crate::core::libdb::{LibDb, ResolvedLib};
use crate::core::paths::Path;
use crate::core::stanza::InstallSection;

/// An executable staged for installation in some package's `bin` section.
#[derive(Clone, Debug)]
pub struct BinInstall {
    pub package: InternedString,
    pub src: Path,
    pub name: String,
}

/// Toolchain and environment facts, detected by an external collaborator
/// and handed to the generator fully populated.
#[derive(Clone, Debug)]
pub struct Config {
    /// Build-context name; `default` is the one whose install manifests
    /// and editor-integration files are mirrored back to the source tree.
    pub name: InternedString,
    pub ocamlc: Option<PathBuf>,
    pub ocamlopt: Option<PathBuf>,
    pub ocamldep: PathBuf,
    pub ocamllex: PathBuf,
    pub ocamlyacc: PathBuf,
    pub ocamlmklib: PathBuf,
    pub ocaml: PathBuf,
    pub ocaml_bin: PathBuf,
    pub stdlib_dir: PathBuf,
    pub version: String,
    /// The bytecode C compiler command as reported by the compiler's
    /// configuration, first word being the executable.
    pub c_compiler: String,
    pub ext_obj: String,
    pub ext_lib: String,
    pub ext_dll: String,
    pub arch_sixtyfour: bool,
    pub portable_int63: bool,
    pub default_flags: Vec<String>,
    pub default_ocamlc_flags: Vec<String>,
    pub default_ocamlopt_flags: Vec<String>,
    /// When set, inline-test and inline-benchmark code is compiled out by
    /// passing the matching drop flags to the preprocessor driver.
    pub drop_inline_tests: bool,
}

pub const DEFAULT_CONTEXT: &str = "default";

impl Config {
    /// A plain unix toolchain layout; callers override fields as needed.
    pub fn new(name: &str) -> Config {
        Config {
            name: InternedString::new(name),
            ocamlc: Some(PathBuf::from("/usr/bin/ocamlc")),
            ocamlopt: Some(PathBuf::from("/usr/bin/ocamlopt")),
            ocamldep: PathBuf::from("/usr/bin/ocamldep"),
            ocamllex: PathBuf::from("/usr/bin/ocamllex"),
            ocamlyacc: PathBuf::from("/usr/bin/ocamlyacc"),
            ocamlmklib: PathBuf::from("/usr/bin/ocamlmklib"),
            ocaml: PathBuf::from("/usr/bin/ocaml"),
            ocaml_bin: PathBuf::from("/usr/bin"),
            stdlib_dir: PathBuf::from("/usr/lib/ocaml"),
            version: "4.06.0".to_string(),
            c_compiler: "gcc -O2 -fno-strict-aliasing".to_string(),
            ext_obj: ".o".to_string(),
            ext_lib: ".a".to_string(),
            ext_dll: ".so".to_string(),
            arch_sixtyfour: true,
            portable_int63: false,
            default_flags: vec!["-w".to_string(), "@a-4-9-29-40-41-42-44-45-48".to_string()],
            default_ocamlc_flags: vec!["-g".to_string()],
            default_ocamlopt_flags: vec!["-g".to_string()],
            drop_inline_tests: true,
        }
    }

    pub fn is_default(&self) -> bool {
        self.name == InternedString::new(DEFAULT_CONTEXT)
    }

    /// A path under this context's build directory.
    pub fn build_path(&self, sub: &str) -> Path {
        Path::build(self.name, sub)
    }

    pub fn compiler(&self, mode: super::Mode) -> Option<Path> {
        let prog = match mode {
            super::Mode::Byte => self.ocamlc.as_ref(),
            super::Mode::Native => self.ocamlopt.as_ref(),
        };
        prog.map(|p| Path::absolute(p.clone()))
    }

    /// First word of the C compiler command plus its trailing flags.
    pub fn cc(&self) -> (String, Vec<String>) {
        let mut words = self.c_compiler.split_whitespace();
        let head = words.next().unwrap_or("cc").to_string();
        (head, words.map(|w| w.to_string()).collect())
    }

    /// The C++ compiler derived from the C one: same executable family
    /// with `-std=` tokens dropped, falling back to `g++`.
    pub fn cxx(&self) -> (String, Vec<String>) {
        let (head, flags) = self.cc();
        let flags: Vec<String> = flags.into_iter().filter(|f| !f.starts_with("-std=")).collect();
        let head = match head.rsplit('/').next().unwrap_or("") {
            "gcc" => head.replace("gcc", "g++"),
            "cc" => head[..head.len() - 2].to_string() + "c++",
            "clang" => head.replace("clang", "clang++"),
            _ => "g++".to_string(),
        };
        (head, flags)
    }
}

/// An already-built (or memoized) preprocessor driver.
#[derive(Clone)]
pub struct PpxDriver {
    pub exe: Path,
    /// The closed library set linked into the driver; consumers inspect
    /// it to synthesize per-invocation plugin arguments.
    pub libs: Build<(), Vec<ResolvedLib>>,
}

pub struct Context {
    pub config: Arc<Config>,
    pub libdb: LibDb,
    rules: Vec<Rule>,
    ppx_drivers: HashMap<String, PpxDriver>,
    /// Named artifacts resolvable from user actions (`${bin:name}`):
    /// `Provides` stanzas and executables register here.
    artifacts: HashMap<InternedString, Path>,
    /// Installable files per library, recorded during library setup and
    /// consumed by the install-manifest emitter.
    lib_installs: HashMap<InternedString, Vec<(InstallSection, Path)>>,
    bin_installs: Vec<BinInstall>,
}

impl Context {
    pub fn new(config: Config, libdb: LibDb) -> Context {
        Context {
            config: Arc::new(config),
            libdb,
            rules: Vec::new(),
            ppx_drivers: HashMap::new(),
            artifacts: HashMap::new(),
            lib_installs: HashMap::new(),
            bin_installs: Vec::new(),
        }
    }

    pub fn add_rule(&mut self, build: Build<(), Action>) {
        let rule = Rule::new(build);
        debug!(
            "rule: {} target(s), {} input(s)",
            rule.targets.len() + rule.extra_targets.len(),
            rule.inputs.len()
        );
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn into_rules(self) -> Vec<Rule> {
        self.rules
    }

    pub fn ppx_driver(&self, key: &str) -> Option<PpxDriver> {
        self.ppx_drivers.get(key).cloned()
    }

    pub fn memoize_ppx_driver(&mut self, key: String, driver: PpxDriver) {
        self.ppx_drivers.insert(key, driver);
    }

    pub fn register_artifact(&mut self, name: InternedString, path: Path) {
        self.artifacts.insert(name, path);
    }

    pub fn artifact(&self, name: InternedString) -> Option<Path> {
        self.artifacts.get(&name).cloned()
    }

    pub fn record_lib_install(
        &mut self,
        lib: InternedString,
        files: Vec<(InstallSection, Path)>,
    ) {
        self.lib_installs.insert(lib, files);
    }

    pub fn lib_install_files(&self, lib: InternedString) -> &[(InstallSection, Path)] {
        self.lib_installs
            .get(&lib)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn record_bin_install(&mut self, install: BinInstall) {
        self.bin_installs.push(install);
    }

    pub fn bin_installs(&self) -> &[BinInstall] {
        &self.bin_installs
    }
}
