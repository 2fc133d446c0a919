#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use gantry::core::build::{Action, Realized, Rule};
use gantry::core::compiler::{Config, Context};
use gantry::core::interning::InternedString;
use gantry::core::package::{Findlib, FindlibPackage};
use gantry::core::paths::Path;
use gantry::core::stanza::Stanza;
use gantry::ops::{gen_rules, DirStanzas};
use gantry::GantryResult;

pub struct ProjectBuilder {
    dirs: Vec<DirStanzas>,
    packages: Vec<FindlibPackage>,
    config: Config,
}

pub fn project() -> ProjectBuilder {
    ProjectBuilder {
        dirs: Vec::new(),
        packages: Vec::new(),
        config: Config::new("default"),
    }
}

impl ProjectBuilder {
    pub fn dir(mut self, dir: &str, files: &[&str], stanzas: Vec<Stanza>) -> ProjectBuilder {
        self.dirs.push(DirStanzas {
            dir: dir.to_string(),
            files: files.iter().map(|f| f.to_string()).collect(),
            stanzas,
        });
        self
    }

    /// Registers a plain external package named `name` under `/lib/name`.
    pub fn findlib(mut self, name: &str) -> ProjectBuilder {
        let mut pkg = FindlibPackage::new(name, Path::absolute(format!("/lib/{}", name)));
        pkg.byte_archives = vec![format!("{}.cma", name)];
        pkg.native_archives = vec![format!("{}.cmxa", name)];
        self.packages.push(pkg);
        self
    }

    pub fn findlib_package(mut self, pkg: FindlibPackage) -> ProjectBuilder {
        self.packages.push(pkg);
        self
    }

    pub fn config(mut self, f: impl FnOnce(&mut Config)) -> ProjectBuilder {
        f(&mut self.config);
        self
    }

    pub fn build(self) -> Context {
        self.try_build().unwrap()
    }

    pub fn try_build(self) -> GantryResult<Context> {
        gen_rules(
            self.config,
            Arc::new(Findlib::from_packages(self.packages)),
            &self.dirs,
        )
    }

    pub fn dirs(&self) -> &[DirStanzas] {
        &self.dirs
    }
}

/// A path in the default context's build tree.
pub fn bd(sub: &str) -> Path {
    Path::build(InternedString::new("default"), sub)
}

pub fn find_rule<'a>(ctx: &'a Context, target: &Path) -> &'a Rule {
    ctx.rules()
        .iter()
        .find(|r| r.targets.contains(target) || r.extra_targets.contains(target))
        .unwrap_or_else(|| panic!("no rule produces {}", target))
}

pub fn has_target(ctx: &Context, target: &Path) -> bool {
    ctx.rules()
        .iter()
        .any(|r| r.targets.contains(target) || r.extra_targets.contains(target))
}

/// Realizes a rule against an in-memory file map.
pub fn realize(rule: &Rule, files: &[(Path, &str)]) -> GantryResult<Realized> {
    let map: BTreeMap<Path, String> = files
        .iter()
        .map(|(p, s)| (p.clone(), s.to_string()))
        .collect();
    rule.realize(&map)
}

/// Flattens an action to the underlying command, skipping `Chdir` and
/// `WithStdoutTo` wrappers.
pub fn command_of(action: &Action) -> (String, Vec<String>) {
    match action {
        Action::Run { prog, args } => (prog.clone(), args.clone()),
        Action::Chdir(_, inner) | Action::WithStdoutTo(_, inner) => command_of(inner),
        other => panic!("expected a command, got {:?}", other),
    }
}
