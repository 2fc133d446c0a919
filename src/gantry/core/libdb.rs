//! The library database: interprets library-dependency expressions,
//! resolves `Select` alternatives, and emits the transitive closures that
//! compilation and link rules consume.
//!
//! Every library persists two files next to its artifacts:
//! `{name}.requires.sexp` (its dependency closure) and
//! `{name}.runtime-deps.sexp` (the runtime closure it contributes when
//! used as a preprocessor plugin). Closures of *other* directories are
//! consumed through those files rather than recomputed, so the executor
//! can parallelize across directories without locks.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use indexmap::IndexMap;
use log::debug;

use crate::core::build::Build;
use crate::core::compiler::Mode;
use crate::core::interning::InternedString;
use crate::core::package::{Findlib, FindlibPackage};
use crate::core::paths::Path;
use crate::core::stanza::{LibDep, LibSpec, SelectChoice};
use crate::core::vfile::Vspec;
use crate::util::errors::GantryResult;

/// A library as seen by rules: either first-party (a stanza in some
/// directory of the tree) or third-party (a findlib package).
#[derive(Clone, Debug)]
pub enum ResolvedLib {
    Internal { dir: Path, spec: Arc<LibSpec> },
    External(Arc<FindlibPackage>),
}

impl ResolvedLib {
    pub fn best_name(&self) -> InternedString {
        match self {
            ResolvedLib::Internal { spec, .. } => spec.best_name(),
            ResolvedLib::External(pkg) => pkg.name,
        }
    }

    pub fn include_dir(&self) -> Path {
        match self {
            ResolvedLib::Internal { dir, .. } => dir.clone(),
            ResolvedLib::External(pkg) => pkg.dir.clone(),
        }
    }

    pub fn archives(&self, mode: Mode) -> Vec<Path> {
        match self {
            ResolvedLib::Internal { dir, spec } => {
                if spec.modes.contains(&mode) {
                    vec![dir.append(&format!("{}.{}", spec.name, mode.compiled_lib_ext()))]
                } else {
                    vec![]
                }
            }
            ResolvedLib::External(pkg) => pkg.archives(mode),
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, ResolvedLib::Internal { .. })
    }
}

pub fn requires_path(dir: &Path, name: InternedString) -> Path {
    dir.append(&format!("{}.requires.sexp", name))
}

pub fn runtime_deps_path(dir: &Path, name: InternedString) -> Path {
    dir.append(&format!("{}.runtime-deps.sexp", name))
}

/// Result of a name lookup.
pub enum LibLookup {
    Internal(Path, Arc<LibSpec>),
    External(Arc<FindlibPackage>),
    NotFound,
}

/// The chosen alternative of a `Select` dependency, materialized as a
/// file-copy rule by the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectResolution {
    pub src_file: String,
    pub dst_file: String,
}

struct LibDbInner {
    findlib: Arc<Findlib>,
    by_name: HashMap<InternedString, (Path, Arc<LibSpec>)>,
}

#[derive(Clone)]
pub struct LibDb {
    inner: Arc<LibDbInner>,
}

impl LibDb {
    /// Registers every internal library of the tree. Local and public
    /// names share one namespace for lookup; collisions are fatal.
    pub fn new(findlib: Arc<Findlib>, libs: Vec<(Path, LibSpec)>) -> GantryResult<LibDb> {
        let mut by_name: HashMap<InternedString, (Path, Arc<LibSpec>)> = HashMap::new();
        for (dir, spec) in libs {
            let spec = Arc::new(spec);
            let mut names = vec![spec.name];
            if let Some(public) = spec.public_name {
                if public != spec.name {
                    names.push(public);
                }
            }
            for name in names {
                if let Some((other_dir, _)) = by_name.get(&name) {
                    bail!(
                        "library {} is defined twice: in {} and in {}",
                        name,
                        other_dir,
                        dir
                    );
                }
                by_name.insert(name, (dir.clone(), Arc::clone(&spec)));
            }
        }
        debug!("library database holds {} names", by_name.len());
        Ok(LibDb {
            inner: Arc::new(LibDbInner { findlib, by_name }),
        })
    }

    pub fn findlib(&self) -> &Findlib {
        &self.inner.findlib
    }

    pub fn find(&self, name: InternedString) -> LibLookup {
        match self.inner.by_name.get(&name) {
            Some((dir, spec)) => LibLookup::Internal(dir.clone(), Arc::clone(spec)),
            None => match self.inner.findlib.find(name) {
                Some(pkg) => LibLookup::External(pkg),
                None => LibLookup::NotFound,
            },
        }
    }

    pub fn internal_libs(&self) -> Vec<(Path, Arc<LibSpec>)> {
        let mut seen = indexmap::IndexSet::new();
        let mut out = Vec::new();
        for (dir, spec) in self.inner.by_name.values() {
            if seen.insert(spec.name) {
                out.push((dir.clone(), Arc::clone(spec)));
            }
        }
        out.sort_by_key(|(_, spec)| spec.name);
        out
    }

    fn available(&self, name: InternedString) -> bool {
        !matches!(self.find(name), LibLookup::NotFound)
    }

    /// Classifies each dependency into internal and external parts. A
    /// missing name does not abort rule generation; it becomes a deferred
    /// failure raised only if a rule built on these deps is realized.
    pub fn interpret_lib_deps(
        &self,
        dir: &Path,
        deps: &[LibDep],
    ) -> (
        Vec<(Path, Arc<LibSpec>)>,
        Vec<Arc<FindlibPackage>>,
        Option<anyhow::Error>,
    ) {
        let mut internals = Vec::new();
        let mut externals = Vec::new();
        let mut fail = None;
        let mut add_name = |name: InternedString,
                            internals: &mut Vec<(Path, Arc<LibSpec>)>,
                            externals: &mut Vec<Arc<FindlibPackage>>,
                            fail: &mut Option<anyhow::Error>| {
            match self.find(name) {
                LibLookup::Internal(d, spec) => internals.push((d, spec)),
                LibLookup::External(pkg) => externals.push(pkg),
                LibLookup::NotFound => {
                    if fail.is_none() {
                        *fail = Some(anyhow!("library {} not found", name));
                    }
                }
            }
        };
        for dep in deps {
            match dep {
                LibDep::Direct(name) => {
                    add_name(*name, &mut internals, &mut externals, &mut fail)
                }
                LibDep::Select { choices, .. } => match self.choose(choices) {
                    Some(choice) => {
                        for &name in &choice.required {
                            add_name(name, &mut internals, &mut externals, &mut fail);
                        }
                    }
                    None => {
                        if fail.is_none() {
                            fail = Some(anyhow!(
                                "no solution found for select in {}",
                                dir
                            ));
                        }
                    }
                },
            }
        }
        (internals, externals, fail)
    }

    fn choose<'a>(&self, choices: &'a [SelectChoice]) -> Option<&'a SelectChoice> {
        choices.iter().find(|choice| {
            choice.required.iter().all(|&n| self.available(n))
                && choice.forbidden.iter().all(|&n| !self.available(n))
        })
    }

    /// Per `Select`, the chosen source file and the stanza-declared result
    /// file; the orchestrator materializes each as a copy rule.
    pub fn resolve_selects(&self, deps: &[LibDep]) -> Vec<SelectResolution> {
        deps.iter()
            .filter_map(|dep| match dep {
                LibDep::Direct(_) => None,
                LibDep::Select {
                    choices,
                    result_file,
                } => self.choose(choices).map(|choice| SelectResolution {
                    src_file: choice.file.clone(),
                    dst_file: result_file.clone(),
                }),
            })
            .collect()
    }

    fn resolve_names(&self, names: &[InternedString]) -> GantryResult<Vec<ResolvedLib>> {
        names
            .iter()
            .map(|&name| match self.find(name) {
                LibLookup::Internal(dir, spec) => Ok(ResolvedLib::Internal { dir, spec }),
                LibLookup::External(pkg) => Ok(ResolvedLib::External(pkg)),
                LibLookup::NotFound => Err(anyhow!("library {} not found", name)),
            })
            .collect()
    }

    /// The dependency closure of `deps`, as a build value: externals are
    /// closed through findlib, internals contribute their persisted
    /// `requires` file followed by themselves, and the concatenation is
    /// deduplicated preserving first occurrence. Order is link order.
    pub fn closure(&self, dir: &Path, deps: &[LibDep]) -> Build<(), Vec<ResolvedLib>> {
        self.closure_with(dir, deps, false)
    }

    /// Same shape as [`LibDb::closure`] but follows the *runtime*
    /// dependency channel: external runtime closures and internal
    /// `runtime-deps.sexp` files.
    pub fn closed_ppx_runtime_deps_of(
        &self,
        dir: &Path,
        deps: &[LibDep],
    ) -> Build<(), Vec<ResolvedLib>> {
        self.closure_with(dir, deps, true)
    }

    fn closure_with(
        &self,
        dir: &Path,
        deps: &[LibDep],
        runtime: bool,
    ) -> Build<(), Vec<ResolvedLib>> {
        let (internals, externals, mut fail) = self.interpret_lib_deps(dir, deps);
        let external_part = {
            let res = if runtime {
                self.inner.findlib.closed_ppx_runtime_deps_of(&externals)
            } else {
                self.inner.findlib.closure(&externals)
            };
            match res {
                Ok(pkgs) => pkgs.into_iter().map(ResolvedLib::External).collect(),
                Err(e) => {
                    if fail.is_none() {
                        fail = Some(e);
                    }
                    Vec::new()
                }
            }
        };
        let mut acc: Build<(), Vec<ResolvedLib>> = Build::pure(external_part);
        for (dep_dir, dep_spec) in internals {
            let vspec = Vspec::names(if runtime {
                runtime_deps_path(&dep_dir, dep_spec.name)
            } else {
                requires_path(&dep_dir, dep_spec.name)
            });
            let db = self.clone();
            let dep_lib = ResolvedLib::Internal {
                dir: dep_dir,
                spec: dep_spec,
            };
            let loaded = Build::vpath(&vspec).try_map(move |names: Vec<InternedString>| {
                let mut libs = db.resolve_names(&names)?;
                if !runtime {
                    libs.push(dep_lib.clone());
                }
                Ok(libs)
            });
            acc = acc.fanout(loaded).map(|(mut a, b)| {
                a.extend(b);
                a
            });
        }
        let deduped = acc.map(dedup_libs);
        match fail {
            Some(e) => Build::fail(e).then(deduped),
            None => deduped,
        }
    }

    /// Internal libraries minus the optional ones whose dependencies
    /// cannot all be resolved; the install-manifest emitter consumes
    /// this.
    pub fn internal_libs_without_non_installable_optional_ones(
        &self,
    ) -> Vec<(Path, Arc<LibSpec>)> {
        self.internal_libs()
            .into_iter()
            .filter(|(_, spec)| !spec.optional || self.all_deps_resolvable(spec))
            .collect()
    }

    fn all_deps_resolvable(&self, spec: &LibSpec) -> bool {
        let mut visiting = Vec::new();
        self.deps_resolvable_rec(spec, &mut visiting)
    }

    fn deps_resolvable_rec(
        &self,
        spec: &LibSpec,
        visiting: &mut Vec<InternedString>,
    ) -> bool {
        if visiting.contains(&spec.name) {
            return true;
        }
        visiting.push(spec.name);
        let ok = spec.libraries.iter().all(|dep| match dep {
            LibDep::Direct(name) => match self.find(*name) {
                LibLookup::Internal(_, inner) => self.deps_resolvable_rec(&inner, visiting),
                LibLookup::External(pkg) => self.inner.findlib.closure(&[pkg]).is_ok(),
                LibLookup::NotFound => false,
            },
            LibDep::Select { choices, .. } => self.choose(choices).is_some(),
        });
        visiting.pop();
        ok
    }
}

/// Ordered deduplication on best names, preserving first occurrence.
pub fn dedup_libs(libs: Vec<ResolvedLib>) -> Vec<ResolvedLib> {
    let mut map: IndexMap<InternedString, ResolvedLib> = IndexMap::new();
    for lib in libs {
        map.entry(lib.best_name()).or_insert(lib);
    }
    map.into_iter().map(|(_, l)| l).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::build::{Action, Build as B, Rule};
    use crate::core::stanza::LibDep;
    use std::collections::BTreeMap;

    fn ctx_dir(d: &str) -> Path {
        Path::build(InternedString::new("default"), d)
    }

    fn findlib() -> Arc<Findlib> {
        let mut unix = FindlibPackage::new("unix", Path::absolute("/lib/unix"));
        unix.byte_archives = vec!["unix.cma".to_string()];
        Arc::new(Findlib::from_packages(vec![unix]))
    }

    fn db(libs: Vec<(Path, LibSpec)>) -> LibDb {
        LibDb::new(findlib(), libs).unwrap()
    }

    fn closure_names(
        db: &LibDb,
        dir: &Path,
        deps: &[LibDep],
        files: &BTreeMap<Path, String>,
    ) -> Vec<String> {
        let build = db
            .closure(dir, deps)
            .map(|libs| Action::Bash(libs.iter().map(|l| l.best_name().to_string()).collect::<Vec<_>>().join(" ")));
        let rule = Rule::new(B::pure(()).then(build));
        match rule.realize(files).unwrap().action {
            Action::Bash(s) if s.is_empty() => vec![],
            Action::Bash(s) => s.split(' ').map(|x| x.to_string()).collect(),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn closure_reads_persisted_requires_and_dedups() {
        let a_dir = ctx_dir("a");
        let b_dir = ctx_dir("b");
        let mut a = LibSpec::new("a");
        a.libraries = vec![LibDep::direct("unix")];
        let b = LibSpec::new("b");
        let db = db(vec![(a_dir.clone(), a), (b_dir.clone(), b)]);

        let mut files = BTreeMap::new();
        files.insert(
            requires_path(&a_dir, InternedString::new("a")),
            "(unix)".to_string(),
        );
        files.insert(
            requires_path(&b_dir, InternedString::new("b")),
            "()".to_string(),
        );
        let names = closure_names(
            &db,
            &ctx_dir("top"),
            &[LibDep::direct("unix"), LibDep::direct("a"), LibDep::direct("b")],
            &files,
        );
        assert_eq!(names, vec!["unix", "a", "b"]);
    }

    #[test]
    fn missing_dep_is_deferred_until_realize() {
        let db = db(vec![]);
        let dir = ctx_dir("top");
        let build = db.closure(&dir, &[LibDep::direct("nonexistent")]);
        let rule = Rule::new(build.map(|_| Action::Progn(vec![])));
        let err = rule.realize(&BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("library nonexistent not found"));
    }

    #[test]
    fn select_picks_the_first_satisfied_choice() {
        let db = db(vec![]);
        let deps = vec![LibDep::Select {
            choices: vec![
                SelectChoice {
                    required: [InternedString::new("threads")].into_iter().collect(),
                    forbidden: Default::default(),
                    file: "threaded_impl.ml".to_string(),
                },
                SelectChoice {
                    required: [InternedString::new("unix")].into_iter().collect(),
                    forbidden: Default::default(),
                    file: "unix_impl.ml".to_string(),
                },
                SelectChoice {
                    required: Default::default(),
                    forbidden: Default::default(),
                    file: "stub_impl.ml".to_string(),
                },
            ],
            result_file: "backend.ml".to_string(),
        }];
        assert_eq!(
            db.resolve_selects(&deps),
            vec![SelectResolution {
                src_file: "unix_impl.ml".to_string(),
                dst_file: "backend.ml".to_string(),
            }]
        );
    }

    #[test]
    fn optional_lib_with_missing_dep_is_not_installable() {
        let mut opt = LibSpec::new("opt");
        opt.optional = true;
        opt.libraries = vec![LibDep::direct("nonexistent")];
        let ok = LibSpec::new("ok");
        let db = db(vec![(ctx_dir("opt"), opt), (ctx_dir("ok"), ok)]);
        let installable: Vec<_> = db
            .internal_libs_without_non_installable_optional_ones()
            .into_iter()
            .map(|(_, spec)| spec.name.to_string())
            .collect();
        assert_eq!(installable, vec!["ok"]);
    }
}
