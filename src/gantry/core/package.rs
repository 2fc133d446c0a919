//! Façade over the external package database (findlib).
//!
//! Reading `META` files off the disk is an external collaborator's job;
//! gantry consumes already-parsed package records and provides lookup and
//! the two transitive closures rules need: plain dependencies (link
//! closure) and preprocessor *runtime* dependencies.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use indexmap::IndexMap;
use log::trace;
use semver::Version;

use crate::core::compiler::Mode;
use crate::core::interning::InternedString;
use crate::core::paths::Path;
use crate::util::errors::GantryResult;

#[derive(Clone, Debug)]
pub struct FindlibPackage {
    pub name: InternedString,
    pub dir: Path,
    pub version: Option<Version>,
    pub description: Option<String>,
    pub requires: Vec<InternedString>,
    /// Transitive *runtime* deps contributed when this package is used as
    /// a preprocessor plugin.
    pub ppx_runtime_deps: Vec<InternedString>,
    pub byte_archives: Vec<String>,
    pub native_archives: Vec<String>,
    pub jsoo_runtime: Vec<String>,
    pub has_headers: bool,
}

impl FindlibPackage {
    pub fn new(name: &str, dir: Path) -> FindlibPackage {
        FindlibPackage {
            name: InternedString::new(name),
            dir,
            version: None,
            description: None,
            requires: Vec::new(),
            ppx_runtime_deps: Vec::new(),
            byte_archives: Vec::new(),
            native_archives: Vec::new(),
            jsoo_runtime: Vec::new(),
            has_headers: false,
        }
    }

    pub fn archives(&self, mode: Mode) -> Vec<Path> {
        let names = match mode {
            Mode::Byte => &self.byte_archives,
            Mode::Native => &self.native_archives,
        };
        names.iter().map(|n| self.dir.append(n)).collect()
    }
}

pub struct Findlib {
    packages: HashMap<InternedString, Arc<FindlibPackage>>,
}

impl Findlib {
    pub fn from_packages(pkgs: Vec<FindlibPackage>) -> Findlib {
        Findlib {
            packages: pkgs
                .into_iter()
                .map(|p| (p.name, Arc::new(p)))
                .collect(),
        }
    }

    pub fn empty() -> Findlib {
        Findlib {
            packages: HashMap::new(),
        }
    }

    pub fn find(&self, name: InternedString) -> Option<Arc<FindlibPackage>> {
        self.packages.get(&name).cloned()
    }

    /// Transitive dependency closure in link order: requirements before
    /// requirers, first occurrence wins.
    pub fn closure(
        &self,
        pkgs: &[Arc<FindlibPackage>],
    ) -> GantryResult<Vec<Arc<FindlibPackage>>> {
        let mut acc: IndexMap<InternedString, Arc<FindlibPackage>> = IndexMap::new();
        for pkg in pkgs {
            self.visit(pkg, &mut acc)?;
        }
        trace!(
            "findlib closure of {} roots has {} packages",
            pkgs.len(),
            acc.len()
        );
        Ok(acc.into_iter().map(|(_, p)| p).collect())
    }

    fn visit(
        &self,
        pkg: &Arc<FindlibPackage>,
        acc: &mut IndexMap<InternedString, Arc<FindlibPackage>>,
    ) -> GantryResult<()> {
        if acc.contains_key(&pkg.name) {
            return Ok(());
        }
        for &req in &pkg.requires {
            match self.find(req) {
                Some(dep) => self.visit(&dep, acc)?,
                None => bail!(
                    "external package {} (required by {}) not found",
                    req,
                    pkg.name
                ),
            }
        }
        acc.insert(pkg.name, Arc::clone(pkg));
        Ok(())
    }

    /// Closure of the *runtime* dependencies of a preprocessor-plugin set:
    /// what executables preprocessed by these plugins must link against.
    pub fn closed_ppx_runtime_deps_of(
        &self,
        pkgs: &[Arc<FindlibPackage>],
    ) -> GantryResult<Vec<Arc<FindlibPackage>>> {
        let closed = self.closure(pkgs)?;
        let mut runtime_roots = Vec::new();
        for pkg in &closed {
            for &dep in &pkg.ppx_runtime_deps {
                match self.find(dep) {
                    Some(p) => runtime_roots.push(p),
                    None => bail!(
                        "external package {} (ppx runtime dependency of {}) not found",
                        dep,
                        pkg.name
                    ),
                }
            }
        }
        self.closure(&runtime_roots)
    }

    /// The findlib root of a dotted package name, for META segmentation.
    pub fn root_package_name(name: &str) -> &str {
        match name.find('.') {
            Some(i) => &name[..i],
            None => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(name: &str, requires: &[&str]) -> FindlibPackage {
        let mut p = FindlibPackage::new(name, Path::absolute(format!("/lib/{}", name)));
        p.requires = requires.iter().map(|r| InternedString::new(r)).collect();
        p
    }

    fn names(pkgs: &[Arc<FindlibPackage>]) -> Vec<&'static str> {
        pkgs.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn closure_is_deps_first_with_first_occurrence_dedup() {
        let db = Findlib::from_packages(vec![
            pkg("a", &["b", "c"]),
            pkg("b", &["c"]),
            pkg("c", &[]),
        ]);
        let a = db.find(InternedString::new("a")).unwrap();
        let closed = db.closure(&[a]).unwrap();
        assert_eq!(names(&closed), vec!["c", "b", "a"]);
    }

    #[test]
    fn runtime_closure_follows_runtime_edges() {
        let mut rewriter = pkg("ppx_x", &["compiler-libs"]);
        rewriter.ppx_runtime_deps = vec![InternedString::new("ppx_x.runtime")];
        let db = Findlib::from_packages(vec![
            rewriter,
            pkg("compiler-libs", &[]),
            pkg("ppx_x.runtime", &["unix"]),
            pkg("unix", &[]),
        ]);
        let root = db.find(InternedString::new("ppx_x")).unwrap();
        let runtime = db.closed_ppx_runtime_deps_of(&[root]).unwrap();
        assert_eq!(names(&runtime), vec!["unix", "ppx_x.runtime"]);
    }

    #[test]
    fn root_package_name_strips_subpackages() {
        assert_eq!(Findlib::root_package_name("ppx_x.runtime"), "ppx_x");
        assert_eq!(Findlib::root_package_name("str"), "str");
    }
}
