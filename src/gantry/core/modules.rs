//! Module discovery: from a directory's flat file set, infer the modules
//! and their implementation/interface file pairs.

use anyhow::bail;
use indexmap::IndexMap;

use crate::core::interning::InternedString;
use crate::core::ordered_set_lang::OrderedSetLang;
use crate::core::paths::Path;
use crate::util::errors::GantryResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MlKind {
    Impl,
    Intf,
}

impl MlKind {
    pub fn ext(self) -> &'static str {
        match self {
            MlKind::Impl => "ml",
            MlKind::Intf => "mli",
        }
    }

    /// The scanner/compiler flag forcing a file to be read as this kind.
    pub fn force_flag(self) -> &'static str {
        match self {
            MlKind::Impl => "-impl",
            MlKind::Intf => "-intf",
        }
    }
}

/// One compilation unit of a directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    /// Capitalized stem of the implementation file.
    pub name: InternedString,
    pub impl_file: String,
    pub intf_file: Option<String>,
    /// The stem compiled artifacts are named after; assigned during
    /// library or executable setup, possibly `{lib}__{Name}`-prefixed.
    pub obj_name: String,
}

impl Module {
    pub fn file(&self, kind: MlKind) -> Option<&str> {
        match kind {
            MlKind::Impl => Some(&self.impl_file),
            MlKind::Intf => self.intf_file.as_deref(),
        }
    }

    pub fn has_intf(&self) -> bool {
        self.intf_file.is_some()
    }
}

/// The module set of a directory, keyed by module name in sorted order.
pub type ModuleMap = IndexMap<InternedString, Module>;

pub fn module_name_of_stem(stem: &str) -> InternedString {
    let mut chars = stem.chars();
    match chars.next() {
        Some(first) => {
            let capitalized: String =
                first.to_uppercase().chain(chars).collect();
            InternedString::new(&capitalized)
        }
        None => InternedString::new(""),
    }
}

fn stem_of(file: &str) -> &str {
    match file.rfind('.') {
        Some(i) => &file[..i],
        None => file,
    }
}

/// Infers the module set from a directory's files. Duplicate stems within
/// a group and interface-only stems are fatal.
pub fn guess_modules(dir: &Path, files: &[String]) -> GantryResult<ModuleMap> {
    let impls = group_by_stem(dir, files, "ml")?;
    let mut intfs = group_by_stem(dir, files, "mli")?;
    let mut modules = ModuleMap::new();
    for (name, impl_file) in impls {
        let intf_file = intfs.shift_remove(&name);
        modules.insert(
            name,
            Module {
                name,
                impl_file,
                intf_file,
                obj_name: String::new(),
            },
        );
    }
    if let Some((name, intf_file)) = intfs.into_iter().next() {
        bail!(
            "module {} in {} has an interface ({}) but no implementation",
            name,
            dir,
            intf_file
        );
    }
    modules.sort_keys();
    Ok(modules)
}

fn group_by_stem(
    dir: &Path,
    files: &[String],
    ext: &str,
) -> GantryResult<IndexMap<InternedString, String>> {
    let mut map: IndexMap<InternedString, String> = IndexMap::new();
    let mut sorted: Vec<&String> = files
        .iter()
        .filter(|f| std::path::Path::new(f.as_str()).extension().map_or(false, |e| e == ext))
        .collect();
    sorted.sort();
    for file in sorted {
        let name = module_name_of_stem(stem_of(file));
        if let Some(previous) = map.insert(name, file.clone()) {
            bail!(
                "module {} in {} is defined by two files: {} and {}",
                name,
                dir,
                previous,
                file
            );
        }
    }
    Ok(map)
}

/// Filters the discovered modules against the stanza's `modules` field;
/// names that do not correspond to a discovered module are fatal.
pub fn parse_modules(
    dir: &Path,
    declared: &OrderedSetLang,
    discovered: &ModuleMap,
) -> GantryResult<ModuleMap> {
    let standard: Vec<String> = discovered.keys().map(|k| k.to_string()).collect();
    let names = declared.eval_static(&standard)?;
    let mut keep: Vec<InternedString> = Vec::new();
    for name in names {
        let name = InternedString::new(&name);
        if !discovered.contains_key(&name) {
            bail!("module {} in {} doesn't exist", name, dir);
        }
        keep.push(name);
    }
    Ok(discovered
        .iter()
        .filter(|(name, _)| keep.contains(name))
        .map(|(name, m)| (*name, m.clone()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir() -> Path {
        Path::source("src")
    }

    fn files(fs: &[&str]) -> Vec<String> {
        fs.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn pairs_impls_with_intfs() {
        let modules =
            guess_modules(&dir(), &files(&["b.ml", "a.ml", "b.mli", "README"])).unwrap();
        assert_eq!(
            modules.keys().map(|k| k.as_str()).collect::<Vec<_>>(),
            vec!["A", "B"]
        );
        let b = &modules[&InternedString::new("B")];
        assert_eq!(b.impl_file, "b.ml");
        assert_eq!(b.intf_file.as_deref(), Some("b.mli"));
        assert_eq!(b.obj_name, "");
    }

    #[test]
    fn interface_without_implementation_is_fatal() {
        let err = guess_modules(&dir(), &files(&["a.mli"])).unwrap_err();
        assert!(err.to_string().contains("no implementation"));
    }

    #[test]
    fn duplicate_stems_are_fatal() {
        // Two spellings capitalizing to the same module name.
        let err = guess_modules(&dir(), &files(&["foo.ml", "Foo.ml"])).unwrap_err();
        assert!(err.to_string().contains("two files"));
    }

    #[test]
    fn declared_modules_filter_the_discovered_set() {
        let discovered = guess_modules(&dir(), &files(&["a.ml", "b.ml", "c.ml"])).unwrap();
        let declared = OrderedSetLang::atoms(["A", "C"]);
        let kept = parse_modules(&dir(), &declared, &discovered).unwrap();
        assert_eq!(
            kept.keys().map(|k| k.as_str()).collect::<Vec<_>>(),
            vec!["A", "C"]
        );

        let unknown = OrderedSetLang::atoms(["Nope"]);
        let err = parse_modules(&dir(), &unknown, &discovered).unwrap_err();
        assert!(err.to_string().contains("doesn't exist"));
    }
}
