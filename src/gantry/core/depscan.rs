//! Dependency-scanner plumbing.
//!
//! Per `MlKind`, one rule runs the external scanner over every module file
//! of that kind and redirects its raw output; a second rule parses the
//! raw output into a module-to-dependencies map and persists it. All
//! downstream consumers read the persisted map through `vpath`, so the
//! dynamic part of the graph is materialized lazily.

use std::collections::BTreeMap;

use anyhow::bail;

use crate::core::build::{Action, Arg, Build, RunBuilder};
use crate::core::compiler::Config;
use crate::core::interning::InternedString;
use crate::core::modules::{module_name_of_stem, MlKind, ModuleMap};
use crate::core::paths::Path;
use crate::core::vfile::{DepMap, Vspec};
use crate::util::errors::GantryResult;

fn kind_str(kind: MlKind) -> &'static str {
    match kind {
        MlKind::Impl => "impl",
        MlKind::Intf => "intf",
    }
}

pub fn depends_path(dir: &Path, item: InternedString, kind: MlKind) -> Path {
    dir.append(&format!("{}.depends.{}.sexp", item, kind_str(kind)))
}

fn raw_output_path(dir: &Path, item: InternedString, kind: MlKind) -> Path {
    dir.append(&format!("{}.depends.{}.ocamldep-output", item, kind_str(kind)))
}

/// Emits the scan and parse rules for one stanza and returns the
/// persisted-map spec per kind.
pub fn rules(
    config: &Config,
    dir: &Path,
    item: InternedString,
    modules: &ModuleMap,
    alias_module: Option<InternedString>,
) -> (Vec<Build<(), Action>>, BTreeMap<MlKind, Vspec<DepMap>>) {
    let mut out = Vec::new();
    let mut specs = BTreeMap::new();
    for kind in [MlKind::Impl, MlKind::Intf] {
        let raw = raw_output_path(dir, item, kind);
        let spec = Vspec::dep_map(depends_path(dir, item, kind));

        let mut scan = RunBuilder::new(dir, &Path::absolute(config.ocamldep.clone()))
            .arg(Arg::a("-modules"));
        for module in modules.values() {
            if let Some(file) = module.file(kind) {
                // The scanner infers the kind from the extension; force it
                // for anything nonstandard (e.g. preprocessed files).
                if !file.ends_with(&format!(".{}", kind.ext())) {
                    scan = scan.arg(Arg::a(kind.force_flag()));
                }
                scan = scan.arg(Arg::Dep(dir.append(file)));
            }
        }
        out.push(scan.stdout_to(&raw).into_build::<()>());

        let module_names: Vec<InternedString> = modules.keys().copied().collect();
        let parse = Build::lines_of(&raw).try_map(move |lines: Vec<String>| {
            parse_deps(&lines, &module_names, alias_module)
        });
        out.push(parse.then(Build::store_vfile(&spec)));
        specs.insert(kind, spec);
    }
    (out, specs)
}

/// Parses scanner output lines of the form `<filename>: <modules...>`.
/// Kept are the modules of the same stanza, minus the unit itself. The
/// alias module, when present, gets an empty entry and is prepended to
/// every other unit's list.
fn parse_deps(
    lines: &[String],
    modules: &[InternedString],
    alias_module: Option<InternedString>,
) -> GantryResult<DepMap> {
    let mut scanned: BTreeMap<InternedString, Vec<InternedString>> = BTreeMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((file, words)) = line.split_once(':') else {
            bail!("unable to parse ocamldep output line: {:?}", line);
        };
        let stem = match file.rfind('.') {
            Some(i) => &file[..i],
            None => file,
        };
        let stem = stem.rsplit('/').next().unwrap_or(stem);
        // Preprocessed units scan as `foo.pp`; strip the infix.
        let stem = stem.strip_suffix(".pp").unwrap_or(stem);
        let unit = module_name_of_stem(stem);
        let deps: Vec<InternedString> = words
            .split_whitespace()
            .map(InternedString::new)
            .filter(|&d| d != unit && modules.contains(&d))
            .collect();
        if scanned.insert(unit, deps).is_some() {
            bail!("module {} appears twice in the scanner output", unit);
        }
    }
    let mut map = DepMap::new();
    if let Some(alias) = alias_module {
        map.insert(alias, Vec::new());
    }
    for &name in modules {
        if Some(name) == alias_module {
            continue;
        }
        let mut deps = scanned.get(&name).cloned().unwrap_or_default();
        if let Some(alias) = alias_module {
            deps.insert(0, alias);
        }
        map.insert(name, deps);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::modules::guess_modules;
    use crate::core::build::Rule;

    fn ctx_dir() -> Path {
        Path::build(InternedString::new("default"), "src")
    }

    fn n(s: &str) -> InternedString {
        InternedString::new(s)
    }

    #[test]
    fn parse_filters_self_and_foreign_modules() {
        let modules = vec![n("Foo"), n("Bar")];
        let lines = vec![
            "foo.ml: Bar List Foo".to_string(),
            "bar.ml:".to_string(),
        ];
        let map = parse_deps(&lines, &modules, None).unwrap();
        assert_eq!(map[&n("Foo")], vec![n("Bar")]);
        assert_eq!(map[&n("Bar")], Vec::<InternedString>::new());
    }

    #[test]
    fn alias_module_is_injected_and_prepended() {
        let modules = vec![n("Mylib__"), n("A"), n("B")];
        let lines = vec!["a.ml: B".to_string(), "b.ml:".to_string()];
        let map = parse_deps(&lines, &modules, Some(n("Mylib__"))).unwrap();
        assert_eq!(map.get_index(0).unwrap().0, &n("Mylib__"));
        assert_eq!(map[&n("Mylib__")], Vec::<InternedString>::new());
        assert_eq!(map[&n("A")], vec![n("Mylib__"), n("B")]);
        assert_eq!(map[&n("B")], vec![n("Mylib__")]);
    }

    #[test]
    fn malformed_line_and_duplicate_unit_are_errors() {
        let modules = vec![n("Foo")];
        let err = parse_deps(&["garbage".to_string()], &modules, None).unwrap_err();
        assert!(err.to_string().contains("unable to parse"));

        let err = parse_deps(
            &["foo.ml:".to_string(), "foo.ml: X".to_string()],
            &modules,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("appears twice"));
    }

    #[test]
    fn scan_rules_depend_on_the_module_files() {
        let config = Config::new("default");
        let dir = ctx_dir();
        let modules = guess_modules(
            &Path::source("src"),
            &["foo.ml".to_string(), "foo.mli".to_string()],
        )
        .unwrap();
        let (builds, specs) = rules(&config, &dir, n("foo"), &modules, None);
        assert_eq!(builds.len(), 4);
        let rules: Vec<Rule> = builds.into_iter().map(Rule::new).collect();
        assert!(rules[0].inputs.contains(&dir.append("foo.ml")));
        assert!(rules[0]
            .targets
            .contains(&raw_output_path(&dir, n("foo"), MlKind::Impl)));
        assert!(rules[1]
            .targets
            .contains(&depends_path(&dir, n("foo"), MlKind::Impl)));
        assert!(specs.contains_key(&MlKind::Impl));
        assert!(specs.contains_key(&MlKind::Intf));
    }
}
