//! The preprocessor pipeline.
//!
//! Each module is lifted through its preprocessing choice; the lifted
//! record points at the `foo.pp.ml`/`foo.pp.mli` counterparts so every
//! later rule sees the preprocessed files. The `.pp.` infix precedes the
//! extension, keeping the interface/implementation pairing intact for
//! downstream tooling.
//!
//! Plugin-driver pipelines share one driver executable per plugin set:
//! the set is canonicalized to a sorted `+`-joined key and memoized in
//! the generation context, so at most one driver rule is emitted per key
//! across the whole graph.

use std::collections::BTreeSet;

use log::debug;

use itertools::Itertools;

use crate::core::build::{Arg, Build, RunBuilder};
use crate::core::compiler::{Context, Mode, PpxDriver};
use crate::core::interning::InternedString;
use crate::core::libdb::ResolvedLib;
use crate::core::modules::{MlKind, Module, ModuleMap};
use crate::core::paths::Path;
use crate::core::stanza::{LibDep, Preprocess};

/// The driver-core library linked into every driver, and the runner that
/// must come last in link order.
pub const DRIVER_CORE: &str = "ppx_driver";
pub const DRIVER_RUNNER: &str = "ppx_driver_runner";
/// The fixed plugin backing the macro-style `Metaquot` choice.
pub const METAQUOT: &str = "ppx_metaquot";

/// Well-known plugin identities recognized when synthesizing
/// per-invocation arguments.
const LOCATION_INJECTION: &str = "ppx_here";
const INLINE_TEST_INFRA: &str = "ppx_inline_test";
const INLINE_BENCH_INFRA: &str = "ppx_bench";

pub fn pp_key(pps: &BTreeSet<InternedString>) -> String {
    pps.iter().join("+")
}

/// Returns the shared driver for a plugin set, emitting its build rules
/// on first use.
pub fn get_ppx_driver(ctx: &mut Context, pps: &BTreeSet<InternedString>) -> PpxDriver {
    let key = pp_key(pps);
    if let Some(driver) = ctx.ppx_driver(&key) {
        return driver;
    }
    debug!("building preprocessor driver for {}", key);
    let ppx_dir = ctx.config.build_path(&format!(".ppx/{}", key));
    let exe = ppx_dir.append("ppx.exe");

    let mut deps: Vec<LibDep> = vec![LibDep::direct(DRIVER_CORE)];
    deps.extend(pps.iter().map(|&p| LibDep::Direct(p)));
    let runner_dep = [LibDep::direct(DRIVER_RUNNER)];
    // The runner must close the link line, so it is fanned out separately
    // and appended after the plugin closure.
    let libs = ctx
        .libdb
        .closure(&ppx_dir, &deps)
        .fanout(ctx.libdb.closure(&ppx_dir, &runner_dep))
        .map(|(mut plugins, runner)| {
            plugins.retain(|l| {
                !runner.iter().any(|r| r.best_name() == l.best_name())
            });
            plugins.extend(runner);
            plugins
        });

    let mode = if ctx.config.ocamlopt.is_some() {
        Mode::Native
    } else {
        Mode::Byte
    };
    let compiler = ctx.config.compiler(mode).expect("no compiler configured");
    let dir_for_args = ppx_dir.clone();
    let link = libs
        .clone()
        .then(Build::dyn_paths(Build::arr(|libs: Vec<ResolvedLib>| {
            libs.iter()
                .filter(|l| l.is_internal())
                .flat_map(|l| l.archives(Mode::Native))
                .collect()
        })))
        .then(
            RunBuilder::new(&ppx_dir, &compiler)
                .arg(Arg::a("-linkall"))
                .arg(Arg::dyn_of(move |libs: &Vec<ResolvedLib>| {
                    libs.iter()
                        .flat_map(|l| l.archives(mode))
                        .map(|p| p.reach(&dir_for_args))
                        .collect()
                }))
                .arg(Arg::a("-o"))
                .arg(Arg::Target(exe.clone()))
                .into_build(),
        );
    ctx.add_rule(link);

    let driver = PpxDriver { exe, libs };
    ctx.memoize_ppx_driver(key, driver.clone());
    driver
}

/// Arguments synthesized per invocation by inspecting the driver's closed
/// library set for well-known plugin identities. The consuming stanza's
/// library name feeds the inline-test flag.
fn invocation_args(
    libs: &[ResolvedLib],
    dir: &Path,
    lib_name: Option<InternedString>,
    drop_inline_tests: bool,
) -> Vec<String> {
    let names: BTreeSet<&str> = libs.iter().map(|l| l.best_name().as_str()).collect();
    let mut args = Vec::new();
    if names.contains(LOCATION_INJECTION) {
        let dirname = match dir.extract_build_context() {
            Some((_, sub)) => sub.display().to_string(),
            None => dir.to_string(),
        };
        args.push("-dirname".to_string());
        args.push(dirname);
    }
    if names.contains(INLINE_TEST_INFRA) {
        if let Some(lib) = lib_name {
            args.push("-inline-test-lib".to_string());
            args.push(lib.to_string());
        }
        if drop_inline_tests {
            args.push("-inline-test-drop-with-deadcode".to_string());
        }
    }
    if names.contains(INLINE_BENCH_INFRA) && drop_inline_tests {
        args.push("-bench-drop-with-deadcode".to_string());
    }
    args
}

fn pp_file_name(file: &str) -> String {
    match file.rfind('.') {
        Some(i) => format!("{}.pp.{}", &file[..i], &file[i + 1..]),
        None => format!("{}.pp", file),
    }
}

/// Lifts every module of a stanza through its preprocessing choice,
/// emitting the rewrite rules and returning the replaced records.
pub fn pp_modules(
    ctx: &mut Context,
    dir: &Path,
    modules: &ModuleMap,
    preprocess: &crate::core::stanza::PreprocessMap,
    extra_deps: &Build<(), ()>,
    lib_name: Option<InternedString>,
) -> ModuleMap {
    modules
        .iter()
        .map(|(&name, module)| {
            let choice = preprocess.get(name);
            (name, pp_module(ctx, dir, module, choice, extra_deps, lib_name))
        })
        .collect()
}

fn pp_module(
    ctx: &mut Context,
    dir: &Path,
    module: &Module,
    choice: &Preprocess,
    extra_deps: &Build<(), ()>,
    lib_name: Option<InternedString>,
) -> Module {
    match choice {
        Preprocess::NoPreprocessing => module.clone(),
        Preprocess::Command(cmd) => {
            let mut lifted = module.clone();
            for kind in [MlKind::Impl, MlKind::Intf] {
                let Some(file) = module.file(kind) else { continue };
                let src = dir.append(file);
                let target_name = pp_file_name(file);
                let target = dir.append(&target_name);
                let cmd = format!("{} {} > {}", cmd, src.reach(dir), target.reach(dir));
                let build = extra_deps
                    .clone()
                    .then(Build::path(&src))
                    .then(Build::bash(dir, cmd, vec![target]));
                ctx.add_rule(build);
                set_file(&mut lifted, kind, target_name);
            }
            lifted
        }
        Preprocess::Metaquot => {
            let pps = [InternedString::new(METAQUOT)].into_iter().collect();
            pps_module(ctx, dir, module, &pps, &[], extra_deps, lib_name)
        }
        Preprocess::Pps { pps, flags } => {
            let pps = pps.iter().copied().collect();
            pps_module(ctx, dir, module, &pps, flags, extra_deps, lib_name)
        }
    }
}

fn pps_module(
    ctx: &mut Context,
    dir: &Path,
    module: &Module,
    pps: &BTreeSet<InternedString>,
    flags: &[String],
    extra_deps: &Build<(), ()>,
    lib_name: Option<InternedString>,
) -> Module {
    let driver = get_ppx_driver(ctx, pps);
    let drop_inline_tests = ctx.config.drop_inline_tests;
    let mut lifted = module.clone();
    for kind in [MlKind::Impl, MlKind::Intf] {
        let Some(file) = module.file(kind) else { continue };
        let src = dir.append(file);
        let target_name = pp_file_name(file);
        let target = dir.append(&target_name);
        let cookie_dir = dir.clone();
        let run = RunBuilder::new(dir, &driver.exe)
            .arg(Arg::dyn_of(move |libs: &Vec<ResolvedLib>| {
                invocation_args(libs, &cookie_dir, lib_name, drop_inline_tests)
            }))
            .args(flags.iter().map(|f| Arg::a(f.clone())).collect())
            .arg(Arg::a("-o"))
            .arg(Arg::Target(target))
            .arg(Arg::a(kind.force_flag()))
            .arg(Arg::Dep(src))
            .into_build();
        let build = extra_deps.clone().then(driver.libs.clone()).then(run);
        ctx.add_rule(build);
        set_file(&mut lifted, kind, target_name);
    }
    lifted
}

fn set_file(module: &mut Module, kind: MlKind, file: String) {
    match kind {
        MlKind::Impl => module.impl_file = file,
        MlKind::Intf => module.intf_file = Some(file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_sorted_and_plus_joined() {
        let pps: BTreeSet<InternedString> = ["ppx_y", "ppx_x"]
            .into_iter()
            .map(InternedString::new)
            .collect();
        assert_eq!(pp_key(&pps), "ppx_x+ppx_y");
    }

    #[test]
    fn pp_infix_precedes_the_extension() {
        assert_eq!(pp_file_name("foo.ml"), "foo.pp.ml");
        assert_eq!(pp_file_name("foo.mli"), "foo.pp.mli");
    }

    #[test]
    fn inline_test_flag_needs_the_library_name() {
        let libs = vec![ResolvedLib::External(std::sync::Arc::new(
            crate::core::package::FindlibPackage::new(
                INLINE_TEST_INFRA,
                Path::absolute("/lib/ppx_inline_test"),
            ),
        ))];
        let dir = Path::build(InternedString::new("default"), "src");
        let with_lib = invocation_args(&libs, &dir, Some(InternedString::new("mylib")), false);
        assert_eq!(with_lib, vec!["-inline-test-lib", "mylib"]);
        let without = invocation_args(&libs, &dir, None, false);
        assert!(without.is_empty());
    }
}
