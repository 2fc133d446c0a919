//! Library archive rules: per-mode archives, the native shared object,
//! and the all-cm sentinel files downstream directories depend on instead
//! of enumerating individual artifacts.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;

use crate::core::build::{Arg, Build, RunBuilder};
use crate::core::compiler::module_rules::cm_file;
use crate::core::compiler::{CmKind, Context, Mode};
use crate::core::interning::InternedString;
use crate::core::modules::{MlKind, ModuleMap};
use crate::core::paths::Path;
use crate::core::stanza::LibSpec;
use crate::core::vfile::{DepMap, Vspec};
use crate::util::graph::link_closure;

pub fn lib_cm_all_path(dir: &Path, lib: InternedString, kind: CmKind) -> Path {
    dir.append(&format!("{}.{}-all", lib, kind.ext()))
}

fn lib_archive_path(dir: &Path, lib: &LibSpec, mode: Mode) -> Path {
    dir.append(&format!("{}.{}", lib.name, mode.compiled_lib_ext()))
}

/// The dynamic input of an archive rule: evaluated flag sets and the
/// per-directory dependency map driving link order.
type ArchiveInput = ((Vec<String>, Vec<String>), DepMap);

/// Closes the module set to link order and maps each unit to its `obj`
/// artifacts. Cycles are diagnosed here, when the rule is realized.
fn link_ordered_objs(
    map: &DepMap,
    roots: &[InternedString],
    obj_names: &BTreeMap<InternedString, String>,
) -> anyhow::Result<Vec<String>> {
    let order = link_closure(roots, map).map_err(|e| anyhow!(e))?;
    Ok(order
        .iter()
        .filter_map(|name| obj_names.get(name).cloned())
        .collect())
}

/// Emits archive, shared-object and sentinel rules for one library.
#[allow(clippy::too_many_arguments)]
pub fn setup_lib_archives(
    ctx: &mut Context,
    dir: &Path,
    lib: &Arc<LibSpec>,
    modules: &ModuleMap,
    obj_names: &BTreeMap<InternedString, String>,
    dep_specs: &BTreeMap<MlKind, Vspec<DepMap>>,
) {
    let stubs_archive = dir.append(&format!("lib{}{}", lib.stubs_name(), ctx.config.ext_lib));
    let roots: Vec<InternedString> = modules.keys().copied().collect();

    for mode in lib.modes.clone() {
        let Some(compiler) = ctx.config.compiler(mode) else {
            continue;
        };
        let target = lib_archive_path(dir, lib, mode);
        let cm_kind = mode.cm_kind();

        let flag_sets = lib
            .library_flags
            .eval(dir, Vec::new())
            .fanout(lib.c_library_flags.eval(dir, Vec::new()));
        let build = flag_sets.fanout(Build::vpath(&dep_specs[&MlKind::Impl]));

        let objs_for_deps = obj_names.clone();
        let roots_for_deps = roots.clone();
        let dep_dir = dir.clone();
        let ext_obj = ctx.config.ext_obj.clone();
        let build = build.then(Build::dyn_paths(Build::try_arr(
            move |(_, map): ArchiveInput| {
                let objs = link_ordered_objs(&map, &roots_for_deps, &objs_for_deps)?;
                let mut paths = Vec::new();
                for obj in objs {
                    paths.push(cm_file(&dep_dir, &obj, cm_kind));
                    if mode == Mode::Native {
                        paths.push(dep_dir.append(&format!("{}{}", obj, ext_obj)));
                    }
                }
                Ok(paths)
            },
        )));
        let build = if lib.has_stubs() {
            build.then(Build::path(&stubs_archive))
        } else {
            build
        };

        let mut run = RunBuilder::new(dir, &compiler)
            .arg(Arg::a("-a"))
            .arg(Arg::dyn_of(|((lib_flags, _), _): &ArchiveInput| {
                lib_flags.clone()
            }));
        if lib.kind.is_ppx() {
            run = run.arg(Arg::a("-linkall"));
        }
        if lib.has_stubs() {
            match mode {
                Mode::Byte => {
                    run = run.args(vec![
                        Arg::a("-dllib"),
                        Arg::a(format!("-l{}", lib.stubs_name())),
                        Arg::a("-cclib"),
                        Arg::a(format!("-l{}", lib.stubs_name())),
                    ]);
                }
                Mode::Native => {
                    run = run.args(vec![
                        Arg::a("-cclib"),
                        Arg::a(format!("-l{}", lib.stubs_name())),
                    ]);
                }
            }
        }
        run = run.arg(Arg::try_dyn_of(|((_, c_flags), _): &ArchiveInput| {
            Ok(c_flags
                .iter()
                .flat_map(|f| ["-cclib".to_string(), f.clone()])
                .collect())
        }));
        let objs_for_args = obj_names.clone();
        let roots_for_args = roots.clone();
        run = run
            .args(vec![Arg::a("-o"), Arg::Target(target.clone())])
            .arg(Arg::try_dyn_of(move |(_, map): &ArchiveInput| {
                let objs = link_ordered_objs(map, &roots_for_args, &objs_for_args)?;
                Ok(objs
                    .into_iter()
                    .map(|obj| format!("{}.{}", obj, cm_kind.ext()))
                    .collect())
            }));
        if mode == Mode::Native {
            run = run.extra_targets(vec![
                dir.append(&format!("{}{}", lib.name, ctx.config.ext_lib)),
            ]);
        }
        ctx.add_rule(build.then(run.into_build()));

        if mode == Mode::Native {
            setup_cmxs_rule(ctx, dir, lib, &target, &stubs_archive, &compiler);
        }
    }

    setup_cm_all_sentinels(ctx, dir, lib, modules, obj_names);
}

fn setup_cmxs_rule(
    ctx: &mut Context,
    dir: &Path,
    lib: &LibSpec,
    cmxa: &Path,
    stubs_archive: &Path,
    compiler: &Path,
) {
    let target = dir.append(&format!("{}.cmxs", lib.name));
    let mut build: Build<(), ()> = Build::path(cmxa);
    if lib.has_stubs() {
        build = build.then(Build::path(stubs_archive));
    }
    let run = RunBuilder::new(dir, compiler)
        .args(vec![Arg::a("-shared"), Arg::a("-linkall")])
        .args(vec![Arg::a("-I"), Arg::a(".")])
        .arg(Arg::Path(cmxa.clone()))
        .args(vec![Arg::a("-o"), Arg::Target(target)])
        .into_build();
    ctx.add_rule(build.then(run));
}

/// Zero-byte files whose dependencies are all the library's cm files of
/// one kind; consumers depend on the sentinel instead of the files.
fn setup_cm_all_sentinels(
    ctx: &mut Context,
    dir: &Path,
    lib: &LibSpec,
    modules: &ModuleMap,
    obj_names: &BTreeMap<InternedString, String>,
) {
    let have_byte = ctx.config.ocamlc.is_some();
    let have_native = lib.modes.contains(&Mode::Native) && ctx.config.ocamlopt.is_some();
    let mut kinds = Vec::new();
    // cmi files exist as long as either side can compile; when the byte
    // side is absent the native rules produce them.
    if have_byte || have_native {
        kinds.push(CmKind::Cmi);
    }
    if lib.modes.contains(&Mode::Byte) && have_byte {
        kinds.push(CmKind::Cmo);
    }
    if have_native {
        kinds.push(CmKind::Cmx);
    }
    for kind in kinds {
        let files: Vec<Path> = modules
            .keys()
            .filter_map(|name| obj_names.get(name))
            .map(|obj| cm_file(dir, obj, kind))
            .collect();
        let sentinel = lib_cm_all_path(dir, lib.name, kind);
        let build = Build::<(), ()>::paths(files).then(Build::create_file(&sentinel));
        ctx.add_rule(build);
    }
}
