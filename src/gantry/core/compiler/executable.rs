//! Executable link rules: one per `(name, mode)` pair, closing the module
//! set from the executable's main module and linking the library closure
//! in front of the ordered module objects.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, bail};

use crate::core::build::{Arg, Build, RunBuilder};
use crate::core::compiler::module_rules::cm_file;
use crate::core::compiler::{Context, Mode};
use crate::core::interning::InternedString;
use crate::core::libdb::ResolvedLib;
use crate::core::modules::{module_name_of_stem, MlKind, ModuleMap};
use crate::core::ordered_set_lang::OrderedSetLang;
use crate::core::paths::Path;
use crate::core::vfile::{DepMap, Vspec};
use crate::util::errors::GantryResult;
use crate::util::graph::link_closure;

type ExeInput = ((Vec<String>, Vec<ResolvedLib>), DepMap);

pub fn exe_path(dir: &Path, name: &str, mode: Mode) -> Path {
    match mode {
        Mode::Byte => dir.append(&format!("{}.bc", name)),
        Mode::Native => dir.append(&format!("{}.exe", name)),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn setup_exe_rules(
    ctx: &mut Context,
    dir: &Path,
    names: &[String],
    modules: &ModuleMap,
    obj_names: &BTreeMap<InternedString, String>,
    dep_specs: &BTreeMap<MlKind, Vspec<DepMap>>,
    requires: &Build<(), Vec<ResolvedLib>>,
    link_flags: &OrderedSetLang,
    modes: &BTreeSet<Mode>,
) -> GantryResult<()> {
    for name in names {
        let root = module_name_of_stem(name);
        if !modules.contains_key(&root) {
            bail!(
                "executable {} in {} has no corresponding module {}",
                name,
                dir,
                root
            );
        }
        for &mode in modes {
            let Some(compiler) = ctx.config.compiler(mode) else {
                continue;
            };
            let target = exe_path(dir, name, mode);
            let cm_kind = mode.cm_kind();

            let input = link_flags
                .eval(dir, Vec::new())
                .fanout(requires.clone())
                .fanout(Build::vpath(&dep_specs[&MlKind::Impl]));

            let objs_for_deps = obj_names.clone();
            let dep_dir = dir.clone();
            let ext_obj = ctx.config.ext_obj.clone();
            let build = input.then(Build::dyn_paths(Build::try_arr(
                move |((_, libs), map): ExeInput| {
                    let order =
                        link_closure(&[root], &map).map_err(|e| anyhow!(e))?;
                    let mut paths: Vec<Path> = libs
                        .iter()
                        .flat_map(|l| l.archives(mode))
                        .collect();
                    for unit in order {
                        let Some(obj) = objs_for_deps.get(&unit) else { continue };
                        paths.push(cm_file(&dep_dir, obj, cm_kind));
                        if mode == Mode::Native {
                            paths.push(dep_dir.append(&format!("{}{}", obj, ext_obj)));
                        }
                    }
                    Ok(paths)
                },
            )));

            let arg_dir = dir.clone();
            let objs_for_args = obj_names.clone();
            let run = RunBuilder::new(dir, &compiler)
                .args(vec![Arg::a("-o"), Arg::Target(target)])
                .arg(Arg::dyn_of(|((flags, _), _): &ExeInput| flags.clone()))
                .arg(Arg::dyn_of(move |((_, libs), _): &ExeInput| {
                    libs.iter()
                        .flat_map(|l| l.archives(mode))
                        .map(|p| p.reach(&arg_dir))
                        .collect()
                }))
                .arg(Arg::try_dyn_of(move |(_, map): &ExeInput| {
                    let order =
                        link_closure(&[root], map).map_err(|e| anyhow!(e))?;
                    Ok(order
                        .iter()
                        .filter_map(|unit| objs_for_args.get(unit))
                        .map(|obj| format!("{}.{}", obj, cm_kind.ext()))
                        .collect())
                }))
                .into_build();
            ctx.add_rule(build.then(run));
        }
    }
    Ok(())
}
