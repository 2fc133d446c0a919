//! Per-module compilation rules.
//!
//! For each module and artifact kind (`cmi`/`cmo`/`cmx`) one rule is
//! emitted, wired so that the executor's parallel scheduling stays sound:
//! when a module has no explicit interface, the bytecode rule is the sole
//! producer of the `cmi` and the native rule is fed a false
//! `-intf-suffix` so the compiler prefers reading the existing file over
//! re-creating it.

use std::collections::BTreeMap;

use crate::core::build::{Arg, Build, RunBuilder};
use crate::core::compiler::{CmKind, Config, Context, Mode};
use crate::core::interning::InternedString;
use crate::core::libdb::ResolvedLib;
use crate::core::modules::{MlKind, Module};
use crate::core::ordered_set_lang::OrderedSetLang;
use crate::core::paths::Path;
use crate::core::vfile::{DepMap, Vspec};

use super::archive::lib_cm_all_path;

/// The dynamic input of a compile rule: evaluated flags and the library
/// closure.
pub type CompileInput = (Vec<String>, Vec<ResolvedLib>);

/// Mode-specific flag sets of a stanza, evaluated once and shared by all
/// of its module rules.
#[derive(Clone)]
pub struct StanzaFlags {
    pub byte: Build<(), Vec<String>>,
    pub native: Build<(), Vec<String>>,
}

pub fn stanza_flags(
    dir: &Path,
    config: &Config,
    flags: &OrderedSetLang,
    ocamlc_flags: &OrderedSetLang,
    ocamlopt_flags: &OrderedSetLang,
) -> StanzaFlags {
    let common = flags.eval(dir, config.default_flags.clone());
    let byte = common
        .clone()
        .fanout(ocamlc_flags.eval(dir, config.default_ocamlc_flags.clone()))
        .map(|(mut a, b)| {
            a.extend(b);
            a
        });
    let native = common
        .fanout(ocamlopt_flags.eval(dir, config.default_ocamlopt_flags.clone()))
        .map(|(mut a, b)| {
            a.extend(b);
            a
        });
    StanzaFlags { byte, native }
}

pub fn cm_file(dir: &Path, obj_name: &str, kind: CmKind) -> Path {
    dir.append(&format!("{}.{}", obj_name, kind.ext()))
}

fn impl_extension(file: &str) -> String {
    match file.rfind('.') {
        Some(i) => file[i..].to_string(),
        None => String::new(),
    }
}

/// Emits the compile rules of one module for every configured artifact
/// kind.
#[allow(clippy::too_many_arguments)]
pub fn build_module_rules(
    ctx: &mut Context,
    dir: &Path,
    module: &Module,
    obj_names: &BTreeMap<InternedString, String>,
    dep_specs: &BTreeMap<MlKind, Vspec<DepMap>>,
    requires: &Build<(), Vec<ResolvedLib>>,
    flags: &StanzaFlags,
    alias_module: Option<InternedString>,
    modes: &std::collections::BTreeSet<Mode>,
) {
    let is_alias = alias_module == Some(module.name);
    // Which rule owns the cmi: the interface rule when an interface
    // exists, else the bytecode rule; the native rule steps in when the
    // bytecode side cannot run at all.
    let cmi_via_byte = if module.has_intf() {
        ctx.config.ocamlc.is_some()
    } else {
        ctx.config.ocamlc.is_some() && modes.contains(&Mode::Byte)
    };
    for kind in CmKind::all() {
        if !modes.contains(&kind.mode()) && kind != CmKind::Cmi {
            continue;
        }
        let compiler = match kind {
            CmKind::Cmi | CmKind::Cmo => ctx.config.ocamlc.clone(),
            CmKind::Cmx => ctx.config.ocamlopt.clone(),
        };
        let Some(compiler) = compiler.map(Path::absolute) else {
            continue;
        };
        if kind == CmKind::Cmi && !module.has_intf() {
            // The bytecode rule is nominated as the sole cmi producer.
            continue;
        }

        let dst = cm_file(dir, &module.obj_name, kind);
        let src_name = match kind {
            CmKind::Cmi => module.intf_file.clone().unwrap(),
            CmKind::Cmo | CmKind::Cmx => module.impl_file.clone(),
        };
        let src = dir.append(&src_name);
        let cmi = cm_file(dir, &module.obj_name, CmKind::Cmi);

        let mut static_deps = Vec::new();
        let mut extra_targets = Vec::new();
        let mut tail_args: Vec<Arg> = Vec::new();
        match kind {
            CmKind::Cmi => {
                extra_targets.push(dir.append(&format!("{}.cmti", module.obj_name)));
            }
            CmKind::Cmo => {
                if module.has_intf() {
                    static_deps.push(cmi);
                } else {
                    extra_targets.push(cmi);
                }
                extra_targets.push(dir.append(&format!("{}.cmt", module.obj_name)));
            }
            CmKind::Cmx => {
                if cmi_via_byte {
                    static_deps.push(cmi);
                    if !module.has_intf() {
                        // The bytecode rule owns the cmi; a false suffix
                        // makes the native compiler read it instead of
                        // racing to re-create it.
                        tail_args.push(Arg::a("-intf-suffix"));
                        tail_args.push(Arg::a(impl_extension(&module.impl_file)));
                    }
                } else {
                    extra_targets.push(cmi);
                }
                extra_targets
                    .push(dir.append(&format!("{}{}", module.obj_name, ctx.config.ext_obj)));
            }
        }

        let mode_flags = match kind.mode() {
            Mode::Byte => flags.byte.clone(),
            Mode::Native => flags.native.clone(),
        };
        let mut build = mode_flags.fanout(requires.clone());

        // Cross-library ordering goes through all-cm sentinels rather
        // than per-file enumeration.
        let sentinel_kinds: Vec<CmKind> = match kind {
            CmKind::Cmx => vec![CmKind::Cmi, CmKind::Cmx],
            _ => vec![CmKind::Cmi],
        };
        build = build.then(Build::dyn_paths(Build::arr(
            move |(_, libs): CompileInput| {
                libs.iter()
                    .filter_map(|l| match l {
                        ResolvedLib::Internal { dir, spec } => Some(
                            sentinel_kinds
                                .iter()
                                .map(|&k| lib_cm_all_path(dir, spec.name, k))
                                .collect::<Vec<_>>(),
                        ),
                        ResolvedLib::External(_) => None,
                    })
                    .flatten()
                    .collect()
            },
        )));

        if !is_alias {
            let dep_kind = match kind {
                CmKind::Cmi => MlKind::Intf,
                CmKind::Cmo | CmKind::Cmx => MlKind::Impl,
            };
            let spec = &dep_specs[&dep_kind];
            let name = module.name;
            let obj_names = obj_names.clone();
            let artifact_dir = dir.clone();
            let dep_paths = Build::vpath(spec).map(move |map: DepMap| {
                let mut paths = Vec::new();
                for dep in map.get(&name).map(|v| v.as_slice()).unwrap_or(&[]) {
                    let Some(obj) = obj_names.get(dep) else { continue };
                    paths.push(cm_file(&artifact_dir, obj, CmKind::Cmi));
                    if kind == CmKind::Cmx {
                        paths.push(cm_file(&artifact_dir, obj, CmKind::Cmx));
                    }
                }
                paths
            });
            build = build.then(Build::dyn_paths(dep_paths));
        }

        build = build.then(Build::paths(static_deps));

        let include_dir = dir.clone();
        let mut run = RunBuilder::new(dir, &compiler)
            .arg(Arg::a("-c"))
            .arg(Arg::dyn_of(|(flags, _): &CompileInput| flags.clone()));
        if matches!(kind, CmKind::Cmi | CmKind::Cmo) {
            run = run.arg(Arg::a("-bin-annot"));
        }
        if is_alias {
            run = run.args(vec![Arg::a("-w"), Arg::a("-49")]);
        }
        if let Some(alias) = alias_module {
            if !is_alias {
                run = run.args(vec![Arg::a("-open"), Arg::a(alias.as_str())]);
            }
            run = run.arg(Arg::a("-no-alias-deps"));
        }
        run = run
            .args(vec![Arg::a("-I"), Arg::a(".")])
            .arg(Arg::dyn_of(move |(_, libs): &CompileInput| {
                libs.iter()
                    .flat_map(|l| {
                        vec!["-I".to_string(), l.include_dir().reach(&include_dir)]
                    })
                    .collect()
            }))
            .args(tail_args)
            .args(vec![Arg::a("-o"), Arg::Target(dst)]);
        // The compiler infers the kind from the extension; force it for
        // generated files (e.g. the alias module's .ml-gen).
        let ml_kind = match kind {
            CmKind::Cmi => MlKind::Intf,
            CmKind::Cmo | CmKind::Cmx => MlKind::Impl,
        };
        if !src_name.ends_with(&format!(".{}", ml_kind.ext())) {
            run = run.arg(Arg::a(ml_kind.force_flag()));
        }
        run = run.arg(Arg::Dep(src)).extra_targets(extra_targets);

        ctx.add_rule(build.then(run.into_build()));
    }
}
