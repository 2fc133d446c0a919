//! The top-level orchestrator: walks per-directory stanza sets and
//! dispatches to the rule emitters.

use std::sync::Arc;

use anyhow::anyhow;
use log::info;

use crate::core::build::{Action, Arg, Build, LibDepKind, RunBuilder};
use crate::core::compiler::archive::setup_lib_archives;
use crate::core::compiler::executable::{exe_path, setup_exe_rules};
use crate::core::compiler::module_rules::{build_module_rules, cm_file, stanza_flags};
use crate::core::compiler::stubs::setup_stub_rules;
use crate::core::compiler::{BinInstall, CmKind, Config, Context, Mode};
use crate::core::depscan;
use crate::core::interning::InternedString;
use crate::core::libdb::{
    dedup_libs, requires_path, runtime_deps_path, LibDb, LibLookup, ResolvedLib,
};
use crate::core::modules::{
    guess_modules, module_name_of_stem, parse_modules, Module, ModuleMap,
};
use crate::core::package::Findlib;
use crate::core::paths::Path;
use crate::core::preprocess::pp_modules;
use crate::core::stanza::{
    DepConf, Executables, InstallSection, LibDep, LibSpec, Ocamllex, Ocamlyacc, Stanza,
    UserAction, UserRule,
};
use crate::core::vfile::Vspec;
use crate::ops::expand::{Expanded, Expander};
use crate::util::errors::{internal, GantryResult};

/// One directory's build description: its flat file set and its typed
/// stanzas, both supplied by external collaborators.
#[derive(Clone)]
pub struct DirStanzas {
    /// Source-relative directory path.
    pub dir: String,
    pub files: Vec<String>,
    pub stanzas: Vec<Stanza>,
}

/// Generates the whole rule graph for one build context.
pub fn gen_rules(
    config: Config,
    findlib: Arc<Findlib>,
    dirs: &[DirStanzas],
) -> GantryResult<Context> {
    let mut libs = Vec::new();
    for d in dirs {
        let ctx_dir = Path::build(config.name, d.dir.as_str());
        for s in &d.stanzas {
            if let Stanza::Library(lib) = s {
                libs.push((ctx_dir.clone(), lib.clone()));
            }
        }
    }
    let libdb = LibDb::new(findlib, libs)?;
    let mut ctx = Context::new(config, libdb);

    for d in dirs {
        let dir = ctx.config.build_path(&d.dir);
        for s in &d.stanzas {
            match s {
                Stanza::Provides(p) => ctx.register_artifact(p.name, dir.append(&p.file)),
                Stanza::Executables(e) => {
                    let mode = if ctx.config.ocamlopt.is_some() {
                        Mode::Native
                    } else {
                        Mode::Byte
                    };
                    for name in &e.names {
                        ctx.register_artifact(
                            InternedString::new(name),
                            exe_path(&dir, name, mode),
                        );
                    }
                }
                _ => {}
            }
        }
    }

    for d in dirs {
        gen_dir(&mut ctx, d)?;
    }
    info!("generated {} rules", ctx.rules().len());
    Ok(ctx)
}

fn gen_dir(ctx: &mut Context, d: &DirStanzas) -> GantryResult<()> {
    let src_dir = Path::source(d.dir.as_str());
    let dir = ctx.config.build_path(&d.dir);

    // Generated files participate in module discovery alongside sources.
    let mut files = d.files.clone();
    for s in &d.stanzas {
        match s {
            Stanza::Library(lib) => {
                for sel in ctx.libdb.resolve_selects(&lib.libraries) {
                    files.push(sel.dst_file);
                }
            }
            Stanza::Executables(e) => {
                for sel in ctx.libdb.resolve_selects(&e.libraries) {
                    files.push(sel.dst_file);
                }
            }
            Stanza::Ocamllex(l) => files.extend(l.names.iter().map(|n| format!("{}.ml", n))),
            Stanza::Ocamlyacc(y) => {
                for n in &y.names {
                    files.push(format!("{}.ml", n));
                    files.push(format!("{}.mli", n));
                }
            }
            Stanza::Rule(r) => files.extend(r.targets.iter().cloned()),
            _ => {}
        }
    }
    let discovered = guess_modules(&src_dir, &files)?;

    for s in &d.stanzas {
        match s {
            Stanza::Library(lib) => gen_library(ctx, &dir, &discovered, lib)?,
            Stanza::Executables(e) => gen_executables(ctx, &dir, &discovered, e)?,
            Stanza::Rule(r) => gen_user_rule(ctx, &dir, r)?,
            Stanza::Ocamllex(l) => gen_ocamllex(ctx, &dir, l),
            Stanza::Ocamlyacc(y) => gen_ocamlyacc(ctx, &dir, y),
            Stanza::Install(_) | Stanza::Provides(_) | Stanza::Other => {}
        }
    }
    Ok(())
}

fn stem_of(file: &str) -> &str {
    match file.rfind('.') {
        Some(i) => &file[..i],
        None => file,
    }
}

fn direct_names(deps: &[LibDep]) -> Vec<InternedString> {
    deps.iter()
        .filter_map(|d| match d {
            LibDep::Direct(name) => Some(*name),
            LibDep::Select { .. } => None,
        })
        .collect()
}

fn best_names(libs: &[ResolvedLib]) -> Vec<InternedString> {
    libs.iter().map(|l| l.best_name()).collect()
}

/// The dependency closure a stanza's rules link against: its `libraries`
/// plus the runtime closure of every preprocessor plugin it uses.
fn requires_build(
    ctx: &Context,
    dir: &Path,
    libraries: &[LibDep],
    pps: &[InternedString],
) -> Build<(), Vec<ResolvedLib>> {
    let base = ctx.libdb.closure(dir, libraries);
    if pps.is_empty() {
        return base;
    }
    let pps_deps: Vec<LibDep> = pps.iter().map(|&p| LibDep::Direct(p)).collect();
    base.fanout(ctx.libdb.closed_ppx_runtime_deps_of(dir, &pps_deps))
        .map(|(mut a, b)| {
            a.extend(b);
            dedup_libs(a)
        })
}

fn gen_library(
    ctx: &mut Context,
    dir: &Path,
    discovered: &ModuleMap,
    lib: &LibSpec,
) -> GantryResult<()> {
    let config = Arc::clone(&ctx.config);
    let spec = match ctx.libdb.find(lib.name) {
        LibLookup::Internal(_, spec) => spec,
        _ => return Err(internal(format!("library {} not registered", lib.name))),
    };

    for sel in ctx.libdb.resolve_selects(&lib.libraries) {
        ctx.add_rule(Build::copy(
            &dir.append(&sel.src_file),
            &dir.append(&sel.dst_file),
        ));
    }

    let mut modules = parse_modules(dir, &lib.modules, discovered)?;
    let main_name = module_name_of_stem(&lib.name);
    let multi = modules.len() > 1;

    for (_, m) in modules.iter_mut() {
        m.obj_name = if lib.wrapped && multi && m.name != main_name {
            format!("{}__{}", lib.name, m.name)
        } else {
            stem_of(&m.impl_file).to_string()
        };
    }

    let alias = if lib.wrapped && multi {
        let (name, obj_name) = if modules.contains_key(&main_name) {
            (
                InternedString::new(&format!("{}__", main_name)),
                format!("{}__", lib.name),
            )
        } else {
            (main_name, lib.name.to_string())
        };
        Some(Module {
            name,
            impl_file: format!("{}.ml-gen", obj_name),
            intf_file: None,
            obj_name,
        })
    } else {
        None
    };

    if let Some(alias_mod) = &alias {
        let body: String = modules
            .values()
            .filter(|m| m.name != main_name)
            .map(|m| format!("module {} = {}__{}\n", m.name, main_name, m.name))
            .collect();
        ctx.add_rule(Build::write_file(&dir.append(&alias_mod.impl_file), body));
    }

    let extra_deps = depconf_build(dir, &lib.preprocessor_deps)?;
    let mut modules = pp_modules(ctx, dir, &modules, &lib.preprocess, &extra_deps, Some(lib.name));
    if let Some(alias_mod) = &alias {
        let mut with_alias = ModuleMap::new();
        with_alias.insert(alias_mod.name, alias_mod.clone());
        with_alias.extend(modules);
        modules = with_alias;
    }
    let obj_names: std::collections::BTreeMap<InternedString, String> = modules
        .values()
        .map(|m| (m.name, m.obj_name.clone()))
        .collect();

    let alias_name = alias.as_ref().map(|m| m.name);
    let (scan_builds, dep_specs) =
        depscan::rules(&config, dir, lib.name, &modules, alias_name);
    for b in scan_builds {
        ctx.add_rule(b);
    }

    let pps: Vec<InternedString> = lib.preprocess.all_pps().into_iter().collect();
    let mut requires = requires_build(ctx, dir, &lib.libraries, &pps);
    if let Some(&missing) = lib
        .virtual_deps
        .iter()
        .find(|&&v| matches!(ctx.libdb.find(v), LibLookup::NotFound))
    {
        requires = Build::fail(anyhow!("library {} not found", missing)).then(requires);
    }

    let dep_kind = if lib.optional {
        LibDepKind::Optional
    } else {
        LibDepKind::Required
    };
    let mut record_names = direct_names(&lib.libraries);
    record_names.extend(pps.iter().copied());
    let requires_spec = Vspec::names(requires_path(dir, lib.name));
    ctx.add_rule(
        requires
            .clone()
            .then(Build::record_lib_deps(dir, dep_kind, record_names))
            .map(|libs| best_names(&libs))
            .then(Build::store_vfile(&requires_spec)),
    );

    let runtime_spec = Vspec::names(runtime_deps_path(dir, lib.name));
    let runtime = ctx
        .libdb
        .closed_ppx_runtime_deps_of(dir, &lib.ppx_runtime_libraries)
        .map(|libs| best_names(&libs))
        .then(Build::store_vfile(&runtime_spec));
    ctx.add_rule(runtime);

    let flags = stanza_flags(
        dir,
        &config,
        &lib.flags,
        &lib.ocamlc_flags,
        &lib.ocamlopt_flags,
    );
    for module in modules.values() {
        build_module_rules(
            ctx,
            dir,
            module,
            &obj_names,
            &dep_specs,
            &requires,
            &flags,
            alias_name,
            &lib.modes,
        );
    }

    setup_stub_rules(ctx, dir, &spec, &requires);
    setup_lib_archives(ctx, dir, &spec, &modules, &obj_names, &dep_specs);

    let native = lib.modes.contains(&Mode::Native) && config.ocamlopt.is_some();
    let mut installs: Vec<(InstallSection, Path)> = Vec::new();
    for m in modules.values() {
        installs.push((InstallSection::Lib, cm_file(dir, &m.obj_name, CmKind::Cmi)));
        if native {
            installs.push((InstallSection::Lib, cm_file(dir, &m.obj_name, CmKind::Cmx)));
        }
    }
    if lib.modes.contains(&Mode::Byte) && config.ocamlc.is_some() {
        installs.push((InstallSection::Lib, dir.append(&format!("{}.cma", lib.name))));
    }
    if native {
        installs.push((InstallSection::Lib, dir.append(&format!("{}.cmxa", lib.name))));
        installs.push((
            InstallSection::Lib,
            dir.append(&format!("{}{}", lib.name, config.ext_lib)),
        ));
        installs.push((InstallSection::Lib, dir.append(&format!("{}.cmxs", lib.name))));
    }
    if lib.has_stubs() {
        installs.push((
            InstallSection::Lib,
            dir.append(&format!("lib{}{}", lib.stubs_name(), config.ext_lib)),
        ));
        installs.push((
            InstallSection::Stublibs,
            dir.append(&format!("dll{}{}", lib.stubs_name(), config.ext_dll)),
        ));
    }
    for h in &lib.install_c_headers {
        installs.push((InstallSection::Lib, dir.append(&format!("{}.h", h))));
    }
    for js in &lib.js_artifacts {
        installs.push((InstallSection::Lib, dir.append(js)));
    }
    ctx.record_lib_install(lib.name, installs);
    Ok(())
}

fn gen_executables(
    ctx: &mut Context,
    dir: &Path,
    discovered: &ModuleMap,
    exes: &Executables,
) -> GantryResult<()> {
    let config = Arc::clone(&ctx.config);
    for sel in ctx.libdb.resolve_selects(&exes.libraries) {
        ctx.add_rule(Build::copy(
            &dir.append(&sel.src_file),
            &dir.append(&sel.dst_file),
        ));
    }

    let mut modules = parse_modules(dir, &exes.modules, discovered)?;
    for (_, m) in modules.iter_mut() {
        m.obj_name = stem_of(&m.impl_file).to_string();
    }

    let extra_deps = depconf_build(dir, &exes.preprocessor_deps)?;
    let modules = pp_modules(ctx, dir, &modules, &exes.preprocess, &extra_deps, None);
    let obj_names: std::collections::BTreeMap<InternedString, String> = modules
        .values()
        .map(|m| (m.name, m.obj_name.clone()))
        .collect();

    let item = InternedString::new(&exes.names.join("-"));
    let (scan_builds, dep_specs) = depscan::rules(&config, dir, item, &modules, None);
    for b in scan_builds {
        ctx.add_rule(b);
    }

    let pps: Vec<InternedString> = exes.preprocess.all_pps().into_iter().collect();
    let requires = requires_build(ctx, dir, &exes.libraries, &pps);
    let mut record_names = direct_names(&exes.libraries);
    record_names.extend(pps.iter().copied());
    let requires_linked = requires
        .clone()
        .then(Build::record_lib_deps(dir, LibDepKind::Required, record_names));

    let flags = stanza_flags(
        dir,
        &config,
        &exes.flags,
        &exes.ocamlc_flags,
        &exes.ocamlopt_flags,
    );
    for module in modules.values() {
        build_module_rules(
            ctx,
            dir,
            module,
            &obj_names,
            &dep_specs,
            &requires,
            &flags,
            None,
            &exes.modes,
        );
    }
    setup_exe_rules(
        ctx,
        dir,
        &exes.names,
        &modules,
        &obj_names,
        &dep_specs,
        &requires_linked,
        &exes.link_flags,
        &exes.modes,
    )?;

    if let Some(package) = exes.package {
        let mode = if exes.modes.contains(&Mode::Native) && config.ocamlopt.is_some() {
            Mode::Native
        } else {
            Mode::Byte
        };
        for (name, public) in exes.names.iter().zip(exes.public_names.iter()) {
            if let Some(public) = public {
                ctx.record_bin_install(BinInstall {
                    package,
                    src: exe_path(dir, name, mode),
                    name: public.clone(),
                });
            }
        }
    }
    Ok(())
}

fn gen_ocamllex(ctx: &mut Context, dir: &Path, stanza: &Ocamllex) {
    let config = Arc::clone(&ctx.config);
    for name in &stanza.names {
        let mll = dir.append(&format!("{}.mll", name));
        let tmp = dir.append(&format!("{}.tmp.ml", name));
        let ml = dir.append(&format!("{}.ml", name));
        ctx.add_rule(
            RunBuilder::new(dir, &Path::absolute(config.ocamllex.clone()))
                .args(vec![
                    Arg::a("-q"),
                    Arg::a("-o"),
                    Arg::Target(tmp.clone()),
                    Arg::Dep(mll),
                ])
                .into_build(),
        );
        let tmp_for_cleanup = tmp.clone();
        ctx.add_rule(
            Build::copy_and_add_line_directive(&tmp, &ml).map(move |a| {
                Action::Progn(vec![a, Action::Remove(tmp_for_cleanup.clone())])
            }),
        );
    }
}

fn gen_ocamlyacc(ctx: &mut Context, dir: &Path, stanza: &Ocamlyacc) {
    let config = Arc::clone(&ctx.config);
    for name in &stanza.names {
        let mly = dir.append(&format!("{}.mly", name));
        let tmp_base = format!("{}.tmp", name);
        let tmp_ml = dir.append(&format!("{}.ml", tmp_base));
        let tmp_mli = dir.append(&format!("{}.mli", tmp_base));
        ctx.add_rule(
            RunBuilder::new(dir, &Path::absolute(config.ocamlyacc.clone()))
                .args(vec![Arg::a("-b"), Arg::a(tmp_base.clone()), Arg::Dep(mly)])
                .target(&tmp_ml)
                .target(&tmp_mli)
                .into_build(),
        );
        for (tmp, out) in [
            (tmp_ml, dir.append(&format!("{}.ml", name))),
            (tmp_mli, dir.append(&format!("{}.mli", name))),
        ] {
            let tmp_for_cleanup = tmp.clone();
            ctx.add_rule(
                Build::copy_and_add_line_directive(&tmp, &out).map(move |a| {
                    Action::Progn(vec![a, Action::Remove(tmp_for_cleanup.clone())])
                }),
            );
        }
    }
}

fn gen_user_rule(ctx: &mut Context, dir: &Path, rule: &UserRule) -> GantryResult<()> {
    let targets: Vec<Path> = rule.targets.iter().map(|t| dir.append(t)).collect();
    let deps_build = depconf_build(dir, &rule.deps)?;
    let expander = Expander {
        ctx,
        dir,
        targets: targets.clone(),
        deps: rule.deps.clone(),
    };
    let build = match &rule.action {
        UserAction::Bash(cmd) => {
            let Expanded { text, extra_deps } = expander.expand(cmd)?;
            deps_build
                .then(Build::paths(extra_deps))
                .then(Build::bash(dir, text, targets))
        }
        UserAction::Run { prog, args } => {
            let mut extra_deps = Vec::new();
            let prog = expander.expand(prog)?;
            extra_deps.extend(prog.extra_deps);
            let mut rendered = Vec::new();
            for arg in args {
                let e = expander.expand(arg)?;
                extra_deps.extend(e.extra_deps);
                rendered.push(e.text);
            }
            let action = Action::Chdir(
                dir.clone(),
                Box::new(Action::Run {
                    prog: prog.text,
                    args: rendered,
                }),
            );
            deps_build
                .then(Build::paths(extra_deps))
                .then(Build::action(action, targets))
        }
    };
    ctx.add_rule(build);
    Ok(())
}

fn depconf_build(dir: &Path, deps: &[DepConf]) -> GantryResult<Build<(), ()>> {
    let mut build: Build<(), ()> = Build::pure(());
    for dep in deps {
        build = match dep {
            DepConf::File(f) => build.then(Build::path(&dir.append(f))),
            DepConf::Glob(g) => {
                let pattern = glob::Pattern::new(g)
                    .map_err(|e| anyhow!("invalid glob {:?}: {}", g, e))?;
                build.then(Build::paths_glob(dir, pattern))
            }
            DepConf::FilesRecursivelyIn(sub) => {
                build.then(Build::files_recursively_in(&dir.append(sub)))
            }
        };
    }
    Ok(build)
}
