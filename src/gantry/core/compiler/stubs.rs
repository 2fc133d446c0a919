//! C and C++ stub compilation and packaging.
//!
//! The bytecode compiler doubles as the C driver (flags reach the real
//! compiler through `-ccopt`); C++ sources go straight to the detected
//! C++ compiler. The stub archiver produces the static archive and the
//! dynamic library in one rule, so the executor never races two writers
//! over them.

use std::sync::Arc;

use crate::core::build::{Arg, Build, RunBuilder};
use crate::core::compiler::Context;
use crate::core::libdb::ResolvedLib;
use crate::core::paths::Path;
use crate::core::stanza::LibSpec;

type StubInput = (Vec<String>, Vec<ResolvedLib>);

fn obj_path(ctx: &Context, dir: &Path, name: &str) -> Path {
    dir.append(&format!("{}{}", name, ctx.config.ext_obj))
}

/// Header files contributed by the closure: the installable headers of
/// internal dependencies.
fn closure_headers(libs: &[ResolvedLib]) -> Vec<Path> {
    libs.iter()
        .filter_map(|l| match l {
            ResolvedLib::Internal { dir, spec } => Some(
                spec.install_c_headers
                    .iter()
                    .map(|h| dir.append(&format!("{}.h", h)))
                    .collect::<Vec<_>>(),
            ),
            ResolvedLib::External(_) => None,
        })
        .flatten()
        .collect()
}

pub fn setup_stub_rules(
    ctx: &mut Context,
    dir: &Path,
    lib: &Arc<LibSpec>,
    requires: &Build<(), Vec<ResolvedLib>>,
) {
    let header_glob = glob::Pattern::new("*.h").unwrap();

    for name in &lib.c_names {
        let Some(ocamlc) = ctx.config.ocamlc.clone() else { continue };
        let src = dir.append(&format!("{}.c", name));
        let obj = obj_path(ctx, dir, name);
        let (_, cc_flags) = ctx.config.cc();
        let input = lib
            .c_flags
            .eval(dir, cc_flags)
            .fanout(requires.clone());
        let build = input
            .then(Build::paths_glob(dir, header_glob.clone()))
            .then(Build::dyn_paths(Build::arr(|(_, libs): StubInput| {
                closure_headers(&libs)
            })));
        let include_dir = dir.clone();
        let run = RunBuilder::new(dir, &Path::absolute(ocamlc))
            .arg(Arg::dyn_of(move |(flags, libs): &StubInput| {
                let mut args: Vec<String> = flags
                    .iter()
                    .flat_map(|f| ["-ccopt".to_string(), f.clone()])
                    .collect();
                for lib in libs {
                    args.push("-ccopt".to_string());
                    args.push(format!("-I{}", lib.include_dir().reach(&include_dir)));
                }
                args
            }))
            .arg(Arg::a("-c"))
            .arg(Arg::Dep(src))
            .target(&obj)
            .into_build();
        ctx.add_rule(build.then(run));
    }

    for name in &lib.cxx_names {
        let src = dir.append(&format!("{}.cpp", name));
        let obj = obj_path(ctx, dir, name);
        let (cxx, cxx_base_flags) = ctx.config.cxx();
        let input = lib
            .cxx_flags
            .eval(dir, cxx_base_flags)
            .fanout(requires.clone());
        let build = input
            .then(Build::paths_glob(dir, header_glob.clone()))
            .then(Build::dyn_paths(Build::arr(|(_, libs): StubInput| {
                closure_headers(&libs)
            })));
        let include_dir = dir.clone();
        let stdlib = ctx.config.stdlib_dir.clone();
        let run = RunBuilder::new(dir, &Path::absolute(cxx))
            .arg(Arg::dyn_of(move |(flags, libs): &StubInput| {
                let mut args = flags.clone();
                args.push(format!("-I{}", stdlib.display()));
                for lib in libs {
                    args.push(format!("-I{}", lib.include_dir().reach(&include_dir)));
                }
                args
            }))
            .args(vec![Arg::a("-c"), Arg::Dep(src)])
            .args(vec![Arg::a("-o"), Arg::Target(obj)])
            .into_build();
        ctx.add_rule(build.then(run));
    }

    // A stanza supplying a prebuilt archive is on its own for packaging.
    if lib.self_build_stubs_archive.is_none() && lib.has_stubs() {
        let objs: Vec<Path> = lib
            .c_names
            .iter()
            .chain(lib.cxx_names.iter())
            .map(|n| obj_path(ctx, dir, n))
            .collect();
        let static_archive =
            dir.append(&format!("lib{}{}", lib.stubs_name(), ctx.config.ext_lib));
        let dynamic_lib =
            dir.append(&format!("dll{}{}", lib.stubs_name(), ctx.config.ext_dll));
        let run = RunBuilder::new(dir, &Path::absolute(ctx.config.ocamlmklib.clone()))
            .args(vec![Arg::a("-o"), Arg::a(lib.stubs_name())])
            .arg(Arg::Deps(objs))
            .extra_targets(vec![static_archive, dynamic_lib])
            .into_build::<()>();
        ctx.add_rule(run);
    }
}
