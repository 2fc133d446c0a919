//! Editor-integration (`.merlin`) emission, default build context only.

use std::borrow::Cow;
use std::collections::BTreeSet;

use crate::core::build::Build;
use crate::core::compiler::Context;
use crate::core::interning::InternedString;
use crate::core::libdb::LibLookup;
use crate::core::paths::Path;
use crate::core::preprocess::pp_key;
use crate::core::stanza::{LibDep, Stanza};
use crate::ops::gen_rules::DirStanzas;
use crate::util::errors::GantryResult;

pub fn gen_merlin_rules(ctx: &mut Context, dirs: &[DirStanzas]) -> GantryResult<()> {
    if !ctx.config.is_default() {
        return Ok(());
    }
    for d in dirs {
        let mut lib_deps: Vec<LibDep> = Vec::new();
        let mut pps: BTreeSet<InternedString> = BTreeSet::new();
        let mut opens: BTreeSet<InternedString> = BTreeSet::new();
        let mut relevant = false;
        for s in &d.stanzas {
            match s {
                Stanza::Library(lib) => {
                    relevant = true;
                    lib_deps.extend(lib.libraries.iter().cloned());
                    pps.extend(lib.preprocess.all_pps());
                    if lib.wrapped {
                        opens.insert(InternedString::new(&capitalize(&lib.name)));
                    }
                }
                Stanza::Executables(exes) => {
                    relevant = true;
                    lib_deps.extend(exes.libraries.iter().cloned());
                    pps.extend(exes.preprocess.all_pps());
                }
                _ => {}
            }
        }
        if !relevant {
            continue;
        }

        let src_dir = Path::source(d.dir.as_str());
        let build_dir = ctx.config.build_path(&d.dir);
        let mut lines: Vec<String> = vec!["S .".to_string()];
        let mut b_dirs: BTreeSet<String> = BTreeSet::new();
        b_dirs.insert(build_dir.reach(&src_dir));
        let mut packages: BTreeSet<InternedString> = BTreeSet::new();
        for dep in &lib_deps {
            let LibDep::Direct(name) = dep else { continue };
            match ctx.libdb.find(*name) {
                LibLookup::Internal(dep_dir, _) => {
                    if let Some((_, sub)) = dep_dir.extract_build_context() {
                        lines.push(format!("S {}", Path::source(sub).reach(&src_dir)));
                    }
                    b_dirs.insert(dep_dir.reach(&src_dir));
                }
                LibLookup::External(pkg) => {
                    packages.insert(pkg.name);
                }
                LibLookup::NotFound => {}
            }
        }
        lines.extend(b_dirs.into_iter().map(|b| format!("B {}", b)));
        lines.extend(packages.into_iter().map(|p| format!("PKG {}", p)));
        for open in opens {
            lines.push(format!("FLG -open {}", open));
        }
        if !pps.is_empty() {
            let exe = ctx
                .config
                .build_path(&format!(".ppx/{}", pp_key(&pps)))
                .append("ppx.exe");
            let cmd = format!("{} --as-ppx", exe.reach(&src_dir));
            lines.push(format!(
                "FLG -ppx {}",
                shell_escape::escape(Cow::Owned(cmd))
            ));
        }

        let merlin = build_dir.append(".merlin");
        let mut contents = lines.join("\n");
        contents.push('\n');
        ctx.add_rule(Build::write_file(&merlin, contents));
        ctx.add_rule(Build::copy(&merlin, &src_dir.append(".merlin")));
    }
    Ok(())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
