//! Install-manifest and package-metadata emission.
//!
//! Per package: installable files gathered from its libraries and
//! executables, explicit `Install` stanzas, auto-discovered documentation,
//! a synthesized findlib `META` and the opam file. The `.install`
//! manifest itself is written by a rule; in the default context it is
//! additionally copied back to the source tree.

use std::collections::BTreeMap;
use std::sync::Arc;

use itertools::Itertools;
use log::debug;

use crate::core::build::Build;
use crate::core::compiler::Context;
use crate::core::interning::InternedString;
use crate::core::libdb::LibLookup;
use crate::core::package::Findlib;
use crate::core::paths::Path;
use crate::core::stanza::{InstallSection, LibSpec, Stanza};
use crate::ops::gen_rules::DirStanzas;
use crate::util::errors::GantryResult;

/// An opam package of the tree, as discovered by external traversal.
#[derive(Clone, Debug)]
pub struct ProjectPackage {
    pub name: InternedString,
    /// Source-relative directory the package is rooted at.
    pub dir: String,
    pub version: Option<String>,
    /// The flat file set of that directory, for doc and opam discovery.
    pub files: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    src: Path,
    dst: Option<String>,
}

const DOC_FILES: &[&str] = &["README", "README.md", "README.org", "README.txt"];

fn is_doc_file(name: &str) -> bool {
    DOC_FILES.contains(&name) || name.starts_with("LICENSE")
}

pub fn gen_install_rules(
    ctx: &mut Context,
    packages: &[ProjectPackage],
    dirs: &[DirStanzas],
) -> GantryResult<()> {
    let installable = ctx.libdb.internal_libs_without_non_installable_optional_ones();
    for package in packages {
        let pkg_dir = ctx.config.build_path(&package.dir);
        let mut sections: BTreeMap<InstallSection, Vec<Entry>> = BTreeMap::new();
        let mut add = |section: InstallSection, entry: Entry| {
            sections.entry(section).or_default().push(entry)
        };

        let pkg_libs: Vec<(Path, Arc<LibSpec>)> = installable
            .iter()
            .filter(|(_, spec)| {
                spec.public_name.map_or(false, |public| {
                    Findlib::root_package_name(&public) == package.name.as_str()
                })
            })
            .cloned()
            .collect();

        for (_, spec) in &pkg_libs {
            for (section, path) in ctx.lib_install_files(spec.name) {
                add(*section, Entry { src: path.clone(), dst: None });
            }
        }

        if !pkg_libs.is_empty() {
            let meta = pkg_dir.append(&format!("META.{}", package.name));
            add(
                InstallSection::Lib,
                Entry {
                    src: meta.clone(),
                    dst: Some("META".to_string()),
                },
            );
        }

        for bin in ctx.bin_installs() {
            if bin.package == package.name {
                add(
                    InstallSection::Bin,
                    Entry {
                        src: bin.src.clone(),
                        dst: Some(bin.name.clone()),
                    },
                );
            }
        }

        for d in dirs {
            let dir = ctx.config.build_path(&d.dir);
            for s in &d.stanzas {
                if let Stanza::Install(install) = s {
                    if install.package == package.name {
                        for file in &install.files {
                            add(
                                install.section,
                                Entry {
                                    src: dir.append(&file.src),
                                    dst: file.dst.clone(),
                                },
                            );
                        }
                    }
                }
            }
        }

        for file in &package.files {
            if is_doc_file(file) {
                add(
                    InstallSection::Doc,
                    Entry {
                        src: Path::source(&package.dir).append(file),
                        dst: None,
                    },
                );
            }
        }

        let opam_file = format!("{}.opam", package.name);
        if package.files.iter().any(|f| f == &opam_file) {
            add(
                InstallSection::Lib,
                Entry {
                    src: Path::source(&package.dir).append(&opam_file),
                    dst: Some("opam".to_string()),
                },
            );
        }

        drop(add);

        if !pkg_libs.is_empty() {
            let meta = pkg_dir.append(&format!("META.{}", package.name));
            let contents = meta_contents(ctx, package, &pkg_libs);
            ctx.add_rule(Build::write_file(&meta, contents));
        }

        debug!(
            "package {}: {} install section(s)",
            package.name,
            sections.len()
        );
        let manifest = pkg_dir.append(&format!("{}.install", package.name));
        let contents = install_file_contents(&sections);
        ctx.add_rule(Build::write_file(&manifest, contents));
        if ctx.config.is_default() {
            let in_source = Path::source(&package.dir).append(&format!("{}.install", package.name));
            ctx.add_rule(Build::copy(&manifest, &in_source));
        }
    }
    Ok(())
}

fn install_file_contents(sections: &BTreeMap<InstallSection, Vec<Entry>>) -> String {
    let mut out = String::new();
    for (section, entries) in sections {
        let mut entries = entries.clone();
        entries.sort();
        entries.dedup();
        out.push_str(&format!("{}: [\n", section.keyword()));
        for entry in entries {
            match &entry.dst {
                Some(dst) => {
                    out.push_str(&format!("  \"{}\" {{\"{}\"}}\n", entry.src, dst))
                }
                None => out.push_str(&format!("  \"{}\"\n", entry.src)),
            }
        }
        out.push_str("]\n");
    }
    out
}

/// Synthesizes the findlib `META` for a package: the library whose public
/// name is the package itself provides the top-level fields, dotted
/// public names become sub-packages.
fn meta_contents(
    ctx: &Context,
    package: &ProjectPackage,
    libs: &[(Path, Arc<LibSpec>)],
) -> String {
    let mut out = String::new();
    if let Some(version) = &package.version {
        out.push_str(&format!("version = \"{}\"\n", version));
    }
    for (_, spec) in libs {
        let public = spec.public_name.expect("installable library has a public name");
        let sub = public
            .as_str()
            .strip_prefix(package.name.as_str())
            .and_then(|rest| rest.strip_prefix('.'));
        match sub {
            None => meta_lib_fields(ctx, spec, &mut out, ""),
            Some(sub) => {
                out.push_str(&format!("package \"{}\" (\n", sub));
                meta_lib_fields(ctx, spec, &mut out, "  ");
                out.push_str(")\n");
            }
        }
    }
    out
}

fn meta_lib_fields(ctx: &Context, spec: &LibSpec, out: &mut String, indent: &str) {
    if let Some(synopsis) = &spec.synopsis {
        out.push_str(&format!("{}description = \"{}\"\n", indent, synopsis));
    }
    let requires = spec
        .libraries
        .iter()
        .filter_map(|d| match d {
            crate::core::stanza::LibDep::Direct(name) => Some(best_name_of(ctx, *name)),
            crate::core::stanza::LibDep::Select { .. } => None,
        })
        .join(" ");
    out.push_str(&format!("{}requires = \"{}\"\n", indent, requires));
    out.push_str(&format!("{}archive(byte) = \"{}.cma\"\n", indent, spec.name));
    out.push_str(&format!(
        "{}archive(native) = \"{}.cmxa\"\n",
        indent, spec.name
    ));
    out.push_str(&format!("{}plugin(byte) = \"{}.cma\"\n", indent, spec.name));
    out.push_str(&format!(
        "{}plugin(native) = \"{}.cmxs\"\n",
        indent, spec.name
    ));
    if spec.optional {
        out.push_str(&format!("{}exists_if = \"{}.cma\"\n", indent, spec.name));
    }
}

fn best_name_of(ctx: &Context, name: InternedString) -> String {
    match ctx.libdb.find(name) {
        LibLookup::Internal(_, spec) => spec.best_name().to_string(),
        _ => name.to_string(),
    }
}
