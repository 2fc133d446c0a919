//! Variable expansion for user actions.
//!
//! Variables appear as `${NAME}` or `$(NAME)`. Artifact references
//! (`bin:name`, `findlib:pkg:file`) resolve through the named-artifact
//! map and contribute prerequisite dependencies, which the caller stages
//! onto the rule before the substituted action runs.

use anyhow::bail;

use crate::core::compiler::Context;
use crate::core::interning::InternedString;
use crate::core::paths::Path;
use crate::core::stanza::DepConf;
use crate::util::errors::GantryResult;

pub struct Expander<'a> {
    pub ctx: &'a Context,
    pub dir: &'a Path,
    pub targets: Vec<Path>,
    pub deps: Vec<DepConf>,
}

/// One expansion pass over a string: the substituted text plus the
/// prerequisite paths its artifact references require.
#[derive(Debug)]
pub struct Expanded {
    pub text: String,
    pub extra_deps: Vec<Path>,
}

impl<'a> Expander<'a> {
    pub fn expand(&self, s: &str) -> GantryResult<Expanded> {
        let mut text = String::new();
        let mut extra_deps = Vec::new();
        let mut rest = s;
        while let Some(i) = rest.find('$') {
            text.push_str(&rest[..i]);
            let after = &rest[i + 1..];
            let close = match after.chars().next() {
                Some('{') => Some('}'),
                Some('(') => Some(')'),
                _ => None,
            };
            match close {
                Some(close) => {
                    let Some(j) = after[1..].find(close) else {
                        bail!("unterminated variable reference in {:?}", s);
                    };
                    let name = &after[1..1 + j];
                    text.push_str(&self.lookup(name, &mut extra_deps)?);
                    rest = &after[j + 2..];
                }
                None => {
                    text.push('$');
                    rest = after;
                }
            }
        }
        text.push_str(rest);
        Ok(Expanded { text, extra_deps })
    }

    fn lookup(&self, name: &str, extra_deps: &mut Vec<Path>) -> GantryResult<String> {
        let config = &self.ctx.config;
        match name {
            "@" => {
                return Ok(self
                    .targets
                    .iter()
                    .map(|t| t.reach(self.dir))
                    .collect::<Vec<_>>()
                    .join(" "))
            }
            "<" => {
                return match self.deps.first() {
                    Some(DepConf::File(f)) => Ok(self.dir.append(f).reach(self.dir)),
                    Some(DepConf::Glob(_)) | Some(DepConf::FilesRecursivelyIn(_)) => {
                        bail!(
                            "variable '<' refers to a glob or recursive dependency; \
                             only plain file dependencies can be referenced this way"
                        )
                    }
                    None => bail!("variable '<' used but the rule has no dependencies"),
                }
            }
            "^" => {
                return Ok(self
                    .deps
                    .iter()
                    .filter_map(|d| match d {
                        DepConf::File(f) => Some(self.dir.append(f).reach(self.dir)),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join(" "))
            }
            "ROOT" => return Ok(Path::Root.reach(self.dir)),
            _ => {}
        }
        if let Some(rest) = name.strip_prefix("bin:") {
            let artifact = InternedString::new(rest);
            let Some(path) = self.ctx.artifact(artifact) else {
                bail!("no artifact named {} is provided", rest);
            };
            extra_deps.push(path.clone());
            return Ok(path.reach(self.dir));
        }
        if let Some(rest) = name.strip_prefix("findlib:") {
            let Some((pkg, file)) = rest.split_once(':') else {
                bail!("findlib reference {:?} should be findlib:package:file", name);
            };
            let Some(pkg) = self.ctx.libdb.findlib().find(InternedString::new(pkg)) else {
                bail!("external package {} not found", pkg);
            };
            let path = pkg.dir.append(file);
            extra_deps.push(path.clone());
            return Ok(path.reach(self.dir));
        }
        let (cc, cc_flags) = config.cc();
        let value = match name {
            "CPP" => format!("{} {} -E", cc, cc_flags.join(" ")),
            "PA_CPP" => format!("{} {} -undef -traditional -x c -E", cc, cc_flags.join(" ")),
            "CC" => format!("{} {}", cc, cc_flags.join(" ")),
            "CXX" => {
                let (cxx, cxx_flags) = config.cxx();
                format!("{} {}", cxx, cxx_flags.join(" "))
            }
            "ocaml_bin" => config.ocaml_bin.display().to_string(),
            "OCAML" => config.ocaml.display().to_string(),
            "OCAMLC" => match &config.ocamlc {
                Some(p) => p.display().to_string(),
                None => "ocamlc".to_string(),
            },
            "OCAMLOPT" => match &config.ocamlopt {
                Some(p) => p.display().to_string(),
                None => "ocamlopt".to_string(),
            },
            "ocaml_version" => config.version.clone(),
            "ocaml_where" => config.stdlib_dir.display().to_string(),
            "ARCH_SIXTYFOUR" => config.arch_sixtyfour.to_string(),
            "PORTABLE_INT63" => config.portable_int63.to_string(),
            "MAKE" => "make".to_string(),
            "-verbose" => String::new(),
            _ => bail!("unknown variable {:?}", name),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compiler::Config;
    use crate::core::libdb::LibDb;
    use crate::core::package::Findlib;
    use std::sync::Arc;

    fn test_ctx() -> Context {
        let libdb = LibDb::new(Arc::new(Findlib::empty()), vec![]).unwrap();
        Context::new(Config::new("default"), libdb)
    }

    fn dir() -> Path {
        Path::build(InternedString::new("default"), "src")
    }

    #[test]
    fn targets_and_deps_expand_relative_to_the_rule_dir() {
        let ctx = test_ctx();
        let d = dir();
        let exp = Expander {
            ctx: &ctx,
            dir: &d,
            targets: vec![d.append("out.txt")],
            deps: vec![
                DepConf::File("in1.txt".to_string()),
                DepConf::File("in2.txt".to_string()),
            ],
        };
        assert_eq!(exp.expand("cat ${^} > ${@}").unwrap().text, "cat in1.txt in2.txt > out.txt");
        assert_eq!(exp.expand("$(<)").unwrap().text, "in1.txt");
    }

    #[test]
    fn first_dep_reference_rejects_globs() {
        let ctx = test_ctx();
        let d = dir();
        let exp = Expander {
            ctx: &ctx,
            dir: &d,
            targets: vec![],
            deps: vec![DepConf::Glob("*.txt".to_string())],
        };
        let err = exp.expand("${<}").unwrap_err();
        assert!(err.to_string().contains("glob"));
    }

    #[test]
    fn root_and_builtins_expand() {
        let ctx = test_ctx();
        let d = dir();
        let exp = Expander {
            ctx: &ctx,
            dir: &d,
            targets: vec![],
            deps: vec![],
        };
        assert_eq!(exp.expand("${ROOT}").unwrap().text, "../../..");
        assert_eq!(exp.expand("${MAKE}").unwrap().text, "make");
        assert_eq!(exp.expand("${-verbose}").unwrap().text, "");
        assert_eq!(exp.expand("${ocaml_version}").unwrap().text, "4.06.0");
        assert!(exp.expand("${nonsense}").is_err());
    }
}
