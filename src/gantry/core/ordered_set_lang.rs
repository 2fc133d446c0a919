//! The ordered set language: a small expression language over string
//! lists with a standard-value placeholder, union and difference, used by
//! the `flags`, `modules` and related stanza fields.
//!
//! Expressions referencing external files are lifted into the build graph
//! so the file becomes a dependency of every rule using the evaluated set.

use anyhow::bail;

use crate::core::build::Build;
use crate::core::paths::Path;
use crate::util::errors::GantryResult;

#[derive(Clone, Debug)]
pub enum OrderedSetLang {
    /// The caller-supplied baseline.
    Standard,
    Atoms(Vec<String>),
    Union(Vec<OrderedSetLang>),
    /// Elements of the left set not present in the right one, in left
    /// order.
    Diff(Box<OrderedSetLang>, Box<OrderedSetLang>),
    /// Whitespace-separated elements read from a file in the stanza's
    /// directory.
    FromFile(String),
}

impl Default for OrderedSetLang {
    fn default() -> OrderedSetLang {
        OrderedSetLang::Standard
    }
}

impl OrderedSetLang {
    pub fn atoms<S: Into<String>, I: IntoIterator<Item = S>>(items: I) -> OrderedSetLang {
        OrderedSetLang::Atoms(items.into_iter().map(|s| s.into()).collect())
    }

    /// Evaluation for fields that must be known during rule generation
    /// (e.g. `modules`); file references are rejected.
    pub fn eval_static(&self, standard: &[String]) -> GantryResult<Vec<String>> {
        match self {
            OrderedSetLang::Standard => Ok(standard.to_vec()),
            OrderedSetLang::Atoms(atoms) => Ok(atoms.clone()),
            OrderedSetLang::Union(items) => {
                let mut out = Vec::new();
                for item in items {
                    out.extend(item.eval_static(standard)?);
                }
                Ok(out)
            }
            OrderedSetLang::Diff(a, b) => {
                let a = a.eval_static(standard)?;
                let b = b.eval_static(standard)?;
                Ok(diff(a, &b))
            }
            OrderedSetLang::FromFile(name) => {
                bail!(":include {} is not allowed in this field", name)
            }
        }
    }

    /// Evaluation lifted into the build graph: file references become
    /// dependencies of the consuming rule.
    pub fn eval(&self, dir: &Path, standard: Vec<String>) -> Build<(), Vec<String>> {
        match self {
            OrderedSetLang::Standard => Build::pure(standard),
            OrderedSetLang::Atoms(atoms) => Build::pure(atoms.clone()),
            OrderedSetLang::Union(items) => {
                let mut acc: Build<(), Vec<String>> = Build::pure(Vec::new());
                for item in items {
                    acc = acc
                        .fanout(item.eval(dir, standard.clone()))
                        .map(|(mut a, b)| {
                            a.extend(b);
                            a
                        });
                }
                acc
            }
            OrderedSetLang::Diff(a, b) => a
                .eval(dir, standard.clone())
                .fanout(b.eval(dir, standard))
                .map(|(a, b)| diff(a, &b)),
            OrderedSetLang::FromFile(name) => {
                let file = dir.append(name);
                Build::contents(&file)
                    .map(|text: String| text.split_whitespace().map(|w| w.to_string()).collect())
            }
        }
    }
}

fn diff(a: Vec<String>, b: &[String]) -> Vec<String> {
    a.into_iter().filter(|x| !b.contains(x)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::build::{Action, Build as B, Rule};
    use crate::core::interning::InternedString;
    use std::collections::BTreeMap;

    fn std_flags() -> Vec<String> {
        vec!["-g".to_string(), "-w".to_string(), "+a".to_string()]
    }

    #[test]
    fn standard_is_the_baseline() {
        let set = OrderedSetLang::Standard;
        assert_eq!(set.eval_static(&std_flags()).unwrap(), std_flags());
    }

    #[test]
    fn union_and_diff_preserve_order() {
        let set = OrderedSetLang::Union(vec![
            OrderedSetLang::Diff(
                Box::new(OrderedSetLang::Standard),
                Box::new(OrderedSetLang::atoms(["-g"])),
            ),
            OrderedSetLang::atoms(["-bin-annot"]),
        ]);
        assert_eq!(
            set.eval_static(&std_flags()).unwrap(),
            vec!["-w", "+a", "-bin-annot"]
        );
    }

    #[test]
    fn from_file_is_rejected_statically_but_lifts_into_the_graph() {
        let set = OrderedSetLang::Union(vec![
            OrderedSetLang::Standard,
            OrderedSetLang::FromFile("extra-flags".to_string()),
        ]);
        assert!(set.eval_static(&[]).is_err());

        let dir = Path::build(InternedString::new("default"), "src");
        let build = set
            .eval(&dir, vec!["-g".to_string()])
            .map(|flags| Action::Bash(flags.join(" ")));
        let rule = Rule::new(B::pure(()).then(build));
        assert!(rule.inputs.contains(&dir.append("extra-flags")));
        let mut files = BTreeMap::new();
        files.insert(dir.append("extra-flags"), "-O3 -unboxed".to_string());
        let realized = rule.realize(&files).unwrap();
        assert_eq!(realized.action, Action::Bash("-g -O3 -unboxed".to_string()));
    }
}
