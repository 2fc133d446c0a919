//! Persisted typed values.
//!
//! Rules in one directory communicate with rules in another through small
//! files in the build tree (`*.requires.sexp`, `*.depends.*.sexp`, ...).
//! A [`Vspec`] pairs such a file with the codec for its payload; the
//! generator only ever references the spec, the executor invokes it.

use std::sync::Arc;

use anyhow::bail;
use indexmap::IndexMap;

use crate::core::interning::InternedString;
use crate::core::paths::Path;
use crate::util::errors::GantryResult;

pub trait Codec<T>: Send + Sync {
    fn to_text(&self, value: &T) -> String;
    fn of_text(&self, text: &str) -> GantryResult<T>;
}

/// A typed, persisted value: a file plus the codec for its contents.
#[derive(Clone)]
pub struct Vspec<T> {
    pub path: Path,
    pub codec: Arc<dyn Codec<T>>,
}

impl<T> Vspec<T> {
    pub fn new(path: Path, codec: Arc<dyn Codec<T>>) -> Vspec<T> {
        Vspec { path, codec }
    }
}

impl Vspec<Vec<InternedString>> {
    /// The shape of `*.requires.sexp` and `*.runtime-deps.sexp`: an ordered
    /// list of library best-names.
    pub fn names(path: Path) -> Vspec<Vec<InternedString>> {
        Vspec::new(path, Arc::new(NameListCodec))
    }
}

/// Module name to ordered dependency list, as persisted by the dependency
/// scanner. Order matters: it is the scanner's output order and downstream
/// link closures must see it unchanged.
pub type DepMap = IndexMap<InternedString, Vec<InternedString>>;

impl Vspec<DepMap> {
    pub fn dep_map(path: Path) -> Vspec<DepMap> {
        Vspec::new(path, Arc::new(DepMapCodec))
    }
}

pub struct NameListCodec;

impl Codec<Vec<InternedString>> for NameListCodec {
    fn to_text(&self, value: &Vec<InternedString>) -> String {
        let mut out = String::from("(");
        for (i, name) in value.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(name);
        }
        out.push_str(")\n");
        out
    }

    fn of_text(&self, text: &str) -> GantryResult<Vec<InternedString>> {
        match parse_sexp(text)? {
            Sexp::List(items) => items
                .into_iter()
                .map(|s| match s {
                    Sexp::Atom(a) => Ok(InternedString::new(&a)),
                    Sexp::List(_) => bail!("expected an atom in a name list"),
                })
                .collect(),
            Sexp::Atom(_) => bail!("expected a list of names"),
        }
    }
}

pub struct DepMapCodec;

impl Codec<DepMap> for DepMapCodec {
    fn to_text(&self, value: &DepMap) -> String {
        let mut out = String::from("(");
        for (i, (name, deps)) in value.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push('(');
            out.push_str(name);
            out.push_str(" (");
            for (j, d) in deps.iter().enumerate() {
                if j > 0 {
                    out.push(' ');
                }
                out.push_str(d);
            }
            out.push_str("))");
        }
        out.push_str(")\n");
        out
    }

    fn of_text(&self, text: &str) -> GantryResult<DepMap> {
        let mut map = DepMap::new();
        let Sexp::List(entries) = parse_sexp(text)? else {
            bail!("expected a list of (module (deps...)) pairs");
        };
        for entry in entries {
            let Sexp::List(pair) = entry else {
                bail!("expected a (module (deps...)) pair");
            };
            let [Sexp::Atom(name), Sexp::List(deps)] = pair.as_slice() else {
                bail!("expected a (module (deps...)) pair");
            };
            let deps = deps
                .iter()
                .map(|d| match d {
                    Sexp::Atom(a) => Ok(InternedString::new(a)),
                    Sexp::List(_) => bail!("expected an atom in a dependency list"),
                })
                .collect::<GantryResult<Vec<_>>>()?;
            map.insert(InternedString::new(name), deps);
        }
        Ok(map)
    }
}

enum Sexp {
    Atom(String),
    List(Vec<Sexp>),
}

// A deliberately small reader: the persisted files only ever contain
// unquoted atoms and nested lists.
fn parse_sexp(text: &str) -> GantryResult<Sexp> {
    let mut chars = text.chars().peekable();
    skip_ws(&mut chars);
    let sexp = parse_one(&mut chars)?;
    skip_ws(&mut chars);
    if chars.peek().is_some() {
        bail!("trailing garbage after s-expression");
    }
    Ok(sexp)
}

fn parse_one(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> GantryResult<Sexp> {
    match chars.peek() {
        Some('(') => {
            chars.next();
            let mut items = Vec::new();
            loop {
                skip_ws(chars);
                match chars.peek() {
                    Some(')') => {
                        chars.next();
                        return Ok(Sexp::List(items));
                    }
                    Some(_) => items.push(parse_one(chars)?),
                    None => bail!("unterminated list in s-expression"),
                }
            }
        }
        Some(_) => {
            let mut atom = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == '(' || c == ')' {
                    break;
                }
                atom.push(c);
                chars.next();
            }
            Ok(Sexp::Atom(atom))
        }
        None => bail!("empty s-expression"),
    }
}

fn skip_ws(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
        chars.next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_list_round_trips() {
        let codec = NameListCodec;
        let names = vec![
            InternedString::new("str"),
            InternedString::new("ppx_sexp_conv"),
            InternedString::new("mylib"),
        ];
        let text = codec.to_text(&names);
        assert_eq!(codec.of_text(&text).unwrap(), names);
    }

    #[test]
    fn dep_map_round_trips_preserving_order() {
        let codec = DepMapCodec;
        let mut map = DepMap::new();
        map.insert(InternedString::new("Zeta"), vec![InternedString::new("Alpha")]);
        map.insert(InternedString::new("Alpha"), vec![]);
        let text = codec.to_text(&map);
        let back = codec.of_text(&text).unwrap();
        assert_eq!(
            back.keys().collect::<Vec<_>>(),
            map.keys().collect::<Vec<_>>()
        );
        assert_eq!(back, map);
    }

    #[test]
    fn malformed_text_is_rejected() {
        assert!(NameListCodec.of_text("(a b").is_err());
        assert!(DepMapCodec.of_text("(a)").is_err());
    }
}
