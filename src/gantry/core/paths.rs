//! The path model.
//!
//! Gantry distinguishes paths inside the source tree, paths inside the
//! build tree of some context, absolute external paths and the tree root.
//! The build tree mirrors the source tree rooted at `_build/<context>`, so
//! every source path has at most one build counterpart per context.

use std::fmt;
use std::path::{Path as StdPath, PathBuf};

use serde::{Serialize, Serializer};

use crate::core::interning::InternedString;

/// Name of the directory holding all build contexts, directly under the
/// tree root.
pub const BUILD_DIR: &str = "_build";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Path {
    Root,
    Source(PathBuf),
    Build {
        context: InternedString,
        rel: PathBuf,
    },
    Absolute(PathBuf),
}

impl Path {
    pub fn root() -> Path {
        Path::Root
    }

    pub fn source<P: Into<PathBuf>>(p: P) -> Path {
        let p = p.into();
        if p.as_os_str().is_empty() {
            Path::Root
        } else {
            Path::Source(p)
        }
    }

    pub fn build<P: Into<PathBuf>>(context: InternedString, rel: P) -> Path {
        Path::Build {
            context,
            rel: rel.into(),
        }
    }

    pub fn absolute<P: Into<PathBuf>>(p: P) -> Path {
        Path::Absolute(p.into())
    }

    /// Appends a relative component chain, resolving `.` and `..`
    /// components against the base.
    pub fn append(&self, s: &str) -> Path {
        match self {
            Path::Root => Path::source(normalize_join(PathBuf::new(), s)),
            Path::Source(p) => Path::source(normalize_join(p.clone(), s)),
            Path::Build { context, rel } => Path::Build {
                context: *context,
                rel: normalize_join(rel.clone(), s),
            },
            Path::Absolute(p) => Path::Absolute(normalize_join(p.clone(), s)),
        }
    }

    /// Interprets a user-written string relative to `self`; absolute
    /// strings stand on their own.
    pub fn relative(&self, s: &str) -> Path {
        if StdPath::new(s).is_absolute() {
            Path::absolute(s)
        } else {
            self.append(s)
        }
    }

    pub fn parent(&self) -> Path {
        match self {
            Path::Root => Path::Root,
            Path::Source(p) => match p.parent() {
                Some(p) => Path::source(p.to_path_buf()),
                None => Path::Root,
            },
            Path::Build { context, rel } => {
                if rel.as_os_str().is_empty() {
                    Path::Root
                } else {
                    Path::Build {
                        context: *context,
                        rel: rel.parent().map(|p| p.to_path_buf()).unwrap_or_default(),
                    }
                }
            }
            Path::Absolute(p) => match p.parent() {
                Some(p) => Path::Absolute(p.to_path_buf()),
                None => self.clone(),
            },
        }
    }

    pub fn basename(&self) -> &str {
        match self {
            Path::Root => "",
            Path::Source(p) | Path::Absolute(p) | Path::Build { rel: p, .. } => p
                .file_name()
                .map(|n| n.to_str().expect("path is not valid utf-8"))
                .unwrap_or(""),
        }
    }

    pub fn extension(&self) -> Option<&str> {
        match self {
            Path::Root => None,
            Path::Source(p) | Path::Absolute(p) | Path::Build { rel: p, .. } => {
                p.extension().and_then(|e| e.to_str())
            }
        }
    }

    pub fn is_in_build_dir(&self) -> bool {
        matches!(self, Path::Build { .. })
    }

    /// For a build path, the owning context and the tree-relative subpath.
    pub fn extract_build_context(&self) -> Option<(InternedString, &StdPath)> {
        match self {
            Path::Build { context, rel } => Some((*context, rel.as_path())),
            _ => None,
        }
    }

    /// The shortest relative string form of `self` as seen from `from`.
    /// Command lines and line directives use this so that their text does
    /// not depend on where the tree is checked out.
    pub fn reach(&self, from: &Path) -> String {
        if let Path::Absolute(p) = self {
            return p.display().to_string();
        }
        let target = self.tree_path();
        let base = match from {
            Path::Absolute(_) => PathBuf::new(),
            other => other.tree_path(),
        };
        match pathdiff::diff_paths(&target, &base) {
            Some(p) if p.as_os_str().is_empty() => ".".to_string(),
            Some(p) => p.display().to_string(),
            None => self.to_string(),
        }
    }

    /// Root-relative rendering; the root itself renders as the empty path.
    fn tree_path(&self) -> PathBuf {
        match self {
            Path::Root => PathBuf::new(),
            Path::Source(p) => p.clone(),
            Path::Build { context, rel } => {
                let mut p = PathBuf::from(BUILD_DIR);
                p.push(context.as_str());
                p.push(rel);
                p
            }
            Path::Absolute(p) => p.clone(),
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Path::Root => f.write_str("."),
            _ => write!(f, "{}", self.tree_path().display()),
        }
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

fn normalize_join(mut base: PathBuf, s: &str) -> PathBuf {
    for comp in s.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                base.pop();
            }
            c => base.push(c),
        }
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> InternedString {
        InternedString::new("default")
    }

    #[test]
    fn append_and_normalize() {
        let p = Path::source("src").append("../lib/./foo.ml");
        assert_eq!(p, Path::source("lib/foo.ml"));
        assert_eq!(Path::Root.append("a/b"), Path::source("a/b"));
    }

    #[test]
    fn build_paths_mirror_the_source_tree() {
        let p = Path::build(ctx(), "src/foo.ml");
        assert_eq!(p.to_string(), "_build/default/src/foo.ml");
        let (c, sub) = p.extract_build_context().unwrap();
        assert_eq!(c, ctx());
        assert_eq!(sub, StdPath::new("src/foo.ml"));
    }

    #[test]
    fn parent_walks_up_to_the_root() {
        let p = Path::build(ctx(), "src");
        assert_eq!(p.parent(), Path::build(ctx(), ""));
        assert_eq!(p.parent().parent(), Path::Root);
        assert_eq!(Path::source("foo.ml").parent(), Path::Root);
    }

    #[test]
    fn reach_is_the_shortest_relative_form() {
        let dir = Path::build(ctx(), "src");
        let file = Path::build(ctx(), "src/foo.ml");
        assert_eq!(file.reach(&dir), "foo.ml");
        assert_eq!(Path::source("src/foo.ml").reach(&dir), "../../../src/foo.ml");
        assert_eq!(dir.reach(&dir), ".");
        assert_eq!(Path::Root.reach(&dir), "../../..");
    }

    #[test]
    fn ordering_is_total_and_structural() {
        let mut v = vec![
            Path::absolute("/usr/lib"),
            Path::source("b"),
            Path::Root,
            Path::source("a"),
        ];
        v.sort();
        assert_eq!(
            v,
            vec![
                Path::Root,
                Path::source("a"),
                Path::source("b"),
                Path::absolute("/usr/lib"),
            ]
        );
    }
}
