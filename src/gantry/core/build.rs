//! The build-graph primitive.
//!
//! A [`Build<A, B>`] is a composable value describing a computation from
//! `A` to `B` together with the path dependencies and targets that
//! computation declares. Rule dependencies are a side effect of *value
//! construction*: combinators return immutable nodes, `then` chains them,
//! `fanout` runs two against the same input, and path combinators add
//! dependencies while passing their value through unchanged.
//!
//! Interpreting a finished `Build<(), Action>` yields a [`Rule`]: the
//! static input set, the target set and the (still unevaluated) action.
//! Realizing a rule against a [`VfileLoader`] evaluates the arrow in two
//! phases: pure parts run first to surface dynamic dependencies
//! ([`Build::dyn_paths`], [`Build::vpath`]), then the action is produced.
//! Scheduling the re-entry after dynamic dependencies is the executor's
//! contract, not ours.

use std::any::Any;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::anyhow;
use serde::Serialize;

use crate::core::interning::InternedString;
use crate::core::paths::Path;
use crate::core::vfile::Vspec;
use crate::util::errors::{internal, GantryResult};

type Value = Arc<dyn Any + Send + Sync>;
type ArrFn = Arc<dyn Fn(Value) -> GantryResult<Value> + Send + Sync>;
type DynArgFn = Arc<dyn Fn(&Value) -> GantryResult<Vec<String>> + Send + Sync>;

/// What a library dependency was recorded for; optional deps do not make a
/// package non-installable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LibDepKind {
    Required,
    Optional,
}

/// A side-channel record of library usage, consumed by the install-manifest
/// and editor-integration emitters. Not an input or output of the action.
#[derive(Clone, Debug, Serialize)]
pub struct LibDepRecord {
    pub dir: Path,
    pub kind: LibDepKind,
    pub names: Vec<InternedString>,
}

/// A glob dependency: the executor enumerates matches under `dir` before
/// the action runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GlobDep {
    pub dir: Path,
    #[serde(serialize_with = "serialize_pattern")]
    pub pattern: glob::Pattern,
}

fn serialize_pattern<S: serde::Serializer>(
    p: &glob::Pattern,
    s: S,
) -> Result<S::Ok, S::Error> {
    s.serialize_str(p.as_str())
}

#[derive(Clone)]
struct VspecDyn {
    path: Path,
    load: Arc<dyn Fn(&str) -> GantryResult<Value> + Send + Sync>,
    store: Arc<dyn Fn(&Value) -> GantryResult<String> + Send + Sync>,
}

impl VspecDyn {
    fn of<T: Clone + Send + Sync + 'static>(spec: &Vspec<T>) -> VspecDyn {
        let load_codec = Arc::clone(&spec.codec);
        let store_codec = Arc::clone(&spec.codec);
        VspecDyn {
            path: spec.path.clone(),
            load: Arc::new(move |text| {
                let v = load_codec.of_text(text)?;
                Ok(Arc::new(v) as Value)
            }),
            store: Arc::new(move |value| {
                let v = value
                    .downcast_ref::<T>()
                    .ok_or_else(|| internal("persisted value has unexpected type"))?;
                Ok(store_codec.to_text(v))
            }),
        }
    }
}

#[derive(Clone)]
enum Repr {
    Arr(ArrFn),
    Compose(Box<Repr>, Box<Repr>),
    Fanout(Box<Repr>, Box<Repr>),
    Paths(Vec<Path>),
    Targets { paths: Vec<Path>, extra: bool },
    Glob(GlobDep),
    FilesRecursivelyIn(Path),
    Contents(Path),
    Lines(Path),
    Vpath(VspecDyn),
    StoreVfile(VspecDyn),
    DynPaths(Box<Repr>),
    RecordLibDeps(LibDepRecord),
    Fail(Arc<anyhow::Error>),
}

/// A composable `(inputs) -> (outputs, action)` fragment. See the module
/// documentation.
pub struct Build<A, B> {
    repr: Repr,
    _marker: PhantomData<fn(A) -> B>,
}

impl<A, B> Clone for Build<A, B> {
    fn clone(&self) -> Build<A, B> {
        Build {
            repr: self.repr.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, B> Build<A, B>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
{
    fn from_repr(repr: Repr) -> Build<A, B> {
        Build {
            repr,
            _marker: PhantomData,
        }
    }

    /// Lifts a pure function into the graph.
    pub fn arr(f: impl Fn(A) -> B + Send + Sync + 'static) -> Build<A, B> {
        Build::try_arr(move |a| Ok(f(a)))
    }

    /// Lifts a fallible function; the error surfaces when the consuming
    /// rule is realized.
    pub fn try_arr(f: impl Fn(A) -> GantryResult<B> + Send + Sync + 'static) -> Build<A, B> {
        Build::from_repr(Repr::Arr(lift(f)))
    }

    /// Constant output, no dependencies.
    pub fn pure(b: B) -> Build<A, B> {
        Build::arr(move |_| b.clone())
    }

    /// Sequences `self` then `next`; dependency sets union.
    pub fn then<C>(self, next: Build<B, C>) -> Build<A, C>
    where
        C: Clone + Send + Sync + 'static,
    {
        Build::from_repr(Repr::Compose(Box::new(self.repr), Box::new(next.repr)))
    }

    pub fn map<C>(self, f: impl Fn(B) -> C + Send + Sync + 'static) -> Build<A, C>
    where
        C: Clone + Send + Sync + 'static,
    {
        self.then(Build::arr(f))
    }

    pub fn try_map<C>(
        self,
        f: impl Fn(B) -> GantryResult<C> + Send + Sync + 'static,
    ) -> Build<A, C>
    where
        C: Clone + Send + Sync + 'static,
    {
        self.then(Build::try_arr(f))
    }

    /// Parallel composition sharing the input.
    pub fn fanout<C>(self, other: Build<A, C>) -> Build<A, (B, C)>
    where
        C: Clone + Send + Sync + 'static,
    {
        let pair = Repr::Fanout(Box::new(self.repr), Box::new(other.repr));
        let adapt: ArrFn = Arc::new(|v: Value| {
            let pair = v
                .downcast::<(Value, Value)>()
                .map_err(|_| internal("fanout produced a non-pair"))?;
            let b = pair
                .0
                .clone()
                .downcast::<B>()
                .map_err(|_| internal("fanout left value has unexpected type"))?;
            let c = pair
                .1
                .clone()
                .downcast::<C>()
                .map_err(|_| internal("fanout right value has unexpected type"))?;
            Ok(Arc::new(((*b).clone(), (*c).clone())) as Value)
        });
        Build::from_repr(Repr::Compose(Box::new(pair), Box::new(Repr::Arr(adapt))))
    }
}

impl<A> Build<A, A>
where
    A: Clone + Send + Sync + 'static,
{
    /// Identity with an added static input.
    pub fn path(p: &Path) -> Build<A, A> {
        Build::paths(vec![p.clone()])
    }

    pub fn paths(ps: Vec<Path>) -> Build<A, A> {
        Build::from_repr(Repr::Paths(ps))
    }

    pub fn path_set(ps: &BTreeSet<Path>) -> Build<A, A> {
        Build::paths(ps.iter().cloned().collect())
    }

    /// Identity with an added glob input under `dir`.
    pub fn paths_glob(dir: &Path, pattern: glob::Pattern) -> Build<A, A> {
        Build::from_repr(Repr::Glob(GlobDep {
            dir: dir.clone(),
            pattern,
        }))
    }

    /// Identity with a transitive file dependency over a subtree.
    pub fn files_recursively_in(dir: &Path) -> Build<A, A> {
        Build::from_repr(Repr::FilesRecursivelyIn(dir.clone()))
    }

    /// After `inner` produces a path list, each path becomes an input of
    /// the rule; the value flows through unchanged.
    pub fn dyn_paths(inner: Build<A, Vec<Path>>) -> Build<A, A> {
        Build::from_repr(Repr::DynPaths(Box::new(inner.repr)))
    }

    pub fn record_lib_deps(
        dir: &Path,
        kind: LibDepKind,
        names: Vec<InternedString>,
    ) -> Build<A, A> {
        Build::from_repr(Repr::RecordLibDeps(LibDepRecord {
            dir: dir.clone(),
            kind,
            names,
        }))
    }

    /// A deferred failure: rule generation succeeds, realizing any rule
    /// built from this node fails. This is how missing optional
    /// dependencies stay silent until somebody actually needs them.
    pub fn fail(error: anyhow::Error) -> Build<A, A> {
        Build::from_repr(Repr::Fail(Arc::new(error)))
    }
}

impl<A> Build<A, String>
where
    A: Clone + Send + Sync + 'static,
{
    /// The contents of a file, as a dependency.
    pub fn contents(p: &Path) -> Build<A, String> {
        Build::from_repr(Repr::Contents(p.clone()))
    }
}

impl<A> Build<A, Vec<String>>
where
    A: Clone + Send + Sync + 'static,
{
    /// The lines of a file, as a dependency.
    pub fn lines_of(p: &Path) -> Build<A, Vec<String>> {
        Build::from_repr(Repr::Lines(p.clone()))
    }
}

impl<A, T> Build<A, T>
where
    A: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Loads a persisted typed value; depends on its file.
    pub fn vpath(spec: &Vspec<T>) -> Build<A, T> {
        Build::from_repr(Repr::Vpath(VspecDyn::of(spec)))
    }
}

impl<T> Build<T, Action>
where
    T: Clone + Send + Sync + 'static,
{
    /// Persists the computed value to disk under the spec's schema; the
    /// spec's file becomes a target of the rule and the realized action
    /// is the write.
    pub fn store_vfile(spec: &Vspec<T>) -> Build<T, Action> {
        Build::from_repr(Repr::StoreVfile(VspecDyn::of(spec)))
    }
}

impl<A> Build<A, Action>
where
    A: Clone + Send + Sync + 'static,
{
    /// Copies `src` to `dst`.
    pub fn copy(src: &Path, dst: &Path) -> Build<A, Action> {
        Build::<A, A>::path(src)
            .then(Build::<A, A>::from_repr(Repr::Targets {
                paths: vec![dst.clone()],
                extra: false,
            }))
            .then(Build::pure(Action::Copy {
                src: src.clone(),
                dst: dst.clone(),
            }))
    }

    /// Copies `src` to `dst`, rewriting `#` line directives so generated
    /// code reports positions in the canonical build-tree file.
    pub fn copy_and_add_line_directive(src: &Path, dst: &Path) -> Build<A, Action> {
        Build::<A, A>::path(src)
            .then(Build::<A, A>::from_repr(Repr::Targets {
                paths: vec![dst.clone()],
                extra: false,
            }))
            .then(Build::pure(Action::CopyAndAddLineDirective {
                src: src.clone(),
                dst: dst.clone(),
            }))
    }

    pub fn create_file(dst: &Path) -> Build<A, Action> {
        Build::<A, A>::from_repr(Repr::Targets {
            paths: vec![dst.clone()],
            extra: false,
        })
        .then(Build::pure(Action::CreateFile(dst.clone())))
    }

    pub fn create_files(dsts: Vec<Path>) -> Build<A, Action> {
        let actions = dsts.iter().cloned().map(Action::CreateFile).collect();
        Build::<A, A>::from_repr(Repr::Targets {
            paths: dsts,
            extra: false,
        })
        .then(Build::pure(Action::Progn(actions)))
    }

    pub fn write_file(dst: &Path, text: String) -> Build<A, Action> {
        Build::<A, A>::from_repr(Repr::Targets {
            paths: vec![dst.clone()],
            extra: false,
        })
        .then(Build::pure(Action::WriteFile {
            dst: dst.clone(),
            text,
        }))
    }

    /// An arbitrary prebuilt action producing `targets`.
    pub fn action(action: Action, targets: Vec<Path>) -> Build<A, Action> {
        Build::<A, A>::from_repr(Repr::Targets {
            paths: targets,
            extra: false,
        })
        .then(Build::pure(action))
    }

    /// A shell command run from `dir`, producing `targets`.
    pub fn bash(dir: &Path, cmd: String, targets: Vec<Path>) -> Build<A, Action> {
        Build::<A, A>::from_repr(Repr::Targets {
            paths: targets,
            extra: false,
        })
        .then(Build::pure(Action::Chdir(
            dir.clone(),
            Box::new(Action::Bash(cmd)),
        )))
    }
}

impl Build<String, Action> {
    /// Writes the incoming string to `dst`.
    pub fn echo(dst: &Path) -> Build<String, Action> {
        let target = dst.clone();
        Build::<String, String>::from_repr(Repr::Targets {
            paths: vec![dst.clone()],
            extra: false,
        })
        .then(Build::arr(move |text: String| Action::Echo {
            dst: target.clone(),
            text,
        }))
    }
}

fn lift<A, B>(
    f: impl Fn(A) -> GantryResult<B> + Send + Sync + 'static,
) -> ArrFn
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
{
    Arc::new(move |v: Value| {
        let a = v
            .downcast::<A>()
            .map_err(|_| internal("build arrow value has unexpected type"))?;
        let b = f((*a).clone())?;
        Ok(Arc::new(b) as Value)
    })
}

/// One fragment of a command line. Path references register as inputs,
/// target references as outputs, `Dyn` fragments are computed from the
/// graph's dynamic input when the rule is realized.
#[derive(Clone)]
pub enum Arg {
    A(String),
    As(Vec<String>),
    Dep(Path),
    Deps(Vec<Path>),
    Path(Path),
    Paths(Vec<Path>),
    Target(Path),
    S(Vec<Arg>),
    Dyn(DynArg),
}

#[derive(Clone)]
pub struct DynArg(DynArgFn);

impl Arg {
    pub fn a(s: impl Into<String>) -> Arg {
        Arg::A(s.into())
    }

    /// A deferred fragment computed from the typed dynamic input.
    pub fn dyn_of<A>(f: impl Fn(&A) -> Vec<String> + Send + Sync + 'static) -> Arg
    where
        A: Send + Sync + 'static,
    {
        Arg::try_dyn_of(move |a: &A| Ok(f(a)))
    }

    pub fn try_dyn_of<A>(
        f: impl Fn(&A) -> GantryResult<Vec<String>> + Send + Sync + 'static,
    ) -> Arg
    where
        A: Send + Sync + 'static,
    {
        Arg::Dyn(DynArg(Arc::new(move |v: &Value| {
            let a = v
                .downcast_ref::<A>()
                .ok_or_else(|| internal("dynamic argument input has unexpected type"))?;
            f(a)
        })))
    }
}

fn collect_arg_paths(args: &[Arg], deps: &mut Vec<Path>, targets: &mut Vec<Path>) {
    for arg in args {
        match arg {
            Arg::Dep(p) => deps.push(p.clone()),
            Arg::Deps(ps) => deps.extend(ps.iter().cloned()),
            Arg::Target(p) => targets.push(p.clone()),
            Arg::S(inner) => collect_arg_paths(inner, deps, targets),
            Arg::A(_) | Arg::As(_) | Arg::Path(_) | Arg::Paths(_) | Arg::Dyn(_) => {}
        }
    }
}

fn render_args(args: &[Arg], dir: &Path, input: &Value) -> GantryResult<Vec<String>> {
    let mut out = Vec::new();
    for arg in args {
        match arg {
            Arg::A(s) => out.push(s.clone()),
            Arg::As(ss) => out.extend(ss.iter().cloned()),
            Arg::Dep(p) | Arg::Path(p) | Arg::Target(p) => out.push(p.reach(dir)),
            Arg::Deps(ps) | Arg::Paths(ps) => out.extend(ps.iter().map(|p| p.reach(dir))),
            Arg::S(inner) => out.extend(render_args(inner, dir, input)?),
            Arg::Dyn(DynArg(f)) => out.extend(f(input)?),
        }
    }
    Ok(out)
}

/// Builder for an external command rule, in the style of a process
/// builder: chain arguments and options, then lower into a `Build`.
pub struct RunBuilder {
    dir: Path,
    prog: Path,
    args: Vec<Arg>,
    stdout_to: Option<Path>,
    targets: Vec<Path>,
    extra_targets: Vec<Path>,
}

impl RunBuilder {
    pub fn new(dir: &Path, prog: &Path) -> RunBuilder {
        RunBuilder {
            dir: dir.clone(),
            prog: prog.clone(),
            args: Vec::new(),
            stdout_to: None,
            targets: Vec::new(),
            extra_targets: Vec::new(),
        }
    }

    /// Declares a target that does not appear on the command line (e.g. a
    /// file the tool writes next to its input).
    pub fn target(mut self, p: &Path) -> RunBuilder {
        self.targets.push(p.clone());
        self
    }

    pub fn arg(mut self, a: Arg) -> RunBuilder {
        self.args.push(a);
        self
    }

    pub fn args(mut self, args: Vec<Arg>) -> RunBuilder {
        self.args.extend(args);
        self
    }

    pub fn stdout_to(mut self, p: &Path) -> RunBuilder {
        self.stdout_to = Some(p.clone());
        self
    }

    pub fn extra_targets(mut self, ps: Vec<Path>) -> RunBuilder {
        self.extra_targets.extend(ps);
        self
    }

    pub fn into_build<A>(self) -> Build<A, Action>
    where
        A: Clone + Send + Sync + 'static,
    {
        let mut deps = Vec::new();
        let mut targets = self.targets.clone();
        collect_arg_paths(&self.args, &mut deps, &mut targets);
        // The program itself is an input when it lives in the tree, e.g. a
        // preprocessor driver built by an earlier rule.
        if !matches!(self.prog, Path::Absolute(_)) {
            deps.push(self.prog.clone());
        }
        if let Some(p) = &self.stdout_to {
            targets.push(p.clone());
        }
        let RunBuilder {
            dir,
            prog,
            args,
            stdout_to,
            targets: _,
            extra_targets,
        } = self;
        let action: ArrFn = Arc::new(move |input: Value| {
            let rendered = render_args(&args, &dir, &input)?;
            let mut action = Action::Run {
                prog: prog.reach(&dir),
                args: rendered,
            };
            if let Some(p) = &stdout_to {
                action = Action::WithStdoutTo(p.clone(), Box::new(action));
            }
            action = Action::Chdir(dir.clone(), Box::new(action));
            Ok(Arc::new(action) as Value)
        });
        let repr = Repr::Compose(
            Box::new(Repr::Paths(deps)),
            Box::new(Repr::Compose(
                Box::new(Repr::Targets {
                    paths: targets,
                    extra: false,
                }),
                Box::new(Repr::Compose(
                    Box::new(Repr::Targets {
                        paths: extra_targets,
                        extra: true,
                    }),
                    Box::new(Repr::Arr(action)),
                )),
            )),
        );
        Build::from_repr(repr)
    }
}

/// The action of a realized rule, ready for the executor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Action {
    Run { prog: String, args: Vec<String> },
    Chdir(Path, Box<Action>),
    WithStdoutTo(Path, Box<Action>),
    Bash(String),
    Echo { dst: Path, text: String },
    Copy { src: Path, dst: Path },
    CopyAndAddLineDirective { src: Path, dst: Path },
    WriteFile { dst: Path, text: String },
    CreateFile(Path),
    Remove(Path),
    Progn(Vec<Action>),
}

/// Supplies file contents during realization. The real implementation is
/// the executor's; tests use an in-memory map.
pub trait VfileLoader {
    fn load(&self, path: &Path) -> GantryResult<String>;
}

impl VfileLoader for std::collections::BTreeMap<Path, String> {
    fn load(&self, path: &Path) -> GantryResult<String> {
        self.get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no rule produced {}", path))
    }
}

/// A realized rule: the dynamic inputs discovered in phase one and the
/// action to run in phase two.
#[derive(Debug, Clone)]
pub struct Realized {
    pub dynamic_inputs: Vec<Path>,
    pub action: Action,
}

/// A build edge. Invariant: every path the action reads is in
/// `inputs` or matches `globs`/`recursive_inputs`; every path it writes is
/// in `targets` or `extra_targets`.
pub struct Rule {
    repr: Repr,
    pub inputs: BTreeSet<Path>,
    pub globs: Vec<GlobDep>,
    pub recursive_inputs: Vec<Path>,
    pub targets: BTreeSet<Path>,
    pub extra_targets: BTreeSet<Path>,
    pub lib_deps: Vec<LibDepRecord>,
}

impl Rule {
    pub fn new(build: Build<(), Action>) -> Rule {
        let mut rule = Rule {
            repr: build.repr,
            inputs: BTreeSet::new(),
            globs: Vec::new(),
            recursive_inputs: Vec::new(),
            targets: BTreeSet::new(),
            extra_targets: BTreeSet::new(),
            lib_deps: Vec::new(),
        };
        interpret(&rule.repr.clone(), &mut rule);
        rule
    }

    pub fn all_targets(&self) -> impl Iterator<Item = &Path> {
        self.targets.iter().chain(self.extra_targets.iter())
    }

    /// Evaluates the rule to its action. Phase one walks the arrow to load
    /// persisted values and surface dynamic inputs; phase two yields the
    /// action. Deferred failures recorded during generation surface here.
    pub fn realize(&self, loader: &dyn VfileLoader) -> GantryResult<Realized> {
        let mut dynamic_inputs = Vec::new();
        let value = eval(&self.repr, Arc::new(()) as Value, loader, &mut dynamic_inputs)?;
        let action = value
            .downcast::<Action>()
            .map_err(|_| internal("rule evaluated to no action"))?;
        Ok(Realized {
            dynamic_inputs,
            action: (*action).clone(),
        })
    }
}

fn interpret(repr: &Repr, rule: &mut Rule) {
    match repr {
        Repr::Arr(_) | Repr::Fail(_) => {}
        Repr::Compose(a, b) => {
            interpret(a, rule);
            interpret(b, rule);
        }
        Repr::Fanout(a, b) => {
            interpret(a, rule);
            interpret(b, rule);
        }
        Repr::Paths(ps) => rule.inputs.extend(ps.iter().cloned()),
        Repr::Targets { paths, extra } => {
            if *extra {
                rule.extra_targets.extend(paths.iter().cloned());
            } else {
                rule.targets.extend(paths.iter().cloned());
            }
        }
        Repr::Glob(g) => rule.globs.push(g.clone()),
        Repr::FilesRecursivelyIn(dir) => rule.recursive_inputs.push(dir.clone()),
        Repr::Contents(p) | Repr::Lines(p) => {
            rule.inputs.insert(p.clone());
        }
        Repr::Vpath(spec) => {
            rule.inputs.insert(spec.path.clone());
        }
        Repr::StoreVfile(spec) => {
            rule.targets.insert(spec.path.clone());
        }
        Repr::DynPaths(inner) => interpret(inner, rule),
        Repr::RecordLibDeps(record) => rule.lib_deps.push(record.clone()),
    }
}

fn eval(
    repr: &Repr,
    input: Value,
    loader: &dyn VfileLoader,
    dynamic_inputs: &mut Vec<Path>,
) -> GantryResult<Value> {
    match repr {
        Repr::Arr(f) => f(input),
        Repr::Compose(a, b) => {
            let mid = eval(a, input, loader, dynamic_inputs)?;
            eval(b, mid, loader, dynamic_inputs)
        }
        Repr::Fanout(a, b) => {
            let va = eval(a, input.clone(), loader, dynamic_inputs)?;
            let vb = eval(b, input, loader, dynamic_inputs)?;
            Ok(Arc::new((va, vb)) as Value)
        }
        Repr::Paths(_)
        | Repr::Targets { .. }
        | Repr::Glob(_)
        | Repr::FilesRecursivelyIn(_)
        | Repr::RecordLibDeps(_) => Ok(input),
        Repr::Contents(p) => {
            let text = loader.load(p)?;
            Ok(Arc::new(text) as Value)
        }
        Repr::Lines(p) => {
            let text = loader.load(p)?;
            let lines: Vec<String> = text.lines().map(|l| l.to_string()).collect();
            Ok(Arc::new(lines) as Value)
        }
        Repr::Vpath(spec) => {
            let text = loader.load(&spec.path)?;
            (spec.load)(&text)
        }
        Repr::StoreVfile(spec) => {
            let text = (spec.store)(&input)?;
            Ok(Arc::new(Action::WriteFile {
                dst: spec.path.clone(),
                text,
            }) as Value)
        }
        Repr::DynPaths(inner) => {
            let v = eval(inner, input.clone(), loader, dynamic_inputs)?;
            let paths = v
                .downcast::<Vec<Path>>()
                .map_err(|_| internal("dyn_paths inner value is not a path list"))?;
            dynamic_inputs.extend((*paths).iter().cloned());
            Ok(input)
        }
        Repr::Fail(err) => Err(anyhow!("{:#}", err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::BTreeMap;

    fn ctx() -> InternedString {
        InternedString::new("default")
    }

    fn bd(p: &str) -> Path {
        Path::build(ctx(), p)
    }

    #[test]
    fn compose_and_map_evaluate_in_order() {
        let b: Build<(), usize> = Build::pure(2usize).map(|n| n * 3).map(|n| n + 1);
        let rule = Rule::new(b.map(|n| Action::Bash(format!("echo {}", n))));
        let realized = rule.realize(&BTreeMap::new()).unwrap();
        assert_eq!(realized.action, Action::Bash("echo 7".to_string()));
    }

    #[test]
    fn fanout_shares_the_input() {
        let left: Build<(), u32> = Build::pure(1u32);
        let right: Build<(), u32> = Build::pure(2u32);
        let both = left
            .fanout(right)
            .map(|(a, b)| Action::Bash(format!("echo {}", a + b)));
        let realized = Rule::new(both).realize(&BTreeMap::new()).unwrap();
        assert_eq!(realized.action, Action::Bash("echo 3".to_string()));
    }

    #[test]
    fn run_registers_deps_and_targets() {
        let dir = bd("src");
        let build = RunBuilder::new(&dir, &Path::absolute("/usr/bin/ocamlc"))
            .args(vec![
                Arg::a("-c"),
                Arg::Dep(Path::source("src/foo.ml")),
                Arg::a("-o"),
                Arg::Target(bd("src/foo.cmo")),
            ])
            .extra_targets(vec![bd("src/foo.cmt")])
            .into_build::<()>();
        let rule = Rule::new(build);
        assert!(rule.inputs.contains(&Path::source("src/foo.ml")));
        assert!(rule.targets.contains(&bd("src/foo.cmo")));
        assert!(rule.extra_targets.contains(&bd("src/foo.cmt")));
        let realized = rule.realize(&BTreeMap::new()).unwrap();
        match realized.action {
            Action::Chdir(d, inner) => {
                assert_eq!(d, dir);
                match *inner {
                    Action::Run { prog, args } => {
                        assert_eq!(prog, "/usr/bin/ocamlc");
                        assert_eq!(args, vec!["-c", "../../../src/foo.ml", "-o", "foo.cmo"]);
                    }
                    other => panic!("unexpected action {:?}", other),
                }
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn store_vfile_becomes_a_write_action_and_a_target() {
        let spec = Vspec::names(bd("src/foo.requires.sexp"));
        let build: Build<(), Action> = Build::pure(vec![InternedString::new("str")])
            .then(Build::store_vfile(&spec));
        let rule = Rule::new(build);
        assert!(rule.targets.contains(&bd("src/foo.requires.sexp")));
        let realized = rule.realize(&BTreeMap::new()).unwrap();
        match realized.action {
            Action::WriteFile { dst, text } => {
                assert_eq!(dst, bd("src/foo.requires.sexp"));
                assert_eq!(text, "(str)\n");
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn vpath_depends_on_its_file_and_loads_it() {
        let spec = Vspec::names(bd("src/foo.requires.sexp"));
        let build: Build<(), Action> = Build::vpath(&spec).map(|names: Vec<InternedString>| {
            Action::Bash(format!("echo {}", names.len()))
        });
        let rule = Rule::new(build);
        assert!(rule.inputs.contains(&bd("src/foo.requires.sexp")));
        let mut files = BTreeMap::new();
        files.insert(bd("src/foo.requires.sexp"), "(str unix)".to_string());
        let realized = rule.realize(&files).unwrap();
        assert_eq!(realized.action, Action::Bash("echo 2".to_string()));
    }

    #[test]
    fn dyn_paths_surface_as_dynamic_inputs() {
        let inner: Build<(), Vec<Path>> = Build::pure(vec![bd("src/a.cmi"), bd("src/b.cmi")]);
        let build = Build::dyn_paths(inner).then(Build::create_file(&bd("src/.sentinel")));
        let realized = Rule::new(build).realize(&BTreeMap::new()).unwrap();
        assert_eq!(realized.dynamic_inputs, vec![bd("src/a.cmi"), bd("src/b.cmi")]);
    }

    #[test]
    fn echo_writes_the_computed_string() {
        let dst = bd("src/flags");
        let build: Build<(), Action> =
            Build::pure("-g -w +a".to_string()).then(Build::echo(&dst));
        let rule = Rule::new(build);
        assert!(rule.targets.contains(&dst));
        let realized = rule.realize(&BTreeMap::new()).unwrap();
        assert_eq!(
            realized.action,
            Action::Echo {
                dst,
                text: "-g -w +a".to_string(),
            }
        );
    }

    #[test]
    fn deferred_failure_only_fires_on_realize() {
        let build: Build<(), Action> = Build::<(), ()>::fail(anyhow!("library not found: foo"))
            .then(Build::create_file(&bd("src/out")));
        let rule = Rule::new(build);
        let err = rule.realize(&BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("library not found: foo"));
    }
}
