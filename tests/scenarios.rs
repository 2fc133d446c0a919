//! End-to-end scenarios: whole-project rule generation checked against
//! the expected graph shape, with realization driven by in-memory
//! persisted files.

mod common;

use pretty_assertions::assert_eq;

use gantry::core::build::Action;
use gantry::core::compiler::Mode;
use gantry::core::interning::InternedString;
use gantry::core::ordered_set_lang::OrderedSetLang;
use gantry::core::paths::Path;
use gantry::core::stanza::{
    DepConf, LibDep, LibSpec, Ocamllex, PreprocessMap, SelectChoice, Stanza, UserAction,
    UserRule,
};
use gantry::ops::{gen_install_rules, gen_merlin_rules, ProjectPackage};

use common::{bd, command_of, find_rule, has_target, project, realize};

fn n(s: &str) -> InternedString {
    InternedString::new(s)
}

#[test]
fn single_module_library_emits_the_full_rule_set() {
    let mut lib = LibSpec::new("foo");
    lib.wrapped = false;
    let ctx = project()
        .dir("src", &["foo.ml"], vec![Stanza::Library(lib)])
        .build();

    for target in [
        "src/foo.depends.impl.ocamldep-output",
        "src/foo.depends.impl.sexp",
        "src/foo.depends.intf.ocamldep-output",
        "src/foo.depends.intf.sexp",
        "src/foo.cmo",
        "src/foo.cmi",
        "src/foo.cmx",
        "src/foo.o",
        "src/foo.requires.sexp",
        "src/foo.runtime-deps.sexp",
        "src/foo.cma",
        "src/foo.cmxa",
        "src/foo.a",
        "src/foo.cmxs",
        "src/foo.cmi-all",
        "src/foo.cmo-all",
        "src/foo.cmx-all",
    ] {
        assert!(has_target(&ctx, &bd(target)), "missing target {}", target);
    }

    // No explicit interface: the bytecode rule is the sole cmi producer.
    let cmo_rule = find_rule(&ctx, &bd("src/foo.cmo"));
    assert!(cmo_rule.extra_targets.contains(&bd("src/foo.cmi")));

    let realized = realize(
        cmo_rule,
        &[(bd("src/foo.depends.impl.sexp"), "((Foo ()))")],
    )
    .unwrap();
    let (prog, args) = command_of(&realized.action);
    assert_eq!(prog, "/usr/bin/ocamlc");
    assert!(args.contains(&"-c".to_string()));
    assert!(args.contains(&"-bin-annot".to_string()));
    assert!(args.contains(&"foo.ml".to_string()));

    // The native rule must not race the bytecode rule over the cmi.
    let cmx_rule = find_rule(&ctx, &bd("src/foo.cmx"));
    assert!(cmx_rule.inputs.contains(&bd("src/foo.cmi")));
    let realized = realize(
        cmx_rule,
        &[(bd("src/foo.depends.impl.sexp"), "((Foo ()))")],
    )
    .unwrap();
    let (_, args) = command_of(&realized.action);
    let i = args.iter().position(|a| a == "-intf-suffix").unwrap();
    assert_eq!(args[i + 1], ".ml");

    let cma_rule = find_rule(&ctx, &bd("src/foo.cma"));
    let realized = realize(
        cma_rule,
        &[(bd("src/foo.depends.impl.sexp"), "((Foo ()))")],
    )
    .unwrap();
    let (_, args) = command_of(&realized.action);
    assert!(args.contains(&"-a".to_string()));
    assert!(args.contains(&"foo.cmo".to_string()));
}

#[test]
fn wrapped_library_synthesizes_an_alias_module() {
    let lib = LibSpec::new("mylib");
    let ctx = project()
        .dir(
            "src",
            &["mylib.ml", "a.ml", "b.ml", "b.mli"],
            vec![Stanza::Library(lib)],
        )
        .build();

    let alias_rule = find_rule(&ctx, &bd("src/mylib__.ml-gen"));
    let realized = realize(alias_rule, &[]).unwrap();
    match realized.action {
        Action::WriteFile { text, .. } => {
            assert_eq!(text, "module A = Mylib__A\nmodule B = Mylib__B\n");
        }
        other => panic!("unexpected action {:?}", other),
    }

    // Non-main modules get prefixed object names, the main module keeps
    // the plain one.
    assert!(has_target(&ctx, &bd("src/mylib__A.cmo")));
    assert!(has_target(&ctx, &bd("src/mylib__B.cmo")));
    assert!(has_target(&ctx, &bd("src/mylib.cmo")));
    assert!(has_target(&ctx, &bd("src/mylib__.cmo")));

    let deps = "((Mylib__ ()) (A (Mylib__)) (B (Mylib__)) (Mylib (Mylib__)))";
    let a_cmo = find_rule(&ctx, &bd("src/mylib__A.cmo"));
    let realized = realize(a_cmo, &[(bd("src/mylib.depends.impl.sexp"), deps)]).unwrap();
    let (_, args) = command_of(&realized.action);
    let i = args.iter().position(|a| a == "-open").unwrap();
    assert_eq!(args[i + 1], "Mylib__");
    assert!(args.contains(&"-no-alias-deps".to_string()));
    assert_eq!(realized.dynamic_inputs, vec![bd("src/mylib__.cmi")]);

    // The alias is compiled with warning 49 silenced, no -open, and its
    // generated source forced to be read as an implementation.
    let alias_cmo = find_rule(&ctx, &bd("src/mylib__.cmo"));
    let realized = realize(alias_cmo, &[]).unwrap();
    let (_, args) = command_of(&realized.action);
    assert!(args.windows(2).any(|w| w[0] == "-w" && w[1] == "-49"));
    assert!(!args.contains(&"-open".to_string()));
    assert!(args
        .windows(2)
        .any(|w| w[0] == "-impl" && w[1] == "mylib__.ml-gen"));
}

#[test]
fn native_only_library_nominates_the_native_rule_as_cmi_producer() {
    let mut lib = LibSpec::new("foo");
    lib.wrapped = false;
    lib.modes = [Mode::Native].into_iter().collect();
    let ctx = project()
        .dir("src", &["foo.ml"], vec![Stanza::Library(lib)])
        .build();

    // No bytecode rule runs, so the native rule owns the cmi.
    assert!(!has_target(&ctx, &bd("src/foo.cmo")));
    let cmx_rule = find_rule(&ctx, &bd("src/foo.cmx"));
    assert!(cmx_rule.extra_targets.contains(&bd("src/foo.cmi")));
    assert!(!cmx_rule.inputs.contains(&bd("src/foo.cmi")));
    let realized = realize(
        cmx_rule,
        &[(bd("src/foo.depends.impl.sexp"), "((Foo ()))")],
    )
    .unwrap();
    let (_, args) = command_of(&realized.action);
    assert!(!args.contains(&"-intf-suffix".to_string()));

    assert!(has_target(&ctx, &bd("src/foo.cmi-all")));
    assert!(has_target(&ctx, &bd("src/foo.cmx-all")));
    assert!(!has_target(&ctx, &bd("src/foo.cmo-all")));
}

#[test]
fn optional_library_with_missing_dep_defers_its_failure() {
    let mut lib = LibSpec::new("opt");
    lib.optional = true;
    lib.libraries = vec![LibDep::direct("nonexistent")];
    let ctx = project()
        .dir("src", &["opt.ml"], vec![Stanza::Library(lib)])
        .build();

    let installable: Vec<String> = ctx
        .libdb
        .internal_libs_without_non_installable_optional_ones()
        .into_iter()
        .map(|(_, spec)| spec.name.to_string())
        .collect();
    assert!(installable.is_empty());

    let requires_rule = find_rule(&ctx, &bd("src/opt.requires.sexp"));
    let err = realize(requires_rule, &[]).unwrap_err();
    assert!(err.to_string().contains("library nonexistent not found"));
}

#[test]
fn shared_preprocessor_builds_exactly_one_driver() {
    let mut a = LibSpec::new("a");
    a.preprocess = PreprocessMap::pps_for_all(&["ppx_y", "ppx_x"]);
    let mut b = LibSpec::new("b");
    b.preprocess = PreprocessMap::pps_for_all(&["ppx_x", "ppx_y"]);
    let ctx = project()
        .dir("a", &["a.ml"], vec![Stanza::Library(a)])
        .dir("b", &["b.ml"], vec![Stanza::Library(b)])
        .findlib("ppx_x")
        .findlib("ppx_y")
        .findlib("ppx_driver")
        .findlib("ppx_driver_runner")
        .build();

    let driver = bd(".ppx/ppx_x+ppx_y/ppx.exe");
    let driver_rules = ctx
        .rules()
        .iter()
        .filter(|r| r.targets.contains(&driver))
        .count();
    assert_eq!(driver_rules, 1);

    for pp in ["a/a.pp.ml", "b/b.pp.ml"] {
        let rule = find_rule(&ctx, &bd(pp));
        assert!(
            rule.inputs.contains(&driver),
            "{} does not use the shared driver",
            pp
        );
    }
}

#[test]
fn select_materializes_a_copy_rule_and_joins_the_closure() {
    let mut lib = LibSpec::new("sel");
    lib.wrapped = false;
    lib.modules = OrderedSetLang::atoms(["Backend"]);
    lib.libraries = vec![LibDep::Select {
        choices: vec![
            SelectChoice {
                required: [n("unix")].into_iter().collect(),
                forbidden: Default::default(),
                file: "unix_impl.ml".to_string(),
            },
            SelectChoice {
                required: Default::default(),
                forbidden: Default::default(),
                file: "stub_impl.ml".to_string(),
            },
        ],
        result_file: "backend.ml".to_string(),
    }];
    let ctx = project()
        .dir(
            "src",
            &["unix_impl.ml", "stub_impl.ml"],
            vec![Stanza::Library(lib)],
        )
        .findlib("unix")
        .build();

    let copy_rule = find_rule(&ctx, &bd("src/backend.ml"));
    let realized = realize(copy_rule, &[]).unwrap();
    assert_eq!(
        realized.action,
        Action::Copy {
            src: bd("src/unix_impl.ml"),
            dst: bd("src/backend.ml"),
        }
    );

    let requires_rule = find_rule(&ctx, &bd("src/sel.requires.sexp"));
    let realized = realize(requires_rule, &[]).unwrap();
    match realized.action {
        Action::WriteFile { text, .. } => assert_eq!(text, "(unix)\n"),
        other => panic!("unexpected action {:?}", other),
    }
}

#[test]
fn lexer_generation_goes_through_a_rewritten_temporary() {
    let ctx = project()
        .dir(
            "src",
            &["lex1.mll"],
            vec![Stanza::Ocamllex(Ocamllex {
                names: vec!["lex1".to_string()],
            })],
        )
        .build();

    let gen_rule = find_rule(&ctx, &bd("src/lex1.tmp.ml"));
    let realized = realize(gen_rule, &[]).unwrap();
    let (prog, args) = command_of(&realized.action);
    assert_eq!(prog, "/usr/bin/ocamllex");
    assert!(args.contains(&"-q".to_string()));

    let rewrite_rule = find_rule(&ctx, &bd("src/lex1.ml"));
    assert!(rewrite_rule.inputs.contains(&bd("src/lex1.tmp.ml")));
    let realized = realize(rewrite_rule, &[]).unwrap();
    assert_eq!(
        realized.action,
        Action::Progn(vec![
            Action::CopyAndAddLineDirective {
                src: bd("src/lex1.tmp.ml"),
                dst: bd("src/lex1.ml"),
            },
            Action::Remove(bd("src/lex1.tmp.ml")),
        ])
    );
}

#[test]
fn user_rules_expand_variables_before_running() {
    let ctx = project()
        .dir(
            "src",
            &["input.txt"],
            vec![Stanza::Rule(UserRule {
                targets: vec!["out.txt".to_string()],
                deps: vec![DepConf::File("input.txt".to_string())],
                action: UserAction::Bash("cp ${<} ${@}".to_string()),
            })],
        )
        .build();

    let rule = find_rule(&ctx, &bd("src/out.txt"));
    assert!(rule.inputs.contains(&bd("src/input.txt")));
    let realized = realize(rule, &[]).unwrap();
    match realized.action {
        Action::Chdir(_, inner) => {
            assert_eq!(*inner, Action::Bash("cp input.txt out.txt".to_string()))
        }
        other => panic!("unexpected action {:?}", other),
    }
}

#[test]
fn cross_directory_closures_go_through_persisted_files() {
    let mut a = LibSpec::new("a");
    a.libraries = vec![LibDep::direct("str")];
    let mut b = LibSpec::new("b");
    b.libraries = vec![LibDep::direct("a")];
    let ctx = project()
        .dir("a", &["a.ml"], vec![Stanza::Library(a)])
        .dir("b", &["b.ml"], vec![Stanza::Library(b)])
        .findlib("str")
        .build();

    let b_requires = find_rule(&ctx, &Path::build(n("default"), "b/b.requires.sexp"));
    assert!(b_requires
        .inputs
        .contains(&Path::build(n("default"), "a/a.requires.sexp")));

    let files = [(Path::build(n("default"), "a/a.requires.sexp"), "(str)")];
    let first = realize(b_requires, &files).unwrap();
    let second = realize(b_requires, &files).unwrap();
    assert_eq!(first.action, second.action);
    match first.action {
        Action::WriteFile { text, .. } => assert_eq!(text, "(str a)\n"),
        other => panic!("unexpected action {:?}", other),
    }
}

#[test]
fn archive_emission_reports_link_cycles() {
    let mut lib = LibSpec::new("foo");
    lib.wrapped = false;
    let ctx = project()
        .dir("src", &["foo.ml"], vec![Stanza::Library(lib)])
        .build();

    let cma_rule = find_rule(&ctx, &bd("src/foo.cma"));
    let err = realize(
        cma_rule,
        &[(
            bd("src/foo.depends.impl.sexp"),
            "((Foo (Bar)) (Bar (Foo)))",
        )],
    )
    .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("cycle"), "{}", msg);
    assert!(msg.contains("Foo"), "{}", msg);
    assert!(msg.contains("Bar"), "{}", msg);
}

#[test]
fn no_two_rules_share_a_target() {
    let mut foo = LibSpec::new("foo");
    foo.wrapped = false;
    let mylib = LibSpec::new("mylib");
    let ctx = project()
        .dir("foo", &["foo.ml"], vec![Stanza::Library(foo)])
        .dir(
            "mylib",
            &["mylib.ml", "a.ml", "b.ml", "b.mli"],
            vec![Stanza::Library(mylib)],
        )
        .build();

    let mut seen = std::collections::BTreeMap::new();
    for rule in ctx.rules() {
        for target in rule.all_targets() {
            *seen.entry(target.clone()).or_insert(0) += 1;
        }
    }
    let dups: Vec<_> = seen.iter().filter(|(_, &c)| c > 1).collect();
    assert!(dups.is_empty(), "duplicated targets: {:?}", dups);
}

#[test]
fn install_manifest_covers_libraries_docs_meta_and_opam() {
    let mut lib = LibSpec::new("mylib");
    lib.public_name = Some(n("mylib"));
    lib.wrapped = false;
    let builder = project().dir("src", &["mylib.ml"], vec![Stanza::Library(lib)]);
    let dirs = builder.dirs().to_vec();
    let mut ctx = builder.build();

    let packages = [ProjectPackage {
        name: n("mylib"),
        dir: String::new(),
        version: Some("0.1.0".to_string()),
        files: vec!["README.md".to_string(), "mylib.opam".to_string()],
    }];
    gen_install_rules(&mut ctx, &packages, &dirs).unwrap();

    let meta_rule = find_rule(&ctx, &bd("META.mylib"));
    let realized = realize(meta_rule, &[]).unwrap();
    match realized.action {
        Action::WriteFile { text, .. } => {
            assert!(text.contains("version = \"0.1.0\""));
            assert!(text.contains("archive(byte) = \"mylib.cma\""));
            assert!(text.contains("plugin(native) = \"mylib.cmxs\""));
        }
        other => panic!("unexpected action {:?}", other),
    }

    let manifest_rule = find_rule(&ctx, &bd("mylib.install"));
    let realized = realize(manifest_rule, &[]).unwrap();
    let Action::WriteFile { text, .. } = realized.action else {
        panic!("expected a manifest write");
    };
    assert!(text.contains("lib: ["));
    assert!(text.contains("\"_build/default/src/mylib.cma\""));
    assert!(text.contains("\"_build/default/META.mylib\" {\"META\"}"));
    assert!(text.contains("doc: ["));
    assert!(text.contains("\"README.md\""));
    assert!(text.contains("\"mylib.opam\" {\"opam\"}"));

    // The default context mirrors the manifest back to the source tree.
    assert!(common::has_target(&ctx, &Path::source("mylib.install")));
}

#[test]
fn merlin_is_emitted_for_the_default_context_only() {
    let mut lib = LibSpec::new("mylib");
    lib.libraries = vec![LibDep::direct("str")];
    let builder = project()
        .dir("src", &["mylib.ml"], vec![Stanza::Library(lib.clone())])
        .findlib("str");
    let dirs = builder.dirs().to_vec();
    let mut ctx = builder.build();
    gen_merlin_rules(&mut ctx, &dirs).unwrap();

    let merlin_rule = find_rule(&ctx, &bd("src/.merlin"));
    let realized = realize(merlin_rule, &[]).unwrap();
    let Action::WriteFile { text, .. } = realized.action else {
        panic!("expected a .merlin write");
    };
    assert!(text.contains("S .\n"));
    assert!(text.contains("B ../_build/default/src"));
    assert!(text.contains("PKG str"));
    assert!(common::has_target(&ctx, &Path::source("src/.merlin")));

    // A non-default context gets no .merlin at all.
    let builder = project()
        .dir("src", &["mylib.ml"], vec![Stanza::Library(lib)])
        .findlib("str")
        .config(|c| c.name = n("4.06.0"));
    let dirs = builder.dirs().to_vec();
    let mut ctx = builder.build();
    gen_merlin_rules(&mut ctx, &dirs).unwrap();
    assert!(!common::has_target(
        &ctx,
        &Path::build(n("4.06.0"), "src/.merlin")
    ));
}
