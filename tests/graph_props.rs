//! Property tests over the graph-shaped invariants: link-closure
//! ordering, first-occurrence deduplication, persisted-closure round
//! trips and object-name assignment.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::collection::{btree_set, vec};
use proptest::prelude::*;

use gantry::core::interning::InternedString;
use gantry::core::libdb::{dedup_libs, ResolvedLib};
use gantry::core::paths::Path;
use gantry::core::stanza::{LibSpec, Stanza};
use gantry::core::vfile::{Codec, DepMap, NameListCodec};
use gantry::util::graph::link_closure;

use common::{bd, has_target, project};

fn n(s: &str) -> InternedString {
    InternedString::new(s)
}

proptest! {
    /// Persist a closure, load it back: the best-name list survives
    /// unchanged (including order and duplicates).
    #[test]
    fn name_list_codec_round_trips(names in vec("[a-z][a-z0-9_.]{0,8}", 0..10)) {
        let names: Vec<InternedString> = names.iter().map(|s| n(s)).collect();
        let codec = NameListCodec;
        let text = codec.to_text(&names);
        prop_assert_eq!(codec.of_text(&text).unwrap(), names);
    }

    /// In a link closure every module appears after all of its
    /// dependencies, and the result is deterministic.
    #[test]
    fn link_closure_is_sound_and_stable(matrix in vec(vec(any::<bool>(), 8), 8)) {
        let names: Vec<InternedString> =
            (0..8).map(|i| n(&format!("M{}", i))).collect();
        let mut map = DepMap::new();
        for i in 0..8 {
            let deps: Vec<InternedString> = (i + 1..8)
                .filter(|&j| matrix[i][j])
                .map(|j| names[j])
                .collect();
            map.insert(names[i], deps);
        }
        let order = link_closure(&names, &map).unwrap();
        prop_assert_eq!(order.len(), 8);
        let pos = |m: InternedString| order.iter().position(|&x| x == m).unwrap();
        for (unit, deps) in &map {
            for dep in deps {
                prop_assert!(
                    pos(*dep) < pos(*unit),
                    "{} linked after its dependent {}",
                    dep,
                    unit
                );
            }
        }
        prop_assert_eq!(link_closure(&names, &map).unwrap(), order);
    }

    /// Ordered deduplication keeps the first occurrence of each best
    /// name.
    #[test]
    fn dedup_keeps_first_occurrence(names in vec("[a-c][a-z]{0,2}", 0..12)) {
        let libs: Vec<ResolvedLib> = names
            .iter()
            .map(|name| ResolvedLib::Internal {
                dir: Path::build(n("default"), format!("lib/{}", name)),
                spec: Arc::new(LibSpec::new(name)),
            })
            .collect();
        let deduped = dedup_libs(libs);

        let mut expected = Vec::new();
        let mut seen = BTreeSet::new();
        for name in &names {
            if seen.insert(name.clone()) {
                expected.push(n(name));
            }
        }
        let got: Vec<InternedString> = deduped.iter().map(|l| l.best_name()).collect();
        prop_assert_eq!(got, expected);
    }

    /// Every non-main module of a wrapped library compiles to a
    /// `{lib}__{Name}`-prefixed object; the main module keeps the plain
    /// name.
    #[test]
    fn wrapped_object_names_are_prefixed(
        stems in btree_set("[a-d][a-z]{0,4}", 2..5),
        with_main in any::<bool>(),
    ) {
        let mut files: Vec<String> =
            stems.iter().map(|s| format!("{}.ml", s)).collect();
        if with_main {
            files.push("mylib.ml".to_string());
        }
        let files: Vec<&str> = files.iter().map(|f| f.as_str()).collect();
        let ctx = project()
            .dir("src", &files, vec![Stanza::Library(LibSpec::new("mylib"))])
            .build();

        for stem in &stems {
            if stem == "mylib" {
                continue;
            }
            let module: String = {
                let mut chars = stem.chars();
                let first = chars.next().unwrap().to_uppercase();
                first.chain(chars).collect()
            };
            prop_assert!(
                has_target(&ctx, &bd(&format!("src/mylib__{}.cmo", module))),
                "module {} not compiled under a prefixed object name",
                module
            );
        }
        if with_main {
            prop_assert!(has_target(&ctx, &bd("src/mylib.cmo")));
        }
    }
}
