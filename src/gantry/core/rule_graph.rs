//! Machine-readable dump of an emitted rule graph, for tooling and
//! debugging. Only the static shape is serialized; actions are evaluated
//! by the executor, not here.

use std::io::Write;

use serde::Serialize;

use crate::core::build::{GlobDep, LibDepRecord, Rule};
use crate::util::errors::GantryResult;

const VERSION: u32 = 1;

#[derive(Serialize)]
struct SerializedRuleGraph<'a> {
    version: u32,
    rules: Vec<SerializedRule<'a>>,
}

#[derive(Serialize)]
struct SerializedRule<'a> {
    inputs: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    globs: Vec<&'a GlobDep>,
    targets: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extra_targets: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    lib_deps: Vec<&'a LibDepRecord>,
}

pub fn emit_serialized_rule_graph(rules: &[Rule], out: &mut dyn Write) -> GantryResult<()> {
    let mut ser_rules: Vec<SerializedRule<'_>> = rules
        .iter()
        .map(|rule| SerializedRule {
            inputs: rule.inputs.iter().map(|p| p.to_string()).collect(),
            globs: rule.globs.iter().collect(),
            targets: rule.targets.iter().map(|p| p.to_string()).collect(),
            extra_targets: rule.extra_targets.iter().map(|p| p.to_string()).collect(),
            lib_deps: rule.lib_deps.iter().collect(),
        })
        .collect();
    // Stable output independent of emission order.
    ser_rules.sort_by(|a, b| a.targets.cmp(&b.targets));
    let graph = SerializedRuleGraph {
        version: VERSION,
        rules: ser_rules,
    };
    serde_json::to_writer(&mut *out, &graph)?;
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::build::{Build, Rule};
    use crate::core::paths::Path;

    #[test]
    fn dump_is_valid_json_listing_targets() {
        let rule = Rule::new(Build::create_file(&Path::source("out.txt")));
        let mut buf = Vec::new();
        emit_serialized_rule_graph(&[rule], &mut buf).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(v["version"], 1);
        assert_eq!(v["rules"][0]["targets"][0], "out.txt");
    }
}
