use std::collections::HashMap;

use indexmap::IndexMap;

use crate::core::interning::InternedString;
use crate::util::errors::CycleError;

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    InProgress,
    Done,
}

/// Closes `roots` over `deps` into link order: every module appears after
/// all of its dependencies, first occurrence wins, insertion order of
/// `roots` is preserved between independent subgraphs.
///
/// Names without an entry in `deps` are taken to be leaves. A cycle is
/// returned as an error listing the modules along it.
pub fn link_closure(
    roots: &[InternedString],
    deps: &IndexMap<InternedString, Vec<InternedString>>,
) -> Result<Vec<InternedString>, CycleError> {
    let mut marks: HashMap<InternedString, Mark> = HashMap::new();
    let mut stack: Vec<InternedString> = Vec::new();
    let mut order: Vec<InternedString> = Vec::new();
    for &root in roots {
        visit(root, deps, &mut marks, &mut stack, &mut order)?;
    }
    Ok(order)
}

fn visit(
    name: InternedString,
    deps: &IndexMap<InternedString, Vec<InternedString>>,
    marks: &mut HashMap<InternedString, Mark>,
    stack: &mut Vec<InternedString>,
    order: &mut Vec<InternedString>,
) -> Result<(), CycleError> {
    match marks.get(&name) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::InProgress) => {
            let start = stack.iter().position(|&m| m == name).unwrap_or(0);
            let mut modules = stack[start..].to_vec();
            modules.push(name);
            return Err(CycleError { modules });
        }
        None => {}
    }
    marks.insert(name, Mark::InProgress);
    stack.push(name);
    if let Some(ds) = deps.get(&name) {
        for &d in ds {
            visit(d, deps, marks, stack, order)?;
        }
    }
    stack.pop();
    marks.insert(name, Mark::Done);
    order.push(name);
    Ok(())
}
