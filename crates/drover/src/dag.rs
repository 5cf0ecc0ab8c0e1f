//! Pure, side-effect-free transformations on [`DagTemplate`].

use std::collections::BTreeSet;

use crate::model::DagTemplate;

/// Derive an UNDO sub-graph from a DO graph by reversing edges over a
/// chosen node subset.
///
/// The result contains only `nodes_subset` (intersected with the template's
/// nodes) and only edges whose both endpoints lie in the subset, each with
/// its direction flipped: `(depends_on, step)` becomes `(step, depends_on)`.
/// This is how a compensation plan is derived for a partially-completed
/// APPLY: the caller selects the DO steps that actually ran, and the
/// rollback order falls out of dependency reversal.
pub fn reverse_subdag(
    template: &DagTemplate,
    nodes_subset: &BTreeSet<String>,
    workflow_id: impl Into<String>,
) -> DagTemplate {
    let nodes: BTreeSet<String> = template
        .nodes
        .intersection(nodes_subset)
        .cloned()
        .collect();

    let edges: BTreeSet<(String, String)> = template
        .edges
        .iter()
        .filter(|(depends_on, step)| nodes.contains(depends_on) && nodes.contains(step))
        .map(|(depends_on, step)| (step.clone(), depends_on.clone()))
        .collect();

    DagTemplate {
        workflow_id: workflow_id.into(),
        nodes,
        edges,
    }
}
