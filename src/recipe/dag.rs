use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::error::{Result, TensorizeError};
use crate::recipe::EdgeMap;
use crate::te::Tensor;

/// Output of a DAG build.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeDag {
    /// Tensors the caller must provide: raw operator inputs and the
    /// placeholders of capsules built without parents.
    pub inputs: Vec<Tensor>,
    /// One tensor per requested key, in request order.
    pub outputs: Vec<Tensor>,
    /// Every key built along the way.
    pub cache: BTreeMap<String, Tensor>,
}

impl ComputeDag {
    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.cache.get(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    /// Raw operator input (`a`, `b`).
    Leaf,
    /// Capsule with parents in the edge map.
    Bound,
    /// Capsule absent from the edge map; built over its own placeholders.
    Root,
}

#[derive(Debug, Clone)]
pub(crate) struct DagNode {
    pub key: String,
    pub kind: NodeKind,
    pub parents: Vec<usize>,
}

/// Ancestors of the requested keys, in an order where parents come first.
#[derive(Debug, Clone)]
pub(crate) struct DagPlan {
    pub nodes: Vec<DagNode>,
    pub order: Vec<usize>,
    pub requested: Vec<usize>,
}

/// Collects the ancestors of `requested` and sorts them topologically.
///
/// `is_leaf` and `is_capsule` classify keys. A requested key that is neither is
/// reported through `unknown`; a parent that is neither makes the edge map
/// invalid.
pub(crate) fn plan<L, C, U>(
    requested: &[&str],
    edges: &EdgeMap,
    is_leaf: L,
    is_capsule: C,
    unknown: U,
) -> Result<DagPlan>
where
    L: Fn(&str) -> bool,
    C: Fn(&str) -> bool,
    U: Fn(&str) -> TensorizeError,
{
    if requested.is_empty() {
        return Err(TensorizeError::InvalidGraph("no capsule keys requested".into()));
    }

    let mut ids: HashMap<String, usize> = HashMap::new();
    let mut nodes: Vec<DagNode> = Vec::new();
    let mut pending: VecDeque<usize> = VecDeque::new();

    let mut intern = |key: &str, nodes: &mut Vec<DagNode>, pending: &mut VecDeque<usize>| -> usize {
        if let Some(&id) = ids.get(key) {
            return id;
        }
        let id = nodes.len();
        ids.insert(key.to_string(), id);
        nodes.push(DagNode { key: key.to_string(), kind: NodeKind::Leaf, parents: Vec::new() });
        pending.push_back(id);
        id
    };

    let mut requested_ids = Vec::with_capacity(requested.len());
    for &key in requested {
        if !is_leaf(key) && !is_capsule(key) {
            return Err(unknown(key));
        }
        requested_ids.push(intern(key, &mut nodes, &mut pending));
    }

    while let Some(id) = pending.pop_front() {
        let key = nodes[id].key.clone();
        if is_leaf(&key) {
            continue;
        }
        if !is_capsule(&key) {
            return Err(TensorizeError::InvalidGraph(format!("edge map references unknown key `{}`", key)));
        }
        match edges.get(&key) {
            None => nodes[id].kind = NodeKind::Root,
            Some(parents) => {
                let parent_ids: Vec<usize> =
                    parents.iter().map(|p| intern(p, &mut nodes, &mut pending)).collect();
                nodes[id].kind = NodeKind::Bound;
                nodes[id].parents = parent_ids;
            }
        }
    }

    // Kahn over the collected ancestors; ties resolve by discovery order.
    let mut indegree: Vec<usize> = nodes.iter().map(|n| n.parents.len()).collect();
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (id, node) in nodes.iter().enumerate() {
        for &parent in &node.parents {
            children[parent].push(id);
        }
    }
    let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|&id| indegree[id] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(id) = ready.pop_front() {
        order.push(id);
        for &child in &children[id] {
            // A key listed twice as a parent counts twice.
            indegree[child] -= 1;
            if indegree[child] == 0 {
                ready.push_back(child);
            }
        }
    }

    if order.len() != nodes.len() {
        let stuck: Vec<&str> = nodes
            .iter()
            .enumerate()
            .filter(|(id, _)| indegree[*id] > 0)
            .map(|(_, n)| n.key.as_str())
            .collect();
        return Err(TensorizeError::InvalidGraph(format!("cycle through {:?}", stuck)));
    }

    Ok(DagPlan { nodes, order, requested: requested_ids })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(pairs: &[(&str, &[&str])]) -> EdgeMap {
        pairs
            .iter()
            .map(|(k, ps)| (k.to_string(), ps.iter().map(|p| p.to_string()).collect()))
            .collect()
    }

    fn classify() -> (impl Fn(&str) -> bool, impl Fn(&str) -> bool, impl Fn(&str) -> TensorizeError) {
        (
            |k: &str| k == "a" || k == "b",
            |k: &str| ["load_a", "load_b", "mma", "store"].contains(&k),
            |k: &str| TensorizeError::InvalidGraph(format!("unknown {}", k)),
        )
    }

    fn position(plan: &DagPlan, key: &str) -> usize {
        plan.order.iter().position(|&id| plan.nodes[id].key == key).unwrap()
    }

    #[test]
    fn test_parents_precede_children() {
        let map = edges(&[
            ("load_a", &["a"]),
            ("load_b", &["b"]),
            ("mma", &["load_a", "load_b"]),
            ("store", &["mma"]),
        ]);
        let (l, c, u) = classify();
        let plan = plan(&["store"], &map, l, c, u).unwrap();
        assert_eq!(plan.nodes.len(), 6);
        assert!(position(&plan, "a") < position(&plan, "load_a"));
        assert!(position(&plan, "load_b") < position(&plan, "mma"));
        assert!(position(&plan, "mma") < position(&plan, "store"));
    }

    #[test]
    fn test_only_ancestors_are_collected() {
        let map = edges(&[("load_a", &["a"]), ("mma", &["load_a", "load_b"])]);
        let (l, c, u) = classify();
        let plan = plan(&["mma"], &map, l, c, u).unwrap();
        let keys: Vec<&str> = plan.nodes.iter().map(|n| n.key.as_str()).collect();
        assert!(!keys.contains(&"store"));
        let load_b = plan.nodes.iter().find(|n| n.key == "load_b").unwrap();
        assert_eq!(load_b.kind, NodeKind::Root);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let map = edges(&[("mma", &["store", "load_b"]), ("store", &["mma"]), ("load_b", &["b"])]);
        let (l, c, u) = classify();
        let err = plan(&["store"], &map, l, c, u).unwrap_err();
        assert!(matches!(err, TensorizeError::InvalidGraph(msg) if msg.contains("cycle")));
    }

    #[test]
    fn test_missing_parent_is_rejected() {
        let map = edges(&[("load_a", &["image"])]);
        let (l, c, u) = classify();
        let err = plan(&["load_a"], &map, l, c, u).unwrap_err();
        assert!(matches!(err, TensorizeError::InvalidGraph(msg) if msg.contains("image")));
    }
}
