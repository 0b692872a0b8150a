//! Snapshot tree search
//!
//! Snapshot names are not unique on most hypervisors, so lookups collect
//! every match across the whole tree and let the caller decide.

use crate::types::SnapshotNode;
use crate::{Error, Result};

/// Collect every node named `name`, depth-first in tree order.
///
/// Children are visited whether or not their parent matched, so a duplicate
/// name nested under a match is still counted.
pub fn find_by_name<'a>(roots: &'a [SnapshotNode], name: &str) -> Vec<&'a SnapshotNode> {
    let mut matches = Vec::new();
    collect(roots, name, &mut matches);
    matches
}

fn collect<'a>(nodes: &'a [SnapshotNode], name: &str, out: &mut Vec<&'a SnapshotNode>) {
    for node in nodes {
        if node.name == name {
            out.push(node);
        }
        collect(&node.children, name, out);
    }
}

/// Select the single snapshot named `name` in the tree of `vm_name`.
pub fn select_unique<'a>(
    roots: &'a [SnapshotNode],
    vm_name: &str,
    name: &str,
) -> Result<&'a SnapshotNode> {
    let matches = find_by_name(roots, name);
    match matches.as_slice() {
        [only] => Ok(*only),
        _ => Err(Error::SnapshotMatch {
            vm: vm_name.to_string(),
            snapshot: name.to_string(),
            count: matches.len(),
        }),
    }
}

/// Total number of nodes in the tree
pub fn count_nodes(roots: &[SnapshotNode]) -> usize {
    roots
        .iter()
        .map(|node| 1 + count_nodes(&node.children))
        .sum()
}

/// Render the tree as indented lines, one snapshot per line.
pub fn render_tree(roots: &[SnapshotNode]) -> Vec<String> {
    let mut lines = Vec::new();
    render(roots, 0, &mut lines);
    lines
}

fn render(nodes: &[SnapshotNode], depth: usize, out: &mut Vec<String>) {
    for node in nodes {
        out.push(format!("{}{} ({})", "  ".repeat(depth), node.name, node.id));
        render(&node.children, depth + 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node(id: &str, name: &str, children: Vec<SnapshotNode>) -> SnapshotNode {
        SnapshotNode::new(id, name).with_children(children)
    }

    fn sample_tree() -> Vec<SnapshotNode> {
        vec![
            node(
                "snap-1",
                "install",
                vec![node(
                    "snap-2",
                    "patched",
                    vec![node("snap-3", "BASELINE", vec![])],
                )],
            ),
            node("snap-4", "scratch", vec![]),
        ]
    }

    #[test]
    fn test_finds_nested_match() {
        let tree = sample_tree();
        let matches = find_by_name(&tree, "BASELINE");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "snap-3");

        let selected = select_unique(&tree, "target-01", "BASELINE").unwrap();
        assert_eq!(selected.id, "snap-3");
    }

    #[test]
    fn test_missing_name() {
        let tree = sample_tree();
        assert!(find_by_name(&tree, "baseline").is_empty());

        let err = select_unique(&tree, "target-01", "baseline").unwrap_err();
        assert_eq!(err.match_count(), Some(0));
    }

    #[test]
    fn test_duplicate_siblings() {
        let tree = vec![
            node("snap-1", "BASELINE", vec![]),
            node("snap-2", "BASELINE", vec![]),
        ];
        let err = select_unique(&tree, "target-01", "BASELINE").unwrap_err();
        assert!(matches!(err, Error::SnapshotMatch { count: 2, .. }));
    }

    #[test]
    fn test_duplicate_below_match_is_counted() {
        let tree = vec![node(
            "snap-1",
            "BASELINE",
            vec![node("snap-2", "BASELINE", vec![])],
        )];
        let matches = find_by_name(&tree, "BASELINE");
        let ids: Vec<&str> = matches.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["snap-1", "snap-2"]);
        assert!(select_unique(&tree, "target-01", "BASELINE").is_err());
    }

    #[test]
    fn test_empty_tree() {
        assert!(find_by_name(&[], "BASELINE").is_empty());
        assert_eq!(count_nodes(&[]), 0);
    }

    fn arb_node() -> impl Strategy<Value = SnapshotNode> {
        let leaf = "[abc]".prop_map(|name| SnapshotNode::new(format!("snap-{}", name), name));
        leaf.prop_recursive(4, 48, 4, |inner| {
            ("[abc]", prop::collection::vec(inner, 0..4)).prop_map(|(name, children)| {
                SnapshotNode::new(format!("snap-{}", name), name).with_children(children)
            })
        })
    }

    fn brute_count(roots: &[SnapshotNode], name: &str) -> usize {
        let mut stack: Vec<&SnapshotNode> = roots.iter().collect();
        let mut count = 0;
        while let Some(node) = stack.pop() {
            if node.name == name {
                count += 1;
            }
            stack.extend(node.children.iter());
        }
        count
    }

    proptest! {
        #[test]
        fn test_search_matches_every_node_at_any_depth(
            roots in prop::collection::vec(arb_node(), 0..4),
            // "d" never appears in a tree
            name in "[abcd]",
        ) {
            let expected = brute_count(&roots, &name);
            let matches = find_by_name(&roots, &name);
            prop_assert_eq!(matches.len(), expected);
            prop_assert!(matches.iter().all(|n| n.name == name));

            match select_unique(&roots, "target-01", &name) {
                Ok(node) => {
                    prop_assert_eq!(expected, 1);
                    prop_assert_eq!(&node.name, &name);
                }
                Err(err) => {
                    prop_assert_ne!(expected, 1);
                    prop_assert_eq!(err.match_count(), Some(expected));
                }
            }
        }
    }

    #[test]
    fn test_count_and_render() {
        let tree = sample_tree();
        assert_eq!(count_nodes(&tree), 4);
        assert_eq!(
            render_tree(&tree),
            vec![
                "install (snap-1)",
                "  patched (snap-2)",
                "    BASELINE (snap-3)",
                "scratch (snap-4)",
            ]
        );
    }
}
