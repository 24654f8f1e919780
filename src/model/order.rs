//! Topological ordering of the operator graph.

use crate::internal::*;

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    New,
    Active,
    Done,
}

/// Depth-first post-order over parents: every node appears after all of its
/// ancestors. A parent found on the active DFS path signals a cycle.
/// Deterministic given the arena order (file order) and parent order.
pub fn toposort(graph: &OpGraph) -> MobirResult<Vec<usize>> {
    let mut marks = vec![Mark::New; graph.len()];
    let mut order = Vec::with_capacity(graph.len());
    for start in 0..graph.len() {
        if marks[start] != Mark::New {
            continue;
        }
        let mut stack = vec![start];
        while let Some(&node) = stack.last() {
            match marks[node] {
                Mark::Done => {
                    stack.pop();
                }
                Mark::Active => {
                    // all parents visited by now
                    marks[node] = Mark::Done;
                    order.push(node);
                    stack.pop();
                }
                Mark::New => {
                    marks[node] = Mark::Active;
                    for &parent in graph.nodes[node].parents.iter().rev() {
                        match marks[parent] {
                            Mark::Active => {
                                bail!(
                                    "the model is not a DAG: {} depends on itself through {}",
                                    graph.nodes[parent].name,
                                    graph.nodes[node].name
                                )
                            }
                            Mark::New => stack.push(parent),
                            Mark::Done => {}
                        }
                    }
                }
            }
        }
    }
    Ok(order)
}
