//! The in-memory operator graph: an arena of nodes addressed by index, with
//! parent/child edges stored as index lists so traversal is O(1) in both
//! directions without ownership cycles.

use crate::internal::*;
use ndarray::ArrayD;
use std::collections::HashMap;

mod builder;
mod order;

pub use builder::{build_graph, BuiltGraph};
pub use order::toposort;

#[derive(Debug, Clone)]
pub struct OpNode {
    pub id: usize,
    pub name: String,
    pub kind: LayerKind,
    /// Source layer record; absent for synthetic Input nodes.
    pub layer: Option<LayerRecord>,
    pub parents: Vec<usize>,
    pub children: Vec<usize>,
    pub blobs: Vec<ArrayD<f32>>,
    /// Inferred shape per declared output blob name (node name for Input
    /// nodes). Filled in topological order during lowering.
    pub output_shapes: HashMap<String, Shape>,
}

impl OpNode {
    pub fn single_parent(&self) -> MobirResult<usize> {
        ensure!(
            self.parents.len() == 1,
            "operator {} expected a single parent, got {}",
            self.name,
            self.parents.len()
        );
        Ok(self.parents[0])
    }

    /// First declared output blob name, or the node name for Input nodes.
    pub fn first_top(&self) -> &str {
        self.layer
            .as_ref()
            .and_then(|l| l.tops.first())
            .map(|t| t.as_str())
            .unwrap_or(&self.name)
    }

    pub fn bottom(&self, ix: usize) -> MobirResult<&str> {
        self.layer
            .as_ref()
            .and_then(|l| l.bottoms.get(ix))
            .map(|b| b.as_str())
            .with_context(|| format!("operator {} has no input blob #{}", self.name, ix))
    }
}

#[derive(Debug, Clone, Default)]
pub struct OpGraph {
    pub nodes: Vec<OpNode>,
    by_name: HashMap<String, usize>,
}

impl OpGraph {
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: LayerKind,
        layer: Option<LayerRecord>,
    ) -> MobirResult<usize> {
        let name = name.into();
        let id = self.nodes.len();
        ensure!(
            self.by_name.insert(name.clone(), id).is_none(),
            "duplicate operator name {}",
            name
        );
        self.nodes.push(OpNode {
            id,
            name,
            kind,
            layer,
            parents: vec![],
            children: vec![],
            blobs: vec![],
            output_shapes: HashMap::new(),
        });
        Ok(id)
    }

    pub fn add_edge(&mut self, parent: usize, child: usize) {
        self.nodes[child].parents.push(parent);
        self.nodes[parent].children.push(child);
    }

    pub fn node_by_name(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Inferred shape of the `ix`-th input blob, looked up on the `ix`-th
    /// parent.
    pub fn bottom_shape(&self, id: usize, ix: usize) -> MobirResult<Shape> {
        let node = &self.nodes[id];
        let bottom = node.bottom(ix)?;
        let parent = *node
            .parents
            .get(ix)
            .with_context(|| format!("operator {} has no parent #{}", node.name, ix))?;
        self.nodes[parent].output_shapes.get(bottom).cloned().with_context(|| {
            format!(
                "no inferred shape for blob {} consumed by {} (producer {})",
                bottom, node.name, self.nodes[parent].name
            )
        })
    }

    /// Strict single-parent variant of [Self::bottom_shape].
    pub fn parent_shape(&self, id: usize) -> MobirResult<Shape> {
        self.nodes[id].single_parent()?;
        self.bottom_shape(id, 0)
    }
}
