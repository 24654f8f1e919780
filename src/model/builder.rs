//! Builds the operator graph from flat layer records and attaches weight
//! blobs.

use crate::internal::*;
use itertools::Itertools;
use std::collections::HashMap;

/// The populated graph plus the per-node ordered list of IR input tensor
/// base names, resolved from bottom blob names.
#[derive(Debug)]
pub struct BuiltGraph {
    pub graph: OpGraph,
    pub inputs_map: HashMap<String, Vec<String>>,
}

/// Drops training-only layers: anything tagged for the train phase, plus
/// dropout.
fn inference_layers(net: &NetRecord) -> MobirResult<Vec<&LayerRecord>> {
    let layers: Vec<&LayerRecord> = net
        .layers
        .iter()
        .filter(|l| l.phase() == Phase::Test && l.kind != LayerKind::Dropout)
        .collect();
    if let Some(dup) = layers.iter().map(|l| &l.name).duplicates().next() {
        bail!("duplicate test-phase layer name {}", dup);
    }
    Ok(layers)
}

pub fn build_graph(net: &NetRecord, weights: &WeightsRecord) -> MobirResult<BuiltGraph> {
    let mut graph = OpGraph::default();
    let mut inputs_map: HashMap<String, Vec<String>> = HashMap::new();

    // blob name -> IR tensor base name of its most recent producer
    let mut top_name_map: HashMap<String, String> = HashMap::new();
    for input in &net.inputs {
        graph.add_node(input.clone(), LayerKind::Input, None)?;
        top_name_map.insert(input.clone(), input.clone());
    }

    let layers = inference_layers(net)?;
    for layer in &layers {
        trace!("creating node {} ({:?})", layer.name, layer.kind);
        graph.add_node(layer.name.clone(), layer.kind, Some((*layer).clone()))?;
    }

    // blob name -> most recent node declaring it as an output
    let mut output_op_map: HashMap<String, usize> = HashMap::new();
    for layer in &layers {
        let id = graph
            .node_by_name(&layer.name)
            .with_context(|| format!("layer {} vanished from the graph", layer.name))?;
        for bottom in &layer.bottoms {
            ensure!(*bottom != layer.name, "layer {} declares itself as its own input", layer.name);
            let parent = output_op_map
                .get(bottom)
                .copied()
                .or_else(|| graph.node_by_name(bottom))
                .with_context(|| {
                    format!("layer {} consumes blob {} which nothing produces", layer.name, bottom)
                })?;
            graph.add_edge(parent, id);
            let top_name = top_name_map
                .get(bottom)
                .with_context(|| format!("no tensor name recorded for blob {}", bottom))?;
            inputs_map.entry(layer.name.clone()).or_default().push(top_name.clone());
            trace!("wired {} <- {} (blob {})", layer.name, graph.nodes[parent].name, bottom);
        }
        for (ix, top) in layer.tops.iter().enumerate() {
            // single-output layers are referenced by node name alone,
            // multi-output ones by <name>_<index>
            let base = if layer.tops.len() == 1 {
                layer.name.clone()
            } else {
                format!("{}_{}", layer.name, ix)
            };
            top_name_map.insert(top.clone(), base);
            if *top != layer.name {
                output_op_map.insert(top.clone(), id);
            }
        }
    }

    for wl in &weights.layers {
        if wl.blobs.is_empty() {
            continue;
        }
        if let Some(id) = graph.node_by_name(&wl.name) {
            graph.nodes[id].blobs = wl
                .blobs
                .iter()
                .map(|b| b.to_array())
                .collect::<MobirResult<Vec<_>>>()
                .with_context(|| format!("loading weights of layer {}", wl.name))?;
        }
    }

    Ok(BuiltGraph { graph, inputs_map })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relu(name: &str, bottom: &str, top: &str) -> LayerRecord {
        LayerRecord::new(name, LayerKind::ReLU).bottom(bottom).top(top)
    }

    fn net(layers: Vec<LayerRecord>) -> NetRecord {
        NetRecord { name: "t".to_string(), inputs: vec!["data".to_string()], layers }
    }

    #[test]
    fn wires_through_blob_names() {
        let built = build_graph(
            &net(vec![relu("r1", "data", "r1"), relu("r2", "r1", "r2")]),
            &WeightsRecord::default(),
        )
        .unwrap();
        let g = &built.graph;
        let r2 = g.node_by_name("r2").unwrap();
        assert_eq!(g.nodes[r2].parents, vec![g.node_by_name("r1").unwrap()]);
        assert_eq!(built.inputs_map["r2"], vec!["r1".to_string()]);
    }

    #[test]
    fn in_place_layers_resolve_to_most_recent_producer() {
        // both layers write the same blob; the consumer must see the last one
        let built = build_graph(
            &net(vec![
                relu("r1", "data", "act"),
                relu("r2", "act", "act"),
                relu("r3", "act", "r3"),
            ]),
            &WeightsRecord::default(),
        )
        .unwrap();
        let g = &built.graph;
        let r3 = g.node_by_name("r3").unwrap();
        assert_eq!(g.nodes[r3].parents, vec![g.node_by_name("r2").unwrap()]);
        assert_eq!(built.inputs_map["r3"], vec!["r2".to_string()]);
    }

    #[test]
    fn multi_top_layers_get_indexed_tensor_names() {
        let slice = LayerRecord::new("sl", LayerKind::Slice).bottom("data").top("a").top("b");
        let built = build_graph(
            &net(vec![slice, relu("r", "b", "r")]),
            &WeightsRecord::default(),
        )
        .unwrap();
        assert_eq!(built.inputs_map["r"], vec!["sl_1".to_string()]);
    }

    #[test]
    fn duplicate_layer_name_fails() {
        let err = build_graph(
            &net(vec![relu("r", "data", "a"), relu("r", "a", "b")]),
            &WeightsRecord::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn self_referencing_input_fails() {
        let err =
            build_graph(&net(vec![relu("r", "r", "r")]), &WeightsRecord::default()).unwrap_err();
        assert!(err.to_string().contains("its own input"));
    }

    #[test]
    fn train_phase_and_dropout_layers_are_dropped() {
        let mut train = relu("train_only", "data", "t");
        train.include = Some(Phase::Train);
        let drop = LayerRecord::new("drop", LayerKind::Dropout).bottom("data").top("d");
        let built =
            build_graph(&net(vec![train, drop, relu("r", "data", "r")]), &WeightsRecord::default())
                .unwrap();
        assert_eq!(built.graph.len(), 2); // input + r
        assert!(built.graph.node_by_name("drop").is_none());
    }

    #[test]
    fn weights_attach_by_layer_name() {
        let mut n = net(vec![relu("r", "data", "r")]);
        n.layers.push(LayerRecord::new("p", LayerKind::PReLU).bottom("r").top("p"));
        let weights = WeightsRecord {
            layers: vec![WeightsLayer::new(
                "p".to_string(),
                vec![BlobRecord::from_shape(vec![4], vec![0.1; 4])],
            )],
        };
        let built = build_graph(&n, &weights).unwrap();
        let p = built.graph.node_by_name("p").unwrap();
        assert_eq!(built.graph.nodes[p].blobs.len(), 1);
        assert_eq!(built.graph.nodes[p].blobs[0].shape(), &[4]);
    }
}
