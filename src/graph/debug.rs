//! Debug visualisation of the baked pass dependency DAG.

use anyhow::Result;
use petgraph::dot::Dot;
use petgraph::Graph;

use crate::graph::RenderGraph;

/// Export a graph in GraphViz `dot` format for debugging and visualization.
pub trait GraphViz {
    fn dot(&self) -> Result<String>;
}

impl GraphViz for RenderGraph {
    /// Scheduled passes become nodes; edges are dependencies, labeled `merge`
    /// when the edge could fold into a subpass dependency.
    fn dot(&self) -> Result<String> {
        self.require_baked()?;

        let mut graph = Graph::<&str, &str>::new();
        let nodes: Vec<_> = self
            .pass_stack
            .iter()
            .map(|&pass| graph.add_node(self.passes[pass].name.as_str()))
            .collect();

        for (slot, &pass) in self.pass_stack.iter().enumerate() {
            let mut deps: Vec<usize> = self.pass_dependencies[pass].iter().copied().collect();
            deps.sort_unstable();
            for dep in deps {
                let Some(dep_slot) = self.pass_stack.iter().position(|&p| p == dep) else {
                    continue;
                };
                let label = if self.pass_merge_dependencies[pass].contains(&dep) {
                    "merge"
                } else {
                    "hard"
                };
                graph.add_edge(nodes[dep_slot], nodes[slot], label);
            }
        }

        Ok(format!("{}", Dot::new(&graph)))
    }
}
