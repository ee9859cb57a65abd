use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::reservoir::Reservoir;

/// Closed set of node kinds in a circuit graph.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// External channel; a bound `value` marks a compile-time constant.
    Input { value: Option<f64> },
    /// Untyped signal with at most one producer and one consumer.
    Var,
    /// Reservoir instance; `None` until bound against a library or
    /// function-table entry.
    Reservoir { reservoir: Option<Reservoir> },
    /// Terminal sink.
    Output,
    /// Terminal sink promoted from an existing node by `make_return`.
    Return,
}

impl NodeKind {
    fn label(&self) -> &'static str {
        match self {
            NodeKind::Input { .. } => "input",
            NodeKind::Var => "var",
            NodeKind::Reservoir { .. } => "reservoir",
            NodeKind::Output => "output",
            NodeKind::Return => "return",
        }
    }
}

/// Directed edge. `output_idx` selects a W row and is present iff the
/// source is a reservoir node; `input_idx` selects a B column and is
/// present iff the target is a reservoir node.
#[derive(Debug, Clone)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub output_idx: Option<usize>,
    pub input_idx: Option<usize>,
}

/// Dataflow graph for one function: named nodes in insertion order plus
/// channel-indexed edges. Pure structure and validation; all resolution
/// logic lives in the resolver.
#[derive(Debug, Clone, Default)]
pub struct CircuitGraph {
    nodes: IndexMap<String, NodeKind>,
    edges: Vec<Edge>,
}

impl CircuitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert by name: re-adding a node updates its kind and attributes.
    /// Reservoir nodes are the exception and may never be silently retyped.
    fn upsert(&mut self, name: &str, kind: NodeKind) -> Result<()> {
        if let Some(existing) = self.nodes.get(name) {
            if matches!(existing, NodeKind::Reservoir { .. })
                && !matches!(kind, NodeKind::Reservoir { .. })
            {
                return Err(Error::MalformedGraph(format!(
                    "reservoir node `{name}` cannot be retyped to {}",
                    kind.label()
                )));
            }
        }
        self.nodes.insert(name.to_string(), kind);
        Ok(())
    }

    pub fn add_input(&mut self, name: &str, value: Option<f64>) -> Result<()> {
        self.upsert(name, NodeKind::Input { value })
    }

    pub fn add_var(&mut self, name: &str) -> Result<()> {
        self.upsert(name, NodeKind::Var)
    }

    pub fn add_reservoir(&mut self, name: &str, reservoir: Option<Reservoir>) -> Result<()> {
        self.upsert(name, NodeKind::Reservoir { reservoir })
    }

    /// Declares a terminal sink. Adding an output over an existing var
    /// promotes it to a return node; over an existing input, a separate
    /// `<name>_out` sink is created. Returns the node name actually used.
    pub fn add_output(&mut self, name: &str) -> Result<String> {
        match self.nodes.get(name) {
            Some(NodeKind::Var) => {
                self.make_return(name)?;
                Ok(name.to_string())
            }
            Some(NodeKind::Input { .. }) => {
                let renamed = format!("{name}_out");
                self.upsert(&renamed, NodeKind::Output)?;
                Ok(renamed)
            }
            Some(NodeKind::Reservoir { .. }) => Err(Error::MalformedGraph(format!(
                "reservoir node `{name}` cannot be retyped to output"
            ))),
            _ => {
                self.upsert(name, NodeKind::Output)?;
                Ok(name.to_string())
            }
        }
    }

    /// Promotes an existing non-reservoir node with no outgoing edges to a
    /// return node.
    pub fn make_return(&mut self, name: &str) -> Result<()> {
        match self.nodes.get(name) {
            None => {
                return Err(Error::MalformedGraph(format!(
                    "cannot make missing node `{name}` a return"
                )))
            }
            Some(NodeKind::Reservoir { .. }) => {
                return Err(Error::MalformedGraph(format!(
                    "reservoir node `{name}` cannot be retyped to return"
                )))
            }
            Some(_) => {}
        }
        if self.out_degree(name) != 0 {
            return Err(Error::MalformedGraph(format!(
                "node `{name}` has outgoing edges and cannot become a return"
            )));
        }
        self.nodes.insert(name.to_string(), NodeKind::Return);
        Ok(())
    }

    /// Adds an edge. Both endpoints must exist; `output_idx` is required
    /// exactly when the source is a reservoir, `input_idx` exactly when the
    /// target is one. Indices attached to non-reservoir endpoints are
    /// discarded.
    pub fn add_edge(
        &mut self,
        source: &str,
        target: &str,
        output_idx: Option<usize>,
        input_idx: Option<usize>,
    ) -> Result<()> {
        let src_kind = self.nodes.get(source).ok_or_else(|| {
            Error::MalformedGraph(format!("edge source node `{source}` does not exist"))
        })?;
        let dst_kind = self.nodes.get(target).ok_or_else(|| {
            Error::MalformedGraph(format!("edge target node `{target}` does not exist"))
        })?;

        let output_idx = if matches!(src_kind, NodeKind::Reservoir { .. }) {
            if output_idx.is_none() {
                return Err(Error::MalformedGraph(format!(
                    "edge `{source}` -> `{target}` needs an output index on its reservoir source"
                )));
            }
            output_idx
        } else {
            None
        };
        let input_idx = if matches!(dst_kind, NodeKind::Reservoir { .. }) {
            if input_idx.is_none() {
                return Err(Error::MalformedGraph(format!(
                    "edge `{source}` -> `{target}` needs an input index on its reservoir target"
                )));
            }
            input_idx
        } else {
            None
        };

        self.edges.push(Edge {
            source: source.to_string(),
            target: target.to_string(),
            output_idx,
            input_idx,
        });
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&NodeKind> {
        self.nodes.get(name)
    }

    pub(crate) fn node_mut(&mut self, name: &str) -> Option<&mut NodeKind> {
        self.nodes.get_mut(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&String, &NodeKind)> {
        self.nodes.iter()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn in_edges<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.target == name)
    }

    pub fn out_edges<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.source == name)
    }

    fn in_degree(&self, name: &str) -> usize {
        self.in_edges(name).count()
    }

    fn out_degree(&self, name: &str) -> usize {
        self.out_edges(name).count()
    }

    /// Binds a reservoir into an existing reservoir node.
    pub fn bind_reservoir(&mut self, name: &str, reservoir: Reservoir) -> Result<()> {
        match self.nodes.get_mut(name) {
            Some(NodeKind::Reservoir { reservoir: slot }) => {
                *slot = Some(reservoir);
                Ok(())
            }
            Some(_) => Err(Error::MalformedGraph(format!(
                "cannot bind a reservoir into non-reservoir node `{name}`"
            ))),
            None => Err(Error::MalformedGraph(format!(
                "cannot bind a reservoir into missing node `{name}`"
            ))),
        }
    }

    /// The producing reservoir of a var node: exactly one predecessor,
    /// which must be a reservoir edge carrying an output index.
    pub fn var_source<'a>(&'a self, name: &'a str) -> Result<(&'a str, usize)> {
        let mut producers = self.in_edges(name);
        let edge = producers.next().ok_or_else(|| {
            Error::MalformedGraph(format!("var `{name}` has no source, expected exactly one"))
        })?;
        if producers.next().is_some() {
            return Err(Error::MalformedGraph(format!(
                "var `{name}` has more than one source"
            )));
        }
        match edge.output_idx {
            Some(idx) => Ok((edge.source.as_str(), idx)),
            None => Err(Error::MalformedGraph(format!(
                "var `{name}` is not produced by a reservoir output"
            ))),
        }
    }

    /// The consuming reservoir of a var node: exactly one successor,
    /// which must be a reservoir edge carrying an input index.
    pub fn var_target<'a>(&'a self, name: &'a str) -> Result<(&'a str, usize)> {
        let mut consumers = self.out_edges(name);
        let edge = consumers.next().ok_or_else(|| {
            Error::MalformedGraph(format!("var `{name}` has no target, expected exactly one"))
        })?;
        if consumers.next().is_some() {
            return Err(Error::MalformedGraph(format!(
                "var `{name}` has more than one target"
            )));
        }
        match edge.input_idx {
            Some(idx) => Ok((edge.target.as_str(), idx)),
            None => Err(Error::MalformedGraph(format!(
                "var `{name}` is not consumed by a reservoir input"
            ))),
        }
    }

    /// Whole-graph invariant check, run before resolution:
    /// * var nodes have at most one producer and one consumer;
    /// * output/return nodes have no outgoing edges;
    /// * each reservoir node's connected input indices are gapless from 0,
    ///   without duplicates; likewise its output indices.
    pub fn validate(&self) -> Result<()> {
        for (name, kind) in &self.nodes {
            match kind {
                NodeKind::Var => {
                    if self.in_degree(name) > 1 {
                        return Err(Error::MalformedGraph(format!(
                            "var `{name}` has more than one source"
                        )));
                    }
                    if self.out_degree(name) > 1 {
                        return Err(Error::MalformedGraph(format!(
                            "var `{name}` has more than one target"
                        )));
                    }
                }
                NodeKind::Output | NodeKind::Return => {
                    if self.out_degree(name) != 0 {
                        return Err(Error::MalformedGraph(format!(
                            "sink node `{name}` has outgoing edges"
                        )));
                    }
                }
                NodeKind::Reservoir { .. } => {
                    let inputs: Vec<usize> =
                        self.in_edges(name).filter_map(|e| e.input_idx).collect();
                    check_gapless(name, "input", &inputs)?;
                    let outputs: Vec<usize> =
                        self.out_edges(name).filter_map(|e| e.output_idx).collect();
                    check_gapless(name, "output", &outputs)?;
                }
                NodeKind::Input { .. } => {}
            }
        }
        Ok(())
    }
}

fn check_gapless(node: &str, what: &str, indices: &[usize]) -> Result<()> {
    let mut sorted = indices.to_vec();
    sorted.sort_unstable();
    for (expected, idx) in sorted.iter().enumerate() {
        if *idx != expected {
            return Err(Error::MalformedGraph(format!(
                "reservoir `{node}` {what} indices {indices:?} are not gapless from 0"
            )));
        }
    }
    Ok(())
}
