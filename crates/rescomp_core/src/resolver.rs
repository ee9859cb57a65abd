use std::collections::HashMap;

use indexmap::IndexMap;
use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::{CircuitGraph, NodeKind};
use crate::reservoir::Reservoir;

/// Integration step size assigned to every linked composite.
pub const COMPOSITE_TIMESCALE: f64 = 0.001;
/// Rate constant assigned to every linked composite.
pub const COMPOSITE_GAMMA: f64 = 100.0;

/// Collapses one fully-bound circuit graph into a single reservoir.
///
/// The graph is consumed: bound reservoirs are marked up in place while the
/// fold plan is computed, then the composite matrices are materialized in
/// one pass (no incremental row/column deletion).
pub struct Resolver {
    graph: CircuitGraph,
}

/// One surviving external input column of the composite, pre-assembly.
struct InputChannel {
    column: DVector<f64>,
    x0: f64,
    name: Option<String>,
    constant: Option<f64>,
}

impl Resolver {
    pub fn new(graph: CircuitGraph) -> Self {
        Self { graph }
    }

    pub fn resolve(mut self) -> Result<Reservoir> {
        self.graph.validate()?;
        let (layout, total) = self.layout()?;
        let mut a = self.composite_adjacency(&layout, total)?;
        self.fold_connections(&mut a, &layout)?;
        self.assemble(a, &layout)
    }

    /// Assigns each reservoir node a contiguous block of the composite
    /// state space, in node insertion order. Returns the offsets and the
    /// total composite dimension.
    fn layout(&self) -> Result<(IndexMap<String, usize>, usize)> {
        let mut offsets = IndexMap::new();
        let mut offset = 0;
        for (name, kind) in self.graph.nodes() {
            if let NodeKind::Reservoir { reservoir } = kind {
                let res = reservoir.as_ref().ok_or_else(|| {
                    Error::MalformedGraph(format!("reservoir node `{name}` is unbound"))
                })?;
                debug!(node = %name, offset, dim = res.latent_dim(), "placing reservoir block");
                offsets.insert(name.clone(), offset);
                offset += res.latent_dim();
            }
        }
        if offsets.is_empty() {
            return Err(Error::MalformedGraph(
                "graph contains no reservoir nodes".into(),
            ));
        }
        Ok((offsets, offset))
    }

    fn composite_adjacency(
        &self,
        layout: &IndexMap<String, usize>,
        total: usize,
    ) -> Result<DMatrix<f64>> {
        let mut a = DMatrix::zeros(total, total);
        for (name, offset) in layout {
            let res = self.bound(name)?;
            let n = res.latent_dim();
            a.view_mut((*offset, *offset), (n, n)).copy_from(res.a());
        }
        Ok(a)
    }

    /// Replaces every var-mediated output->input transfer with an additive
    /// outer-product coupling in the composite adjacency, marking the
    /// source output row and target input column as used.
    fn fold_connections(
        &mut self,
        a: &mut DMatrix<f64>,
        layout: &IndexMap<String, usize>,
    ) -> Result<()> {
        let vars: Vec<String> = self
            .graph
            .nodes()
            .filter(|(_, kind)| matches!(kind, NodeKind::Var))
            .map(|(name, _)| name.clone())
            .collect();

        for var in vars {
            let (src, out_idx) = {
                let (s, i) = self.graph.var_source(&var)?;
                (s.to_string(), i)
            };
            let (dst, in_idx) = {
                let (t, i) = self.graph.var_target(&var)?;
                (t.to_string(), i)
            };
            debug!(%var, %src, %dst, out_idx, in_idx, "folding connection");

            let w_row = {
                let res = self.bound(&src)?;
                if res.used_outputs.contains(&out_idx) {
                    return Err(Error::ConnectionIndex {
                        src: src.clone(),
                        target: dst.clone(),
                        detail: format!(
                            "output {out_idx} of `{src}` already folded (via `{var}`)"
                        ),
                    });
                }
                match res.readout() {
                    Some(w) if out_idx < w.nrows() => w.row(out_idx).transpose(),
                    _ => {
                        return Err(Error::ConnectionIndex {
                            src: src.clone(),
                            target: dst.clone(),
                            detail: format!(
                                "output {out_idx} out of range for `{src}` with {} outputs (via `{var}`)",
                                self.bound(&src)?.output_dim()
                            ),
                        })
                    }
                }
            };
            let b_col = {
                let res = self.bound(&dst)?;
                if res.used_inputs.contains(&in_idx) {
                    return Err(Error::ConnectionIndex {
                        src: src.clone(),
                        target: dst.clone(),
                        detail: format!(
                            "input {in_idx} of `{dst}` already folded (via `{var}`)"
                        ),
                    });
                }
                if in_idx >= res.input_dim() {
                    return Err(Error::ConnectionIndex {
                        src: src.clone(),
                        target: dst.clone(),
                        detail: format!(
                            "input {in_idx} out of range for `{dst}` with {} inputs (via `{var}`)",
                            res.input_dim()
                        ),
                    });
                }
                res.b().column(in_idx).clone_owned()
            };

            // a[dst_block, src_block] += b_col (x) w_row
            let src_off = layout[&src];
            let dst_off = layout[&dst];
            for (i, bv) in b_col.iter().enumerate() {
                for (j, wv) in w_row.iter().enumerate() {
                    a[(dst_off + i, src_off + j)] += bv * wv;
                }
            }

            self.mark_output_used(&src, out_idx);
            self.mark_input_used(&dst, in_idx);
        }
        Ok(())
    }

    /// Materializes the composite `B`, `W`, `x_init`, `r_init`, `d`, and
    /// name lists in layout order, skipping folded channels; then prunes
    /// dead inputs and folds compile-time constants into the bias.
    fn assemble(self, a: DMatrix<f64>, layout: &IndexMap<String, usize>) -> Result<Reservoir> {
        let n_total = a.nrows();

        // Channel naming comes from the graph wiring: the node feeding a
        // reservoir input names that composite column, the node receiving a
        // reservoir output names that composite row.
        let mut in_names: HashMap<(String, usize), String> = HashMap::new();
        let mut in_consts: HashMap<(String, usize), f64> = HashMap::new();
        let mut out_names: HashMap<(String, usize), String> = HashMap::new();
        for edge in self.graph.edges() {
            if let Some(i) = edge.input_idx {
                in_names.insert((edge.target.clone(), i), edge.source.clone());
                if let Some(NodeKind::Input { value: Some(v) }) = self.graph.node(&edge.source) {
                    in_consts.insert((edge.target.clone(), i), *v);
                }
            }
            if let Some(i) = edge.output_idx {
                out_names.insert((edge.source.clone(), i), edge.target.clone());
            }
        }

        let mut channels: Vec<InputChannel> = Vec::new();
        let mut readouts: Vec<(usize, DVector<f64>, String)> = Vec::new();
        let mut r_parts: Vec<f64> = Vec::with_capacity(n_total);
        let mut d_parts: Vec<f64> = Vec::with_capacity(n_total);

        for (node, offset) in layout {
            let res = self.bound(node)?;
            let n_i = res.latent_dim();

            let mut survivors = 0;
            for i in 0..res.input_dim() {
                if res.used_inputs.contains(&i) {
                    continue;
                }
                survivors += 1;
                let mut column = DVector::zeros(n_total);
                column.rows_mut(*offset, n_i).copy_from(&res.b().column(i));
                let name = in_names
                    .get(&(node.clone(), i))
                    .cloned()
                    .or_else(|| res.input_names().get(i).cloned())
                    .unwrap_or_else(|| format!("{node}_in{i}"));
                channels.push(InputChannel {
                    column,
                    x0: res.x_init()[i],
                    name: Some(name),
                    constant: in_consts.get(&(node.clone(), i)).copied(),
                });
            }
            if survivors == 0 && res.input_dim() > 0 {
                // Every input folded: a zeroed placeholder keeps the block
                // well-shaped until pruning.
                channels.push(InputChannel {
                    column: DVector::zeros(n_total),
                    x0: 0.0,
                    name: None,
                    constant: None,
                });
            }

            if let Some(w) = res.readout() {
                for i in 0..w.nrows() {
                    if res.used_outputs.contains(&i) {
                        continue;
                    }
                    let name = out_names
                        .get(&(node.clone(), i))
                        .cloned()
                        .or_else(|| res.output_names().get(i).cloned())
                        .unwrap_or_else(|| format!("{node}_out{i}"));
                    readouts.push((*offset, w.row(i).transpose(), name));
                }
            }

            r_parts.extend(res.r_init().iter());
            d_parts.extend(res.bias().iter());
        }

        let mut d = DVector::from_vec(d_parts);

        // Dead-input pruning: drop all-zero columns (placeholders included).
        let mut live: Vec<InputChannel> = Vec::new();
        for ch in channels {
            if ch.column.iter().all(|v| *v == 0.0) {
                debug!(name = ?ch.name, "pruning dead input column");
                continue;
            }
            live.push(ch);
        }

        // Constant folding: a compile-time-bound input becomes a bias term
        // and disappears from the runtime input surface.
        let mut runtime: Vec<InputChannel> = Vec::new();
        for ch in live {
            if let Some(v) = ch.constant {
                debug!(name = ?ch.name, value = v, "folding constant input into bias");
                d.axpy(v, &ch.column, 1.0);
            } else {
                runtime.push(ch);
            }
        }

        // Width floor: never let B drop below one column; the degenerate
        // inputless state is a single zero column with no name.
        if runtime.is_empty() {
            runtime.push(InputChannel {
                column: DVector::zeros(n_total),
                x0: 0.0,
                name: None,
                constant: None,
            });
        }

        let mut b = DMatrix::zeros(n_total, runtime.len());
        let mut x_init = DVector::zeros(runtime.len());
        let mut input_names = Vec::new();
        for (j, ch) in runtime.iter().enumerate() {
            b.set_column(j, &ch.column);
            x_init[j] = ch.x0;
            if let Some(name) = &ch.name {
                input_names.push(name.clone());
            }
        }

        let mut w = DMatrix::zeros(readouts.len(), n_total);
        let mut output_names = Vec::with_capacity(readouts.len());
        for (j, (offset, row, name)) in readouts.iter().enumerate() {
            for (jj, v) in row.iter().enumerate() {
                w[(j, offset + jj)] = *v;
            }
            output_names.push(name.clone());
        }

        let r_init = DVector::from_vec(r_parts);
        let mut composite = Reservoir::with_bias(
            a,
            b,
            d,
            r_init,
            x_init,
            COMPOSITE_TIMESCALE,
            COMPOSITE_GAMMA,
        )?;
        composite.set_readout(w)?;
        composite.input_names = input_names;
        composite.output_names = output_names;
        Ok(composite)
    }

    fn bound(&self, name: &str) -> Result<&Reservoir> {
        match self.graph.node(name) {
            Some(NodeKind::Reservoir {
                reservoir: Some(res),
            }) => Ok(res),
            Some(NodeKind::Reservoir { reservoir: None }) => Err(Error::MalformedGraph(format!(
                "reservoir node `{name}` is unbound"
            ))),
            _ => Err(Error::MalformedGraph(format!(
                "node `{name}` is not a reservoir"
            ))),
        }
    }

    fn mark_output_used(&mut self, name: &str, idx: usize) {
        if let Some(NodeKind::Reservoir {
            reservoir: Some(res),
        }) = self.graph.node_mut(name)
        {
            res.used_outputs.insert(idx);
        }
    }

    fn mark_input_used(&mut self, name: &str, idx: usize) {
        if let Some(NodeKind::Reservoir {
            reservoir: Some(res),
        }) = self.graph.node_mut(name)
        {
            res.used_inputs.insert(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Resolver;
    use crate::error::{Error, Result};
    use crate::graph::CircuitGraph;
    use crate::reservoir::Reservoir;
    use nalgebra::{DMatrix, DVector};

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    /// 1-in/1-out gate with deterministic, seed-dependent weights.
    fn unit_gate(seed: f64) -> Reservoir {
        let n = 3;
        let a = DMatrix::zeros(n, n);
        let b = DMatrix::from_fn(n, 1, |i, _| 0.02 * ((i as f64) + seed).cos());
        let r_init = DVector::from_fn(n, |i, _| 0.3 * ((i as f64) * seed + 1.0).sin());
        let x_init = DVector::zeros(1);
        let mut res = Reservoir::new(a, b, r_init, x_init, 0.001, 100.0).expect("valid shapes");
        res.set_readout(DMatrix::from_fn(1, n, |_, j| 0.1 * ((j as f64) - seed).sin()))
            .expect("readout fits");
        res
    }

    /// 3-node ring; `var_order` permutes the insertion order of the
    /// connecting var nodes.
    fn ring_graph(var_order: [usize; 3]) -> CircuitGraph {
        let mut g = CircuitGraph::new();
        let gates = ["g1_1", "g2_2", "g3_3"];
        for (i, name) in gates.iter().enumerate() {
            g.add_reservoir(name, Some(unit_gate(i as f64 + 1.0)))
                .expect("reservoir node");
        }
        // v[i] carries gates[i] output 0 into gates[(i + 1) % 3] input 0.
        let vars = ["v1", "v2", "v3"];
        for &i in &var_order {
            g.add_var(vars[i]).expect("var node");
            g.add_edge(gates[i], vars[i], Some(0), None).expect("producer");
            g.add_edge(vars[i], gates[(i + 1) % 3], None, Some(0))
                .expect("consumer");
        }
        g
    }

    #[test]
    fn identity_graph_reproduces_the_reservoir() {
        let mut res = Reservoir::base(5, 2, 0.001, 100.0);
        res.set_readout(DMatrix::from_fn(1, 5, |_, j| 0.1 * (j as f64 + 1.0)))
            .expect("readout fits");

        let mut g = CircuitGraph::new();
        g.add_reservoir("solo_1", Some(res.clone())).expect("node");
        let composite = Resolver::new(g).resolve().expect("identity resolve");

        assert_eq!(composite.a(), res.a());
        assert_eq!(composite.b(), res.b());
        assert_eq!(composite.readout(), res.readout());
        assert_eq!(composite.bias(), res.bias());
        assert_eq!(composite.r_init(), res.r_init());
        assert_eq!(composite.x_init(), res.x_init());
    }

    #[test]
    fn fold_order_does_not_change_the_composite_adjacency() {
        let orders = [[0, 1, 2], [2, 0, 1], [1, 2, 0], [2, 1, 0]];
        let baseline = Resolver::new(ring_graph(orders[0]))
            .resolve()
            .expect("ring resolves");
        for order in &orders[1..] {
            let composite = Resolver::new(ring_graph(*order))
                .resolve()
                .expect("ring resolves");
            assert_eq!(composite.a(), baseline.a());
        }
    }

    #[test]
    fn ring_composite_couples_blocks_by_outer_products() {
        let composite = Resolver::new(ring_graph([0, 1, 2]))
            .resolve()
            .expect("ring resolves");
        assert_eq!(composite.latent_dim(), 9);

        // The g1 -> g2 transfer lands in the (block 1, block 0) section.
        let g1 = unit_gate(1.0);
        let g2 = unit_gate(2.0);
        let expected = g2.b().column(0) * g1.readout().expect("readout").row(0);
        for i in 0..3 {
            for j in 0..3 {
                assert!((composite.a()[(3 + i, j)] - expected[(i, j)]).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn folding_every_input_floors_b_at_one_zero_column() {
        // Two gates feeding each other: every input and output is folded.
        let mut g = CircuitGraph::new();
        g.add_reservoir("fwd_1", Some(unit_gate(1.0))).expect("node");
        g.add_reservoir("bwd_2", Some(unit_gate(2.0))).expect("node");
        g.add_var("u").expect("var");
        g.add_var("v").expect("var");
        g.add_edge("fwd_1", "u", Some(0), None).expect("edge");
        g.add_edge("u", "bwd_2", None, Some(0)).expect("edge");
        g.add_edge("bwd_2", "v", Some(0), None).expect("edge");
        g.add_edge("v", "fwd_1", None, Some(0)).expect("edge");

        let mut composite = Resolver::new(g).resolve().expect("loop resolves");
        assert_eq!(composite.input_dim(), 1);
        assert!(composite.b().iter().all(|v| *v == 0.0));
        assert_eq!(composite.x_init().len(), 1);
        assert_eq!(composite.x_init()[0], 0.0);
        assert!(composite.input_names().is_empty());

        // The degenerate inputless composite still simulates.
        let states = composite.run_states(None, Some(40)).expect("void-input run");
        assert_eq!(states.ncols(), 40);
    }

    #[test]
    fn dead_input_pruning_preserves_the_trajectory() {
        let n = 4;
        let a = DMatrix::from_fn(n, n, |i, j| 0.01 * ((i + 2 * j) as f64).sin());
        let mut b = DMatrix::from_fn(n, 2, |i, _| 0.03 * ((i as f64) + 1.0).cos());
        for i in 0..n {
            b[(i, 0)] = 0.0; // column 0 is intentionally dead
        }
        let r_init = DVector::from_fn(n, |i, _| 0.2 * ((i as f64) + 0.5).sin());
        let x_init = DVector::zeros(2);
        let mut full = Reservoir::new(a, b, r_init, x_init, 0.001, 100.0).expect("valid shapes");
        full.set_readout(DMatrix::from_element(1, n, 1.0)).expect("readout fits");

        let mut g = CircuitGraph::new();
        g.add_reservoir("sys_1", Some(full.clone())).expect("node");
        let mut pruned = Resolver::new(g).resolve().expect("resolves");
        assert_eq!(pruned.input_dim(), 1);

        let steps = 30;
        let live_drive = DMatrix::from_fn(1, steps, |_, t| 0.1 * (t as f64 * 0.2).sin());
        let full_drive = DMatrix::from_fn(2, steps, |i, t| {
            if i == 0 {
                0.0
            } else {
                0.1 * (t as f64 * 0.2).sin()
            }
        });

        let pruned_states = pruned.run_states(Some(&live_drive), None).expect("pruned run");
        let full_states = full.run_states(Some(&full_drive), None).expect("full run");
        for i in 0..n {
            for t in 0..steps {
                assert!((pruned_states[(i, t)] - full_states[(i, t)]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn constant_inputs_fold_into_the_bias() {
        let gate = {
            let n = 4;
            let a = DMatrix::zeros(n, n);
            let b = DMatrix::from_fn(n, 2, |i, j| 0.05 * ((i + j + 1) as f64));
            let r_init = DVector::from_element(n, 0.1);
            let x_init = DVector::zeros(2);
            let mut res = Reservoir::new(a, b, r_init, x_init, 0.001, 100.0).expect("shapes");
            res.set_readout(DMatrix::from_element(1, n, 0.25)).expect("readout fits");
            res
        };
        let b_col = gate.b().column(1).clone_owned();
        let d_gate = gate.bias().clone();

        let mut g = CircuitGraph::new();
        g.add_input("x", None).expect("input");
        g.add_input("half_2", Some(0.5)).expect("constant input");
        g.add_reservoir("gate_1", Some(gate)).expect("node");
        g.add_edge("x", "gate_1", None, Some(0)).expect("edge");
        g.add_edge("half_2", "gate_1", None, Some(1)).expect("edge");
        g.add_var("y").expect("var");
        g.add_edge("gate_1", "y", Some(0), None).expect("edge");
        g.make_return("y").expect("return");

        let composite = Resolver::new(g).resolve().expect("resolves");
        assert_eq!(composite.input_dim(), 1);
        assert_eq!(composite.input_names(), ["x".to_string()]);
        assert_eq!(composite.output_names(), ["y".to_string()]);
        for i in 0..4 {
            let expected = d_gate[i] + b_col[i] * 0.5;
            assert!((composite.bias()[i] - expected).abs() < 1e-15);
        }
    }

    #[test]
    fn out_of_range_channel_indices_are_reported() {
        // Gapless wiring that still overruns the source's single readout
        // row: output 1 of a 1-output gate.
        let wide_sink = {
            let n = 2;
            let a = DMatrix::zeros(n, n);
            let b = DMatrix::from_fn(n, 2, |i, j| 0.1 * ((i + j + 1) as f64));
            let mut res = Reservoir::new(a, b, DVector::zeros(n), DVector::zeros(2), 0.001, 100.0)
                .expect("valid shapes");
            res.set_readout(DMatrix::from_element(1, n, 0.1)).expect("readout fits");
            res
        };

        let mut g = CircuitGraph::new();
        g.add_reservoir("src_1", Some(unit_gate(1.0))).expect("node");
        g.add_reservoir("dst_2", Some(wide_sink)).expect("node");
        g.add_var("u").expect("var");
        g.add_var("v").expect("var");
        g.add_edge("src_1", "u", Some(0), None).expect("edge");
        g.add_edge("u", "dst_2", None, Some(0)).expect("edge");
        g.add_edge("src_1", "v", Some(1), None).expect("edge");
        g.add_edge("v", "dst_2", None, Some(1)).expect("edge");

        let result = Resolver::new(g).resolve();
        assert!(matches!(&result, Err(Error::ConnectionIndex { .. })));
        assert_err_contains(result, "out of range");
    }

    #[test]
    fn unbound_reservoir_nodes_block_resolution() {
        let mut g = CircuitGraph::new();
        g.add_reservoir("gate_1", None).expect("node");
        assert_err_contains(Resolver::new(g).resolve(), "is unbound");
    }
}
