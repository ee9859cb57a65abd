use crate::error::{Error, Result};
use crate::graph::CircuitGraph;
use crate::reservoir::Reservoir;
use crate::resolver::Resolver;

/// One output-to-input transfer between two reservoirs in a circuit.
/// Channel indices are 0-based, like everywhere else in this crate.
#[derive(Debug, Clone, Copy)]
pub struct Connection {
    pub source: usize,
    pub output: usize,
    pub target: usize,
    pub input: usize,
}

/// Direct wiring surface: a list of reservoirs plus explicit channel
/// connections, linked into a single composite without going through the
/// statement-driven compiler. A thin adapter over the graph resolver, so
/// both surfaces share one composition engine.
#[derive(Debug, Clone, Default)]
pub struct Circuit {
    reservoirs: Vec<Reservoir>,
    connections: Vec<Connection>,
}

impl Circuit {
    pub fn new(reservoirs: Vec<Reservoir>) -> Self {
        Self {
            reservoirs,
            connections: Vec::new(),
        }
    }

    pub fn push(&mut self, reservoir: Reservoir) -> usize {
        self.reservoirs.push(reservoir);
        self.reservoirs.len() - 1
    }

    /// Routes `output` of reservoir `source` into `input` of reservoir
    /// `target`. Reservoir indices are validated here; channel indices are
    /// validated at link time against the actual matrix shapes.
    pub fn connect(&mut self, source: usize, output: usize, target: usize, input: usize) -> Result<()> {
        let count = self.reservoirs.len();
        if source >= count {
            return Err(Error::dims("connection source reservoir index", count, source));
        }
        if target >= count {
            return Err(Error::dims("connection target reservoir index", count, target));
        }
        self.connections.push(Connection {
            source,
            output,
            target,
            input,
        });
        Ok(())
    }

    /// Links the circuit into a single composite reservoir.
    pub fn link(self) -> Result<Reservoir> {
        let mut graph = CircuitGraph::new();
        let names: Vec<String> = (0..self.reservoirs.len())
            .map(|i| format!("res{i}"))
            .collect();
        for (name, res) in names.iter().zip(self.reservoirs) {
            graph.add_reservoir(name, Some(res.copy_detached()))?;
        }
        for (j, conn) in self.connections.iter().enumerate() {
            let link = format!("link{j}");
            graph.add_var(&link)?;
            graph.add_edge(&names[conn.source], &link, Some(conn.output), None)?;
            graph.add_edge(&link, &names[conn.target], None, Some(conn.input))?;
        }
        Resolver::new(graph).resolve()
    }
}
