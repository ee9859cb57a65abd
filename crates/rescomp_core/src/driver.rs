use std::collections::HashMap;

use indexmap::IndexMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::{CircuitGraph, NodeKind};
use crate::lang::{Arg, CallExpr, FunctionDef, Program, Stmt, Value};
use crate::library::OpcodeLibrary;
use crate::reservoir::Reservoir;
use crate::resolver::Resolver;

/// Per-function compilation record: the wiring graph plus declared channel
/// names, and the linked reservoir once resolution succeeds.
#[derive(Debug)]
pub struct FunctionRecord {
    pub graph: CircuitGraph,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub reservoir: Option<Reservoir>,
}

/// The compilation context: owns the opcode library and the function table
/// for one compile invocation. Builds one circuit graph per declared
/// function, then runs a bounded fixed-point loop binding opcodes and
/// resolving functions until the entry point is linked or no progress
/// remains.
pub struct Compiler {
    library: OpcodeLibrary,
    functions: IndexMap<String, FunctionRecord>,
    uid: usize,
}

impl Compiler {
    pub fn new(library: OpcodeLibrary) -> Self {
        Self {
            library,
            functions: IndexMap::new(),
            uid: 0,
        }
    }

    pub fn library_mut(&mut self) -> &mut OpcodeLibrary {
        &mut self.library
    }

    /// A resolved function's reservoir, if compilation produced one.
    pub fn function(&self, name: &str) -> Option<&Reservoir> {
        self.functions.get(name).and_then(|r| r.reservoir.as_ref())
    }

    /// Compiles `program` and returns a detached copy of the entry
    /// function's reservoir.
    pub fn compile(&mut self, program: &Program, entry: &str) -> Result<Reservoir> {
        for def in &program.functions {
            let record = self.build_function(def)?;
            record.graph.validate()?;
            self.functions.insert(def.name.clone(), record);
        }

        self.run_fixed_point(entry)?;

        match self.functions.get(entry) {
            Some(FunctionRecord {
                reservoir: Some(res),
                ..
            }) => Ok(res.copy_detached()),
            Some(_) => {
                if let Some((function, opcode)) = self.find_unknown_opcode() {
                    return Err(Error::UnknownOpcode { opcode, function });
                }
                Err(Error::Compile {
                    entry: entry.to_string(),
                    blocked: self.blocked_functions(),
                })
            }
            None => Err(Error::Compile {
                entry: entry.to_string(),
                blocked: self.blocked_functions(),
            }),
        }
    }

    /// Lowers one function body into its circuit graph.
    fn build_function(&mut self, def: &FunctionDef) -> Result<FunctionRecord> {
        let mut graph = CircuitGraph::new();
        let inputs = def.params.clone();
        let mut outputs = Vec::new();
        let mut aliases: HashMap<String, String> = HashMap::new();

        for param in &def.params {
            graph.add_input(param, None)?;
        }

        for stmt in &def.body {
            match stmt {
                Stmt::Assign { targets, value } => match value {
                    Value::Call(call) => {
                        self.lower_call(&mut graph, &aliases, def, targets, call)?;
                    }
                    Value::Const(v) => {
                        // A constant-bound name is an input node whose
                        // channel vanishes at link time.
                        let target = single_target(def, targets)?;
                        graph.add_input(target, Some(*v))?;
                    }
                    Value::Var(source) => {
                        let target = single_target(def, targets)?;
                        let resolved = resolve_alias(&aliases, source).to_string();
                        if graph.node(&resolved).is_none() {
                            return Err(Error::MalformedGraph(format!(
                                "function `{}` aliases undefined symbol `{source}`",
                                def.name
                            )));
                        }
                        aliases.insert(target.clone(), resolved);
                    }
                },
                Stmt::Return { values } => {
                    for name in values {
                        let resolved = resolve_alias(&aliases, name).to_string();
                        if graph.node(&resolved).is_none() {
                            return Err(Error::MalformedGraph(format!(
                                "function `{}` returns undefined symbol `{name}`",
                                def.name
                            )));
                        }
                        graph.add_output(&resolved)?;
                        outputs.push(name.clone());
                    }
                }
            }
        }

        Ok(FunctionRecord {
            graph,
            inputs,
            outputs,
            reservoir: None,
        })
    }

    fn lower_call(
        &mut self,
        graph: &mut CircuitGraph,
        aliases: &HashMap<String, String>,
        def: &FunctionDef,
        targets: &[String],
        call: &CallExpr,
    ) -> Result<()> {
        if let Some((in_arity, out_arity)) = self.library.arity(&call.callee) {
            if call.args.len() != in_arity {
                return Err(Error::dims(
                    format!("call to `{}` in `{}`", call.callee, def.name),
                    in_arity,
                    call.args.len(),
                ));
            }
            if targets.len() != out_arity {
                return Err(Error::dims(
                    format!("binding results of `{}` in `{}`", call.callee, def.name),
                    out_arity,
                    targets.len(),
                ));
            }
        }

        let instance = self.fresh_instance(&call.callee);
        graph.add_reservoir(&instance, None)?;

        for (i, arg) in call.args.iter().enumerate() {
            match arg {
                Arg::Var(name) => {
                    let resolved = resolve_alias(aliases, name).to_string();
                    if graph.node(&resolved).is_none() {
                        return Err(Error::MalformedGraph(format!(
                            "function `{}` passes undefined symbol `{name}` to `{}`",
                            def.name, call.callee
                        )));
                    }
                    graph.add_edge(&resolved, &instance, None, Some(i))?;
                }
                Arg::Const(v) => {
                    let constant = self.fresh_instance(&format!("{v}"));
                    graph.add_input(&constant, Some(*v))?;
                    graph.add_edge(&constant, &instance, None, Some(i))?;
                }
            }
        }

        for (i, target) in targets.iter().enumerate() {
            graph.add_var(target)?;
            graph.add_edge(&instance, target, Some(i), None)?;
        }
        Ok(())
    }

    /// The fixed-point resolution loop. Each pass binds every opcode it can
    /// (library first, then already-resolved functions) and links every
    /// function whose graph is fully bound; a pass without progress ends
    /// the loop. The pass count is capped defensively.
    fn run_fixed_point(&mut self, entry: &str) -> Result<()> {
        let node_total: usize = self
            .functions
            .values()
            .map(|rec| {
                rec.graph
                    .nodes()
                    .filter(|(_, kind)| matches!(kind, NodeKind::Reservoir { .. }))
                    .count()
            })
            .sum();
        let max_passes = node_total + self.functions.len() + 2;

        for pass in 1usize.. {
            if pass > max_passes {
                return Err(Error::Compile {
                    entry: entry.to_string(),
                    blocked: self.blocked_functions(),
                });
            }

            let mut pending: Vec<(String, String, Reservoir)> = Vec::new();
            let mut ready: Vec<String> = Vec::new();

            for (fname, record) in &self.functions {
                if record.reservoir.is_some() {
                    continue;
                }
                let mut unresolved = 0;
                for (node_name, kind) in record.graph.nodes() {
                    if !matches!(kind, NodeKind::Reservoir { reservoir: None }) {
                        continue;
                    }
                    let opcode = strip_instance_suffix(node_name);
                    if let Some(res) = self.library.lookup(opcode)? {
                        pending.push((fname.clone(), node_name.clone(), res));
                    } else if let Some(other) = self.functions.get(opcode) {
                        match &other.reservoir {
                            Some(res) => {
                                pending.push((fname.clone(), node_name.clone(), res.copy_detached()));
                            }
                            None => unresolved += 1,
                        }
                    } else {
                        unresolved += 1;
                    }
                }
                if unresolved == 0 {
                    ready.push(fname.clone());
                }
            }

            let mut progressed = false;
            for (fname, node, res) in pending {
                debug!(function = %fname, %node, "binding opcode");
                if let Some(record) = self.functions.get_mut(&fname) {
                    record.graph.bind_reservoir(&node, res)?;
                    progressed = true;
                }
            }
            for fname in ready {
                let record = match self.functions.get_mut(&fname) {
                    Some(record) if record.reservoir.is_none() => record,
                    _ => continue,
                };
                debug!(function = %fname, pass, "linking function");
                let graph = std::mem::take(&mut record.graph);
                let mut res = Resolver::new(graph).resolve()?;
                res.input_names = record.inputs.clone();
                res.output_names = record.outputs.clone();
                record.reservoir = Some(res);
                progressed = true;
            }

            if !progressed {
                break;
            }
        }
        Ok(())
    }

    fn blocked_functions(&self) -> Vec<String> {
        self.functions
            .iter()
            .filter(|(_, rec)| rec.reservoir.is_none())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// After the fixed point stabilizes: the first unbound node whose
    /// opcode exists in neither the library nor the function table.
    fn find_unknown_opcode(&self) -> Option<(String, String)> {
        for (fname, record) in &self.functions {
            if record.reservoir.is_some() {
                continue;
            }
            for (node_name, kind) in record.graph.nodes() {
                if !matches!(kind, NodeKind::Reservoir { reservoir: None }) {
                    continue;
                }
                let opcode = strip_instance_suffix(node_name);
                if !self.library.contains(opcode) && !self.functions.contains_key(opcode) {
                    return Some((fname.clone(), opcode.to_string()));
                }
            }
        }
        None
    }

    fn fresh_instance(&mut self, name: &str) -> String {
        self.uid += 1;
        format!("{name}_{}", self.uid)
    }
}

fn single_target<'a>(def: &FunctionDef, targets: &'a [String]) -> Result<&'a String> {
    match targets {
        [single] => Ok(single),
        _ => Err(Error::dims(
            format!("scalar assignment targets in `{}`", def.name),
            1,
            targets.len(),
        )),
    }
}

fn resolve_alias<'a>(aliases: &'a HashMap<String, String>, name: &'a str) -> &'a str {
    let mut current = name;
    while let Some(next) = aliases.get(current) {
        current = next;
    }
    current
}

/// Drops a trailing `_<digits>` instance tag, recovering the opcode name a
/// reservoir node was minted from.
fn strip_instance_suffix(name: &str) -> &str {
    match name.rsplit_once('_') {
        Some((stem, suffix))
            if !stem.is_empty()
                && !suffix.is_empty()
                && suffix.bytes().all(|b| b.is_ascii_digit()) =>
        {
            stem
        }
        _ => name,
    }
}
