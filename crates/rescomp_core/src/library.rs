use indexmap::IndexMap;

use crate::error::Result;
use crate::presets::PresetStore;
use crate::reservoir::Reservoir;

/// A preset-backed library entry: slot name plus declared arity.
#[derive(Debug, Clone)]
pub struct LibraryEntry {
    pub slot: String,
    pub inputs: usize,
    pub outputs: usize,
}

/// Maps opcode names to prebuilt reservoirs, either registered inline or
/// loaded on demand from a preset store. Lookups always hand out detached
/// copies: the linker mutates bound reservoirs in place, so an entry must
/// never be aliased into a graph.
#[derive(Debug, Clone)]
pub struct OpcodeLibrary {
    store: PresetStore,
    entries: IndexMap<String, LibraryEntry>,
    inline: IndexMap<String, Reservoir>,
}

impl OpcodeLibrary {
    pub fn new(store: PresetStore) -> Self {
        Self {
            store,
            entries: IndexMap::new(),
            inline: IndexMap::new(),
        }
    }

    /// The standard registry: logic gates, fanout, and the autonomous
    /// attractor presets shipped with the stock store.
    pub fn standard(store: PresetStore) -> Self {
        let mut lib = Self::new(store);
        lib.register_preset("nand", "nand", 2, 1);
        lib.register_preset("nor", "nor", 2, 1);
        lib.register_preset("and", "and", 2, 1);
        lib.register_preset("not", "not", 1, 1);
        lib.register_preset("fan", "fan", 1, 2);
        lib.register_preset("lorenz", "lorenz", 0, 3);
        lib.register_preset("rotate90", "rotation90", 3, 3);
        lib
    }

    /// Registers a preset-backed opcode with its declared arity.
    pub fn register_preset(&mut self, opcode: &str, slot: &str, inputs: usize, outputs: usize) {
        self.entries.insert(
            opcode.to_string(),
            LibraryEntry {
                slot: slot.to_string(),
                inputs,
                outputs,
            },
        );
    }

    /// Registers a ready reservoir directly, shadowing any preset entry of
    /// the same name.
    pub fn register(&mut self, opcode: &str, reservoir: Reservoir) {
        self.inline.insert(opcode.to_string(), reservoir);
    }

    pub fn contains(&self, opcode: &str) -> bool {
        self.inline.contains_key(opcode) || self.entries.contains_key(opcode)
    }

    /// Declared (input, output) arity, when known without touching disk.
    pub fn arity(&self, opcode: &str) -> Option<(usize, usize)> {
        if let Some(res) = self.inline.get(opcode) {
            return Some((res.input_dim(), res.output_dim()));
        }
        self.entries.get(opcode).map(|e| (e.inputs, e.outputs))
    }

    /// Fetches a private copy of the opcode's reservoir, or `None` when the
    /// opcode is not registered. A registered preset whose slot is missing
    /// from the store is a hard error.
    pub fn lookup(&self, opcode: &str) -> Result<Option<Reservoir>> {
        if let Some(res) = self.inline.get(opcode) {
            return Ok(Some(res.copy_detached()));
        }
        match self.entries.get(opcode) {
            Some(entry) => Ok(Some(self.store.load(&entry.slot)?)),
            None => Ok(None),
        }
    }
}
