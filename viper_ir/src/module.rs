//! IR module system (§3 "Module").

use std::fmt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::function::Function;
use crate::types::Type;

/// An externally-defined callable the module may invoke but does not
/// define; the runtime helper ABI (§4.I) is reached entirely through
/// externs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extern {
    pub name: String,
    pub return_type: Type,
    pub param_types: Vec<Type>,
}

impl Extern {
    pub fn new(name: impl Into<String>, return_type: Type, param_types: Vec<Type>) -> Self {
        Self { name: name.into(), return_type, param_types }
    }
}

impl fmt::Display for Extern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "extern @{}(", self.name)?;
        for (i, ty) in self.param_types.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", ty)?;
        }
        write!(f, ") -> {}", self.return_type)
    }
}

/// An immutable module-level string payload (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Global {
    pub name: String,
    pub data: String,
}

impl Global {
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self { name: name.into(), data: data.into() }
    }
}

impl fmt::Display for Global {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "global const str @{} = \"{}\"", self.name, self.data.escape_default())
    }
}

/// A module: ordered externs, globals, and functions (§3). Functions are
/// kept in an `IndexMap` so iteration order matches declaration order —
/// the printer (§4.C) depends on stable ordering for round-tripping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Module {
    pub externs: Vec<Extern>,
    pub globals: Vec<Global>,
    pub functions: IndexMap<String, Function>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_extern(&mut self, ext: Extern) {
        self.externs.push(ext);
    }

    pub fn add_global(&mut self, global: Global) {
        self.globals.push(global);
    }

    pub fn add_function(&mut self, func: Function) {
        self.functions.insert(func.name.clone(), func);
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.get_mut(name)
    }

    pub fn extern_by_name(&self, name: &str) -> Option<&Extern> {
        self.externs.iter().find(|e| e.name == name)
    }

    pub fn global_by_name(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    /// Returns the declared signature of `name`, whether it is a module
    /// function or an extern — used by the verifier for direct-call
    /// checking (§3 invariant 5).
    pub fn callee_signature(&self, name: &str) -> Option<(Type, Vec<Type>)> {
        if let Some(func) = self.function(name) {
            return Some((func.return_type, func.params.iter().map(|p| p.ty).collect()));
        }
        self.extern_by_name(name)
            .map(|e| (e.return_type, e.param_types.clone()))
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "il 0.1.0")?;
        for ext in &self.externs {
            writeln!(f, "{}", ext)?;
        }
        for global in &self.globals {
            writeln!(f, "{}", global)?;
        }
        for func in self.functions.values() {
            writeln!(f)?;
            write!(f, "{}", func)?;
        }
        Ok(())
    }
}
