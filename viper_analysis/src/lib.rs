//! Control-flow and call-graph analyses over Viper IL modules (§4.E,
//! component C5): per-function CFG queries and a module-wide call
//! graph with strongly-connected-component detection.

mod callgraph;
mod cfg;

pub use callgraph::CallGraph;
pub use cfg::{CfgContext, Dominators};
