//! Optimization passes and pass manager over Viper IL modules (§4.F,
//! §4.G, components C6 and C7): SCCP, Mem2Reg+SROA, Peephole, the
//! direct-call inliner, SimplifyCFG, DCE, and the `O0`/`O1`/`O2`
//! pipelines that sequence them.

mod dce;
mod inliner;
mod mem2reg;
mod pass_manager;
mod peephole;
mod sccp;
mod simplify_cfg;
mod stats;
mod support;

pub use inliner::InlinerConfig;
pub use pass_manager::{OptimizationResult, PassManager};
pub use stats::{OptimizationStats, PreservedAnalyses};

pub mod passes {
    //! Individual per-function passes, exposed for callers that want to
    //! run one outside a named pipeline (e.g. a test asserting a single
    //! pass's effect in isolation).
    pub use crate::dce::run as dce;
    pub use crate::mem2reg::run as mem2reg;
    pub use crate::peephole::run as peephole;
    pub use crate::sccp::run as sccp;
    pub use crate::simplify_cfg::run as simplify_cfg;
}

pub mod module_passes {
    pub use crate::inliner::run as inline;
}
