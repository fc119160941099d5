//! Workflow graph model: nodes, edges, typed configuration, compilation,
//! placeholder resolution and branch routing.

pub mod compiler;
pub mod config;
pub mod edge;
pub mod node;
pub mod router;
pub mod template;

pub use compiler::{compile, CompiledGraph, CompiledNode};
pub use config::NodeConfig;
pub use edge::Edge;
pub use node::{ErrorPolicy, Node};
pub use router::{Liveness, Outcome};
