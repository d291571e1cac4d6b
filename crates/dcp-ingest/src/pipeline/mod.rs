//! Pipeline topology, construction, and execution
//!
//! A pipeline specification describes a tree of stages rooted at a virtual
//! source: transformation stages on the inner nodes, output stages at the
//! leaves. [`spec`] holds the declarative description, [`builder`] turns it
//! into an executable fan-out tree, and [`executor`] runs that tree for
//! check probes and document delivery.

pub(crate) mod builder;
pub(crate) mod executor;
pub mod spec;

pub use spec::{
    PipelineSpec, PipelineSpecWithVersions, PipelineTopology, StageDef, StageKind,
    StoredOutputVersions,
};
