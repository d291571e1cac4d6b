//! Declarative pipeline specifications
//!
//! Three layers, by composition. [`PipelineTopology`] is the stage tree
//! itself: parent pointers, stage kinds, connection names.
//! [`PipelineSpec`] adds the per-stage description fingerprints needed to
//! run checks and compute transformation versions.
//! [`PipelineSpecWithVersions`] adds the previously stored per-output
//! fingerprints, so reindex decisions need no database round trip.
//!
//! A malformed topology is a programmer error: construction panics rather
//! than returning a recoverable error.

use serde::{Deserialize, Serialize};

use crate::types::VersionContext;

/// What a stage does with documents that reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageKind {
    /// Rewrites or enriches the document and passes it on.
    Transformation,
    /// Delivers the document to a downstream index. Always a leaf.
    Output,
}

/// One stage of the pipeline tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageDef {
    /// Index of the parent stage; `None` is the virtual root.
    pub parent: Option<usize>,
    pub kind: StageKind,
    /// Name of the transformation or output connection this stage runs.
    pub connection_name: String,
}

impl StageDef {
    pub fn transformation(parent: Option<usize>, connection_name: impl Into<String>) -> Self {
        StageDef {
            parent,
            kind: StageKind::Transformation,
            connection_name: connection_name.into(),
        }
    }

    pub fn output(parent: Option<usize>, connection_name: impl Into<String>) -> Self {
        StageDef {
            parent,
            kind: StageKind::Output,
            connection_name: connection_name.into(),
        }
    }
}

/// The stage tree of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineTopology {
    stages: Vec<StageDef>,
    root_children: Vec<usize>,
    children: Vec<Vec<usize>>,
    output_stages: Vec<usize>,
}

impl PipelineTopology {
    /// Build and validate a topology.
    ///
    /// Panics if a parent index is out of range, if following parent
    /// pointers does not terminate at the root, or if the leaf set is not
    /// exactly the set of output stages.
    pub fn new(stages: Vec<StageDef>) -> Self {
        let count = stages.len();
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut root_children = Vec::new();
        for (index, stage) in stages.iter().enumerate() {
            match stage.parent {
                None => root_children.push(index),
                Some(parent) => {
                    assert!(
                        parent < count,
                        "stage {index} names parent {parent}, but there are only {count} stages"
                    );
                    children[parent].push(index);
                },
            }
        }
        for (index, stage) in stages.iter().enumerate() {
            // Every stage must reach the root; a cycle would walk forever.
            let mut steps = 0;
            let mut current = index;
            while let Some(parent) = stages[current].parent {
                steps += 1;
                assert!(steps <= count, "stage {index} is part of a parent cycle");
                current = parent;
            }
            match stage.kind {
                StageKind::Output => assert!(
                    children[index].is_empty(),
                    "output stage {index} has children; outputs must be leaves"
                ),
                StageKind::Transformation => assert!(
                    !children[index].is_empty(),
                    "transformation stage {index} has no children"
                ),
            }
        }
        let output_stages = stages
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind == StageKind::Output)
            .map(|(i, _)| i)
            .collect();
        PipelineTopology {
            stages,
            root_children,
            children,
            output_stages,
        }
    }

    /// A pipeline with a single output stage and no transformations.
    pub fn single_output(output_connection: impl Into<String>) -> Self {
        Self::new(vec![StageDef::output(None, output_connection)])
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn parent_of(&self, stage: usize) -> Option<usize> {
        self.stages[stage].parent
    }

    /// Children of a stage; `None` asks for the root's children.
    pub fn children_of(&self, parent: Option<usize>) -> &[usize] {
        match parent {
            None => &self.root_children,
            Some(stage) => &self.children[stage],
        }
    }

    pub fn is_output(&self, stage: usize) -> bool {
        self.stages[stage].kind == StageKind::Output
    }

    pub fn connection_name(&self, stage: usize) -> &str {
        &self.stages[stage].connection_name
    }

    pub fn output_stage_count(&self) -> usize {
        self.output_stages.len()
    }

    /// Stage index of the `index`-th output.
    pub fn output_stage(&self, index: usize) -> usize {
        self.output_stages[index]
    }

    /// Output connection names in output order (one entry per output stage).
    pub fn output_connection_names(&self) -> Vec<String> {
        self.output_stages
            .iter()
            .map(|&s| self.stages[s].connection_name.clone())
            .collect()
    }

    /// Distinct output connection names, in first-appearance order.
    pub fn unique_output_connection_names(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.output_connection_names()
            .into_iter()
            .filter(|n| seen.insert(n.clone()))
            .collect()
    }

    /// Distinct transformation connection names, in first-appearance order.
    pub fn transformation_connection_names(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.stages
            .iter()
            .filter(|s| s.kind == StageKind::Transformation)
            .map(|s| s.connection_name.clone())
            .filter(|n| seen.insert(n.clone()))
            .collect()
    }
}

/// Stored fingerprints for one output, as of the last successful delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOutputVersions {
    /// `None` means this output has never been indexed (or its state was
    /// reset) and the document must be sent regardless of anything else.
    pub document_version: Option<String>,
    pub transformation_version: String,
    pub output_version: String,
    pub parameter_version: String,
    pub authority_name: String,
}

impl StoredOutputVersions {
    /// The state of an output that has never seen this document.
    pub fn never_indexed() -> Self {
        Self::default()
    }
}

/// A topology plus the per-stage description fingerprints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSpec {
    topology: PipelineTopology,
    descriptions: Vec<VersionContext>,
}

impl PipelineSpec {
    /// Panics unless there is exactly one description per stage.
    pub fn new(topology: PipelineTopology, descriptions: Vec<VersionContext>) -> Self {
        assert_eq!(
            topology.stage_count(),
            descriptions.len(),
            "one description per stage"
        );
        PipelineSpec {
            topology,
            descriptions,
        }
    }

    pub fn topology(&self) -> &PipelineTopology {
        &self.topology
    }

    pub fn description(&self, stage: usize) -> &VersionContext {
        &self.descriptions[stage]
    }
}

/// A described pipeline plus the stored per-output state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSpecWithVersions {
    spec: PipelineSpec,
    outputs: Vec<StoredOutputVersions>,
}

impl PipelineSpecWithVersions {
    /// Panics unless there is exactly one stored state per output stage.
    pub fn new(spec: PipelineSpec, outputs: Vec<StoredOutputVersions>) -> Self {
        assert_eq!(
            spec.topology().output_stage_count(),
            outputs.len(),
            "one stored state per output stage"
        );
        PipelineSpecWithVersions { spec, outputs }
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    pub fn topology(&self) -> &PipelineTopology {
        self.spec.topology()
    }

    /// Stored state for the `index`-th output.
    pub fn stored(&self, index: usize) -> &StoredOutputVersions {
        &self.outputs[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branching() -> PipelineTopology {
        // root -> tfm(0) -> out(1), out(2); root -> out(3)
        PipelineTopology::new(vec![
            StageDef::transformation(None, "extract"),
            StageDef::output(Some(0), "solr"),
            StageDef::output(Some(0), "elastic"),
            StageDef::output(None, "audit"),
        ])
    }

    #[test]
    fn test_topology_shape() {
        let topo = branching();
        assert_eq!(topo.stage_count(), 4);
        assert_eq!(topo.children_of(None), &[0, 3]);
        assert_eq!(topo.children_of(Some(0)), &[1, 2]);
        assert_eq!(topo.parent_of(1), Some(0));
        assert_eq!(topo.parent_of(0), None);
        assert_eq!(topo.output_stage_count(), 3);
        assert_eq!(topo.output_stage(0), 1);
        assert_eq!(topo.connection_name(2), "elastic");
        assert!(topo.is_output(3));
        assert!(!topo.is_output(0));
    }

    #[test]
    fn test_connection_name_extraction() {
        let topo = branching();
        assert_eq!(topo.output_connection_names(), vec!["solr", "elastic", "audit"]);
        assert_eq!(topo.transformation_connection_names(), vec!["extract"]);
    }

    #[test]
    fn test_unique_output_names_dedup() {
        let topo = PipelineTopology::new(vec![
            StageDef::transformation(None, "extract"),
            StageDef::output(Some(0), "solr"),
            StageDef::output(None, "solr"),
        ]);
        assert_eq!(topo.output_connection_names(), vec!["solr", "solr"]);
        assert_eq!(topo.unique_output_connection_names(), vec!["solr"]);
    }

    #[test]
    #[should_panic(expected = "parent cycle")]
    fn test_cycle_panics() {
        PipelineTopology::new(vec![
            StageDef::transformation(Some(1), "a"),
            StageDef::transformation(Some(0), "b"),
        ]);
    }

    #[test]
    #[should_panic(expected = "has no children")]
    fn test_childless_transformation_panics() {
        PipelineTopology::new(vec![StageDef::transformation(None, "a")]);
    }

    #[test]
    #[should_panic(expected = "only 1 stages")]
    fn test_dangling_parent_panics() {
        PipelineTopology::new(vec![StageDef::output(Some(7), "solr")]);
    }

    #[test]
    #[should_panic(expected = "one description per stage")]
    fn test_spec_arity_checked() {
        PipelineSpec::new(branching(), vec![VersionContext::new("only-one")]);
    }

    #[test]
    fn test_spec_with_versions_accessors() {
        let topo = PipelineTopology::single_output("solr");
        let spec = PipelineSpec::new(topo, vec![VersionContext::new("ov")]);
        let with_versions = PipelineSpecWithVersions::new(
            spec,
            vec![StoredOutputVersions {
                document_version: Some("v1".into()),
                ..StoredOutputVersions::default()
            }],
        );
        assert_eq!(with_versions.stored(0).document_version.as_deref(), Some("v1"));
        assert_eq!(with_versions.topology().output_stage_count(), 1);
    }
}
