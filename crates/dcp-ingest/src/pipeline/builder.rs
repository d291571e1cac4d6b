//! Fan-out tree construction
//!
//! Pipelines are assembled bottom-up: start with one entry point per output
//! stage, then repeatedly find a parent whose children are all present,
//! collapse those siblings into a fan-out, and wrap the fan-out in the
//! parent's transformation entry point. When the virtual root's children
//! collapse, the result is the pipeline. A set that stops shrinking before
//! reaching the root means the topology is malformed, which is a programmer
//! error and panics.

use std::collections::HashMap;
use std::sync::Arc;

use crate::activity::{CheckActivity, HistoryActivity, IngestActivities, QualifiedActivitySink};
use crate::connector::{OutputConnector, TransformationConnector};
use crate::locks::LockRegistry;
use crate::pipeline::executor::{
    AddEntryPoint, AddFanout, CheckEntryPoint, CheckFanout, CheckTarget, OutputAddEntry,
    StageConnector, TransformationAddEntry,
};
use crate::pipeline::{PipelineSpec, PipelineSpecWithVersions};
use crate::store::IngestRecordStore;
use crate::versioning::{output_needs_reindex, packed_transformation_version};

/// Connector handles grabbed for one pipeline run, keyed by connection name.
#[derive(Default)]
pub(crate) struct PipelineConnectors {
    pub(crate) outputs: HashMap<String, Arc<dyn OutputConnector>>,
    pub(crate) transformations: HashMap<String, Arc<dyn TransformationConnector>>,
}

impl PipelineConnectors {
    fn output(&self, connection_name: &str) -> Arc<dyn OutputConnector> {
        self.outputs
            .get(connection_name)
            .unwrap_or_else(|| panic!("output connector '{connection_name}' was not grabbed"))
            .clone()
    }

    fn transformation(&self, connection_name: &str) -> Arc<dyn TransformationConnector> {
        self.transformations
            .get(connection_name)
            .unwrap_or_else(|| {
                panic!("transformation connector '{connection_name}' was not grabbed")
            })
            .clone()
    }
}

/// Everything an add pipeline's leaves need injected from the coordinator.
pub(crate) struct AddContext<'a> {
    pub(crate) store: Arc<IngestRecordStore>,
    pub(crate) locks: Arc<dyn LockRegistry>,
    pub(crate) activities: Arc<dyn IngestActivities>,
    pub(crate) doc_key: &'a str,
    pub(crate) document_version: &'a str,
    pub(crate) parameter_version: &'a str,
    pub(crate) authority: &'a str,
    pub(crate) ingest_time: i64,
}

/// Build a read-only probe pipeline.
pub(crate) fn build_check_pipeline(
    spec: &PipelineSpec,
    connectors: &PipelineConnectors,
    final_activity: Arc<dyn CheckActivity>,
) -> CheckFanout {
    let topology = spec.topology();
    let mut current: HashMap<usize, CheckEntryPoint> = HashMap::new();
    for index in 0..topology.output_stage_count() {
        let stage = topology.output_stage(index);
        current.insert(
            stage,
            CheckEntryPoint {
                connector: StageConnector::Output(
                    connectors.output(topology.connection_name(stage)),
                ),
                description: spec.description(stage).clone(),
                downstream: CheckTarget::Final(final_activity.clone()),
            },
        );
    }

    loop {
        let (parent, siblings) = next_complete_sibling_set(topology, &current);
        let children = siblings
            .iter()
            .map(|stage| current.remove(stage).expect("sibling present"))
            .collect();
        let fanout = CheckFanout { children };
        let Some(parent) = parent else {
            return fanout;
        };
        current.insert(
            parent,
            CheckEntryPoint {
                connector: StageConnector::Transformation(
                    connectors.transformation(topology.connection_name(parent)),
                ),
                description: spec.description(parent).clone(),
                downstream: CheckTarget::Fanout(Box::new(fanout)),
            },
        );
    }
}

/// Build a delivery pipeline. Each leaf carries the precomputed "does this
/// output need the send?" bit; a transformation is active iff any leaf
/// below it is.
pub(crate) fn build_add_pipeline(
    spec: &PipelineSpecWithVersions,
    connectors: &PipelineConnectors,
    context: &AddContext<'_>,
) -> AddFanout {
    let topology = spec.topology();
    let mut current: HashMap<usize, AddEntryPoint> = HashMap::new();
    for index in 0..topology.output_stage_count() {
        let stage = topology.output_stage(index);
        let active = output_needs_reindex(
            spec,
            index,
            context.document_version,
            context.parameter_version,
            context.authority,
        );
        let transformation_version = packed_transformation_version(spec.spec(), stage);
        let connection_name = topology.connection_name(stage).to_string();
        current.insert(
            stage,
            AddEntryPoint::Output(Box::new(OutputAddEntry::new(
                connectors.output(&connection_name),
                spec.spec().description(stage).clone(),
                context.activities.clone(),
                active,
                connection_name,
                transformation_version,
                context.document_version.to_string(),
                context.parameter_version.to_string(),
                context.doc_key.to_string(),
                context.ingest_time,
                context.store.clone(),
                context.locks.clone(),
            ))),
        );
    }

    loop {
        let (parent, siblings) = next_complete_sibling_set(topology, &current);
        let children: Vec<AddEntryPoint> = siblings
            .iter()
            .map(|stage| current.remove(stage).expect("sibling present"))
            .collect();
        let history: Arc<dyn HistoryActivity> = match parent {
            // Activity recorded through a mid-pipeline fan-out is attributed
            // to the transformation connection above it.
            Some(parent) => Arc::new(QualifiedActivitySink::new(
                topology.connection_name(parent),
                context.activities.clone(),
            )),
            None => context.activities.clone(),
        };
        let fanout = AddFanout { children, history };
        let Some(parent) = parent else {
            return fanout;
        };
        let active = fanout.any_active();
        current.insert(
            parent,
            AddEntryPoint::Transformation(TransformationAddEntry {
                connector: connectors.transformation(topology.connection_name(parent)),
                description: spec.spec().description(parent).clone(),
                downstream: fanout,
                active,
            }),
        );
    }
}

/// Find any stage in `current` whose parent has all of its children already
/// present, and return that parent with its children. Panics if the set is
/// non-collapsible, which means the topology is not the tree it claimed to
/// be.
fn next_complete_sibling_set<T>(
    topology: &crate::pipeline::PipelineTopology,
    current: &HashMap<usize, T>,
) -> (Option<usize>, Vec<usize>) {
    for &stage in current.keys() {
        let parent = topology.parent_of(stage);
        let siblings = topology.children_of(parent);
        if siblings.iter().all(|s| current.contains_key(s)) {
            return (parent, siblings.to_vec());
        }
    }
    panic!("pipeline build stalled: no parent has its full sibling set present");
}
