//! Change detection and transformation-version packing
//!
//! Given the stored fingerprints for each output and the newly observed
//! document state, decide per output whether a resend is needed. The
//! transformation chain above each output is summarized into a single packed
//! string; equal packings mean equal chains, so the packing must escape its
//! own delimiters (connection names and descriptions are arbitrary text).

use crate::pipeline::{PipelineSpec, PipelineSpecWithVersions};

/// Does any output need this document (re)indexed?
///
/// An empty `new_document_version` is a sentinel meaning "force refetch":
/// the answer is `true` no matter what is stored.
pub fn needs_reindex(
    spec: &PipelineSpecWithVersions,
    new_document_version: &str,
    new_parameter_version: &str,
    new_authority: &str,
) -> bool {
    if new_document_version.is_empty() {
        return true;
    }
    (0..spec.topology().output_stage_count()).any(|index| {
        output_needs_reindex(
            spec,
            index,
            new_document_version,
            new_parameter_version,
            new_authority,
        )
    })
}

/// Does the `output_index`-th output need this document (re)indexed?
pub fn output_needs_reindex(
    spec: &PipelineSpecWithVersions,
    output_index: usize,
    new_document_version: &str,
    new_parameter_version: &str,
    new_authority: &str,
) -> bool {
    let stage = spec.topology().output_stage(output_index);
    let stored = spec.stored(output_index);

    let Some(old_document_version) = stored.document_version.as_deref() else {
        return true;
    };
    if old_document_version != new_document_version
        || stored.parameter_version != new_parameter_version
        || stored.authority_name != new_authority
        || stored.output_version != spec.spec().description(stage).as_str()
    {
        return true;
    }
    stored.transformation_version != packed_transformation_version(spec.spec(), stage)
}

/// Pack the transformation chain above `output_stage` into one string.
///
/// Walks parent pointers up to the root, collecting each transformation's
/// connection name and description version nearest-first. Names and
/// descriptions are emitted as two length-prefixed lists with delimiters
/// `+` and `!`; delimiter and backslash characters inside elements are
/// escaped with `\`, so distinct chains always produce distinct strings.
pub fn packed_transformation_version(spec: &PipelineSpec, output_stage: usize) -> String {
    let topology = spec.topology();
    let mut names = Vec::new();
    let mut descriptions = Vec::new();
    let mut current = output_stage;
    while let Some(parent) = topology.parent_of(current) {
        names.push(topology.connection_name(parent));
        descriptions.push(spec.description(parent).as_str());
        current = parent;
    }

    let mut packed = String::new();
    pack_list(&mut packed, &names, '+');
    pack_list(&mut packed, &descriptions, '!');
    packed
}

fn pack_list(output: &mut String, values: &[&str], delimiter: char) {
    pack(output, &values.len().to_string(), delimiter);
    for value in values {
        pack(output, value, delimiter);
    }
}

fn pack(output: &mut String, value: &str, delimiter: char) {
    for c in value.chars() {
        if c == delimiter || c == '\\' {
            output.push('\\');
        }
        output.push(c);
    }
    output.push(delimiter);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{
        PipelineSpec, PipelineSpecWithVersions, PipelineTopology, StageDef, StoredOutputVersions,
    };
    use crate::types::VersionContext;

    /// A linear pipeline whose transformation chain, walked from the output
    /// upward, is exactly `chain` (nearest transformation first).
    fn chain_spec(chain: &[(&str, &str)]) -> PipelineSpec {
        // Build root -> t_n -> ... -> t_1 -> output, so the upward walk
        // yields t_1, t_2, ... in `chain` order.
        let mut stages = Vec::new();
        let mut descriptions = Vec::new();
        let mut parent = None;
        for (name, description) in chain.iter().rev() {
            stages.push(StageDef::transformation(parent, *name));
            descriptions.push(VersionContext::new(*description));
            parent = Some(stages.len() - 1);
        }
        stages.push(StageDef::output(parent, "out"));
        descriptions.push(VersionContext::new("out-desc"));
        PipelineSpec::new(PipelineTopology::new(stages), descriptions)
    }

    fn packed(chain: &[(&str, &str)]) -> String {
        let spec = chain_spec(chain);
        let stage = spec.topology().output_stage(0);
        packed_transformation_version(&spec, stage)
    }

    fn single_spec(output_description: &str) -> PipelineSpec {
        PipelineSpec::new(
            PipelineTopology::single_output("web"),
            vec![VersionContext::new(output_description)],
        )
    }

    fn matching_versions(spec: &PipelineSpec) -> PipelineSpecWithVersions {
        let stage = spec.topology().output_stage(0);
        let stored = StoredOutputVersions {
            document_version: Some("v1".into()),
            transformation_version: packed_transformation_version(spec, stage),
            output_version: spec.description(stage).as_str().to_string(),
            parameter_version: "p1".into(),
            authority_name: "auth".into(),
        };
        PipelineSpecWithVersions::new(spec.clone(), vec![stored])
    }

    #[test]
    fn test_no_reindex_when_everything_matches() {
        let spec = matching_versions(&single_spec("outv"));
        assert!(!needs_reindex(&spec, "v1", "p1", "auth"));
    }

    #[test]
    fn test_any_changed_component_forces_reindex() {
        let spec = matching_versions(&single_spec("outv"));
        assert!(needs_reindex(&spec, "v2", "p1", "auth"));
        assert!(needs_reindex(&spec, "v1", "p2", "auth"));
        assert!(needs_reindex(&spec, "v1", "p1", "other"));

        // Changed output description.
        let changed = PipelineSpecWithVersions::new(
            single_spec("outv-NEW"),
            vec![StoredOutputVersions {
                document_version: Some("v1".into()),
                transformation_version: packed(&[]),
                output_version: "outv".into(),
                parameter_version: "p1".into(),
                authority_name: "auth".into(),
            }],
        );
        assert!(needs_reindex(&changed, "v1", "p1", "auth"));
    }

    #[test]
    fn test_changed_transformation_chain_forces_reindex() {
        let spec = chain_spec(&[("extract", "t1")]);
        let stage = spec.topology().output_stage(0);
        let stored = StoredOutputVersions {
            document_version: Some("v1".into()),
            // Stored under a different transformation description.
            transformation_version: packed(&[("extract", "t0")]),
            output_version: spec.description(stage).as_str().to_string(),
            parameter_version: "p1".into(),
            authority_name: "auth".into(),
        };
        let with_versions = PipelineSpecWithVersions::new(spec, vec![stored]);
        assert!(needs_reindex(&with_versions, "v1", "p1", "auth"));
    }

    #[test]
    fn test_never_indexed_forces_reindex() {
        let spec = PipelineSpecWithVersions::new(
            single_spec("outv"),
            vec![StoredOutputVersions::never_indexed()],
        );
        assert!(needs_reindex(&spec, "v1", "p1", "auth"));
    }

    #[test]
    fn test_empty_version_sentinel_always_reindexes() {
        let spec = matching_versions(&single_spec("outv"));
        assert!(needs_reindex(&spec, "", "p1", "auth"));
    }

    #[test]
    fn test_pack_equal_chains_pack_equally() {
        let chain = [("a+b", "v!1"), ("c", "d\\e")];
        assert_eq!(packed(&chain), packed(&chain));
    }

    #[test]
    fn test_pack_delimiter_ambiguity_does_not_collide() {
        // Without escaping, shifting the '+' from the name into the
        // description would produce the same flat text.
        let left = packed(&[("a+b", "v!1"), ("c", "d\\e")]);
        let right = packed(&[("a", "b+v!1"), ("c", "d\\e")]);
        assert_ne!(left, right);
    }

    #[test]
    fn test_pack_is_injective_over_tricky_inputs() {
        let chains: Vec<Vec<(&str, &str)>> = vec![
            vec![],
            vec![("a", "")],
            vec![("", "a")],
            vec![("a", ""), ("", "")],
            vec![("a\\", "b")],
            vec![("a", "\\b")],
            vec![("+", "!")],
            vec![("!", "+")],
            vec![("1", "x"), ("2", "y")],
            vec![("1", "x2"), ("", "y")],
        ];
        let mut seen = std::collections::HashMap::new();
        for chain in &chains {
            let p = packed(chain);
            if let Some(previous) = seen.insert(p.clone(), chain.clone()) {
                panic!("chains {previous:?} and {chain:?} both packed to {p:?}");
            }
        }
    }

    #[test]
    fn test_pack_shape() {
        // Count, then elements, each terminated by the delimiter.
        assert_eq!(packed(&[]), "0+0!");
        assert_eq!(packed(&[("n", "d")]), "1+n+1!d!");
    }
}
