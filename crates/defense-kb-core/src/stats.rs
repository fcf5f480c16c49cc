//! Aggregate statistics computed once per generation.
//!
//! Computed in the same pass that builds a generation, persisted in the
//! version record, and served without any further scan of the store.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{DocType, Document};
use crate::threat::Framework;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub total_documents: usize,
    pub total_techniques: usize,
    pub total_subtechniques: usize,
    pub total_strategies: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreatFrameworkCoverage {
    pub owasp_llm_items_covered: usize,
    pub mitre_atlas_items_covered: usize,
    pub maestro_items_covered: usize,
    pub techniques_with_threat_mappings: usize,
    pub coverage_percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsAvailability {
    pub techniques_with_opensource_tools: usize,
    pub techniques_with_commercial_tools: usize,
    pub opensource_coverage_percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImplementationResources {
    pub documents_with_code_snippets: usize,
    pub strategies_total: usize,
    pub code_coverage_percentage: f64,
}

/// Precomputed statistics for one generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub overview: Overview,
    pub by_tactic: BTreeMap<String, usize>,
    pub by_pillar: BTreeMap<String, usize>,
    pub by_phase: BTreeMap<String, usize>,
    pub threat_framework_coverage: ThreatFrameworkCoverage,
    pub tools_availability: ToolsAvailability,
    pub implementation_resources: ImplementationResources,
}

impl Statistics {
    /// Compute statistics over a full document set.
    ///
    /// Threat coverage and tool availability are counted over techniques
    /// only. Empty pillar and phase tags are not counted.
    pub fn compute(documents: &[Document]) -> Self {
        let mut stats = Statistics::default();

        let mut owasp = BTreeSet::new();
        let mut atlas = BTreeSet::new();
        let mut maestro = BTreeSet::new();

        for doc in documents {
            stats.overview.total_documents += 1;
            match doc.doc_type {
                DocType::Technique => stats.overview.total_techniques += 1,
                DocType::Subtechnique => stats.overview.total_subtechniques += 1,
                DocType::Strategy => stats.overview.total_strategies += 1,
            }

            *stats.by_tactic.entry(doc.tactic.clone()).or_insert(0) += 1;
            if !doc.pillar.is_empty() {
                *stats.by_pillar.entry(doc.pillar.clone()).or_insert(0) += 1;
            }
            if !doc.phase.is_empty() {
                *stats.by_phase.entry(doc.phase.clone()).or_insert(0) += 1;
            }

            if doc.has_code {
                stats.implementation_resources.documents_with_code_snippets += 1;
            }

            if doc.doc_type != DocType::Technique {
                continue;
            }

            if !doc.threat_mappings.is_empty() {
                stats.threat_framework_coverage.techniques_with_threat_mappings += 1;
            }
            for mapping in &doc.threat_mappings {
                let bucket = match Framework::classify(&mapping.framework) {
                    Framework::Owasp => &mut owasp,
                    Framework::Atlas => &mut atlas,
                    Framework::Maestro => &mut maestro,
                    Framework::Other => continue,
                };
                bucket.extend(mapping.items.iter().cloned());
            }

            if !doc.tools_opensource.is_empty() {
                stats.tools_availability.techniques_with_opensource_tools += 1;
            }
            if !doc.tools_commercial.is_empty() {
                stats.tools_availability.techniques_with_commercial_tools += 1;
            }
        }

        let techniques = stats.overview.total_techniques;
        let strategies = stats.overview.total_strategies;

        let coverage = &mut stats.threat_framework_coverage;
        coverage.owasp_llm_items_covered = owasp.len();
        coverage.mitre_atlas_items_covered = atlas.len();
        coverage.maestro_items_covered = maestro.len();
        coverage.coverage_percentage =
            percentage(coverage.techniques_with_threat_mappings, techniques);

        stats.tools_availability.opensource_coverage_percentage = percentage(
            stats.tools_availability.techniques_with_opensource_tools,
            techniques,
        );

        let resources = &mut stats.implementation_resources;
        resources.strategies_total = strategies;
        resources.code_coverage_percentage =
            percentage(resources.documents_with_code_snippets, strategies);

        stats
    }
}

/// `part / whole` as a percentage rounded to one decimal; `0.0` when `whole == 0`.
fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 1000.0).round() / 10.0
}
