//! Section-aware enrichment. Fragmented retrieval often returns pieces of
//! one logical section (typically a table split into sequential parts);
//! this module detects those groups, pulls the missing siblings from the
//! store and reconstructs the full section as a single ranked item.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::config::SectionConfig;
use crate::store::{FieldCondition, Filter, ScrollOptions, ScrollPoint, VectorStore};
use crate::types::{Payload, SearchResult, SearchType, UserContext};

static SECTION_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(block_\d+)(?:/part_(\d+))?$").expect("section path regex is valid")
});

/// Split a section path into its base and optional part index.
pub fn parse_section_path(path: &str) -> Option<(String, Option<u32>)> {
    let captures = SECTION_PATH_RE.captures(path)?;
    let base = captures.get(1)?.as_str().to_string();
    let part = captures.get(2).and_then(|m| m.as_str().parse().ok());
    Some((base, part))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionReason {
    MissingSequentialPart,
    BaseSectionAndPartsFound,
    BaseSectionOnlyWithTableSyntax,
    SinglePart0WithTableSyntax,
    MarkdownTableSyntaxFound,
    PartialStructure,
}

impl DetectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingSequentialPart => "missing_sequential_part",
            Self::BaseSectionAndPartsFound => "base_section_and_parts_found",
            Self::BaseSectionOnlyWithTableSyntax => "base_section_only_with_table_syntax",
            Self::SinglePart0WithTableSyntax => "single_part_0_with_table_syntax",
            Self::MarkdownTableSyntaxFound => "markdown_table_syntax_found",
            Self::PartialStructure => "partial_structure",
        }
    }

    pub fn confidence(&self) -> f32 {
        match self {
            Self::MissingSequentialPart => 0.8,
            Self::BaseSectionAndPartsFound => 0.9,
            Self::BaseSectionOnlyWithTableSyntax => 0.8,
            Self::SinglePart0WithTableSyntax => 0.9,
            Self::MarkdownTableSyntaxFound => 0.85,
            Self::PartialStructure => 0.7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SectionGroup {
    pub base_path: String,
    pub doc_id: Option<String>,
    pub members: Vec<SearchResult>,
    pub reason: DetectionReason,
    pub confidence: f32,
    pub best_score: f32,
}

fn has_table_syntax(content: &str) -> bool {
    content
        .lines()
        .any(|line| line.matches('|').count() >= 2 || line.trim_start().starts_with("|--"))
}

/// Group results by (docId, base section path) and decide which groups
/// warrant reconstruction.
pub fn detect_section_groups(
    results: &[SearchResult],
    config: &SectionConfig,
) -> Vec<SectionGroup> {
    let mut grouped: BTreeMap<(String, String), Vec<(&SearchResult, Option<u32>)>> =
        BTreeMap::new();

    for result in results {
        let Some(path) = result.section_path() else { continue };
        let Some((base, part)) = parse_section_path(path) else { continue };
        let doc_key = result.doc_id().unwrap_or_default().to_string();
        grouped.entry((doc_key, base)).or_default().push((result, part));
    }

    let mut groups = Vec::new();
    for ((doc_key, base), members) in grouped {
        if members.len() < config.min_trigger_chunks {
            continue;
        }
        let best_score = members
            .iter()
            .map(|(r, _)| r.score)
            .fold(f32::MIN, f32::max);
        if best_score < config.min_trigger_score {
            continue;
        }

        let Some(reason) = classify_group(&members) else { continue };

        groups.push(SectionGroup {
            base_path: base,
            doc_id: if doc_key.is_empty() { None } else { Some(doc_key) },
            members: members.iter().map(|(r, _)| (*r).clone()).collect(),
            confidence: reason.confidence(),
            reason,
            best_score,
        });
    }
    groups
}

fn classify_group(members: &[(&SearchResult, Option<u32>)]) -> Option<DetectionReason> {
    let has_base = members.iter().any(|(_, part)| part.is_none());
    let mut parts: Vec<u32> = members.iter().filter_map(|(_, part)| *part).collect();
    parts.sort_unstable();
    parts.dedup();

    if has_base && !parts.is_empty() {
        return Some(DetectionReason::BaseSectionAndPartsFound);
    }

    if parts.len() >= 2 {
        let contiguous = parts.windows(2).all(|w| w[1] == w[0] + 1);
        if !contiguous || parts[0] != 0 {
            return Some(DetectionReason::MissingSequentialPart);
        }
        return Some(DetectionReason::PartialStructure);
    }

    // Single member groups trigger only on table syntax.
    let (result, part) = members.first()?;
    match part {
        None if has_table_syntax(&result.content) => {
            Some(DetectionReason::BaseSectionOnlyWithTableSyntax)
        }
        Some(0) if has_table_syntax(&result.content) => {
            Some(DetectionReason::SinglePart0WithTableSyntax)
        }
        Some(_) if has_table_syntax(&result.content) => {
            Some(DetectionReason::MarkdownTableSyntaxFound)
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineStrategy {
    Average,
    Max,
    Min,
    WeightedAverage,
}

impl CombineStrategy {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "average" => Self::Average,
            "max" => Self::Max,
            "min" => Self::Min,
            _ => Self::WeightedAverage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    Replace,
    Append,
    Interleave,
}

impl MergeMode {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "append" => Self::Append,
            "interleave" => Self::Interleave,
            _ => Self::Replace,
        }
    }
}

/// Combined score for the reconstructed section, from the scores the
/// original members brought with them.
fn combine_scores(members: &[SearchResult], strategy: CombineStrategy) -> f32 {
    if members.is_empty() {
        return 0.0;
    }
    let scores: Vec<f32> = members.iter().map(|m| m.score).collect();
    match strategy {
        CombineStrategy::Average => scores.iter().sum::<f32>() / scores.len() as f32,
        CombineStrategy::Max => scores.iter().copied().fold(f32::MIN, f32::max),
        CombineStrategy::Min => scores.iter().copied().fold(f32::MAX, f32::min),
        CombineStrategy::WeightedAverage => {
            let mut numerator = 0.0f32;
            let mut denominator = 0.0f32;
            for (i, member) in members.iter().enumerate() {
                let rank = member.rank.unwrap_or(i + 1).max(1) as f32;
                let weight = 1.0 / rank;
                numerator += weight * member.score;
                denominator += weight;
            }
            numerator / denominator.max(f32::EPSILON)
        }
    }
}

/// Payloads merge in part order: first non-array occurrence wins, arrays
/// union preserving order.
fn merge_payloads(parts: &[(Option<u32>, &Payload)]) -> Payload {
    let mut merged = Payload::new();
    for (_, payload) in parts {
        for (key, value) in payload.iter() {
            match merged.get_mut(key) {
                None => {
                    merged.insert(key.clone(), value.clone());
                }
                Some(serde_json::Value::Array(existing)) => {
                    if let serde_json::Value::Array(incoming) = value {
                        for item in incoming {
                            if !existing.contains(item) {
                                existing.push(item.clone());
                            }
                        }
                    }
                }
                Some(_) => {}
            }
        }
    }
    merged
}

struct SectionPart {
    part: Option<u32>,
    content: String,
    payload: Payload,
}

/// Rebuild one section from its retrieved members and the fetched
/// siblings. Parts merge in index order, base before parts.
pub fn reconstruct_section(
    group: &SectionGroup,
    fetched: Vec<ScrollPoint>,
    config: &SectionConfig,
) -> SearchResult {
    let mut parts: Vec<SectionPart> = Vec::new();

    for member in &group.members {
        let part = member
            .section_path()
            .and_then(parse_section_path)
            .and_then(|(_, part)| part);
        parts.push(SectionPart {
            part,
            content: member.content.clone(),
            payload: member.payload.clone(),
        });
    }
    for point in fetched {
        let content = point
            .payload
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let part = point
            .payload
            .get("sectionPath")
            .and_then(|v| v.as_str())
            .and_then(parse_section_path)
            .and_then(|(_, part)| part);
        parts.push(SectionPart { part, content, payload: point.payload });
    }

    // Base (no part suffix) sorts as part 0, ahead of explicit parts.
    parts.sort_by_key(|p| (p.part.unwrap_or(0), p.part.is_some()));

    let mut lines: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for part in &parts {
        for line in part.content.lines() {
            if config.dedupe_lines {
                if seen.insert(line.to_string()) {
                    lines.push(line.to_string());
                }
            } else {
                lines.push(line.to_string());
            }
        }
    }
    let content = lines.join("\n");

    let payload_refs: Vec<(Option<u32>, &Payload)> =
        parts.iter().map(|p| (p.part, &p.payload)).collect();
    let mut payload = merge_payloads(&payload_refs);
    payload.insert("sectionPath".into(), serde_json::json!(group.base_path));

    let combined = combine_scores(
        &group.members,
        CombineStrategy::parse(&config.combine_strategy),
    );

    let id = match &group.doc_id {
        Some(doc) => format!("section::{doc}::{}", group.base_path),
        None => format!("section::{}", group.base_path),
    };

    let mut result = SearchResult::new(id, combined, SearchType::SectionReconstructed);
    result.fusion_score = Some(combined);
    result.content = content;
    result.payload = payload;
    result
}

/// Merge reconstructed sections back into the ranked list.
pub fn merge_into_results(
    results: Vec<SearchResult>,
    sections: Vec<(SectionGroup, SearchResult)>,
    mode: MergeMode,
) -> Vec<SearchResult> {
    if sections.is_empty() {
        return results;
    }

    match mode {
        MergeMode::Append => {
            let mut merged = results;
            merged.extend(sections.into_iter().map(|(_, section)| section));
            merged
        }
        MergeMode::Replace | MergeMode::Interleave => {
            let consumed: HashSet<String> = sections
                .iter()
                .flat_map(|(group, _)| group.members.iter().map(|m| m.id.clone()))
                .collect();

            if mode == MergeMode::Replace {
                let mut merged = Vec::with_capacity(results.len());
                let mut pending = sections;
                for result in results {
                    if !consumed.contains(&result.id) {
                        merged.push(result);
                        continue;
                    }
                    // The first consumed member yields its slot to the
                    // reconstructed section.
                    if let Some(pos) = pending.iter().position(|(group, _)| {
                        group.members.iter().any(|m| m.id == result.id)
                    }) {
                        merged.push(pending.remove(pos).1);
                    }
                }
                merged.extend(pending.into_iter().map(|(_, section)| section));
                merged
            } else {
                let mut merged: Vec<SearchResult> = results
                    .into_iter()
                    .filter(|r| !consumed.contains(&r.id))
                    .collect();
                merged.extend(sections.into_iter().map(|(_, section)| section));
                merged.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.id.cmp(&b.id))
                });
                merged
            }
        }
    }
}

/// Drives detection, concurrent sibling fetches and merge-back.
pub struct SectionEnricher {
    store: Arc<dyn VectorStore>,
    config: SectionConfig,
}

impl SectionEnricher {
    pub fn new(store: Arc<dyn VectorStore>, config: SectionConfig) -> Self {
        Self { store, config }
    }

    pub async fn enrich(
        &self,
        collection: &str,
        results: Vec<SearchResult>,
        user: &UserContext,
    ) -> Vec<SearchResult> {
        let groups = detect_section_groups(&results, &self.config);
        if groups.is_empty() {
            return results;
        }

        let fetches = groups.iter().map(|group| self.fetch_missing(collection, group, user));
        let fetched: Vec<Vec<ScrollPoint>> = futures::future::join_all(fetches).await;

        let sections: Vec<(SectionGroup, SearchResult)> = groups
            .into_iter()
            .zip(fetched)
            .map(|(group, points)| {
                let section = reconstruct_section(&group, points, &self.config);
                tracing::debug!(
                    base = %group.base_path,
                    reason = group.reason.as_str(),
                    confidence = group.confidence,
                    "reconstructed section"
                );
                (group, section)
            })
            .collect();

        merge_into_results(results, sections, MergeMode::parse(&self.config.merge_mode))
    }

    /// Filter-scroll the collection for the group's missing siblings.
    /// A failure or timeout yields an empty result for the group only.
    async fn fetch_missing(
        &self,
        collection: &str,
        group: &SectionGroup,
        user: &UserContext,
    ) -> Vec<ScrollPoint> {
        let mut filter =
            Filter::rbac(user).with_must(FieldCondition::text("sectionPath", group.base_path.clone()));
        if let Some(doc_id) = &group.doc_id {
            filter = filter.with_must(FieldCondition::value("docId", doc_id.clone()));
        }

        let in_hand: HashSet<&str> = group.members.iter().map(|m| m.id.as_str()).collect();
        let options = ScrollOptions::payload_only(self.config.max_chunks_per_section);
        let timeout = Duration::from_millis(self.config.fetch_timeout_ms);

        let points = match tokio::time::timeout(
            timeout,
            self.store.scroll(collection, &filter, options),
        )
        .await
        {
            Ok(Ok(points)) => points,
            Ok(Err(e)) => {
                tracing::warn!(base = %group.base_path, error = %e, "section fetch failed");
                return Vec::new();
            }
            Err(_) => {
                tracing::warn!(base = %group.base_path, "section fetch timed out");
                return Vec::new();
            }
        };

        points
            .into_iter()
            .filter(|p| !in_hand.contains(p.id.as_str()))
            .filter(|p| {
                // Text-match filters are containment; require base equality.
                p.payload
                    .get("sectionPath")
                    .and_then(|v| v.as_str())
                    .and_then(parse_section_path)
                    .map(|(base, _)| base == group.base_path)
                    .unwrap_or(false)
            })
            .collect()
    }
}
