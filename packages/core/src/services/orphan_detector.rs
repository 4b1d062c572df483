//! Orphan Detector
//!
//! Given a set of nodes about to be deleted, finds the nodes that would be left
//! without any surviving anchor: nothing outside the deletion set (or the other
//! orphans) points at them anymore.
//!
//! # Algorithm
//!
//! 1. **Candidate region**: breadth-first walk over outgoing cascading edges
//!    (see [`crate::models::EdgeType::cascades`]) from the deletion set, at most `max_depth`
//!    hops. Back-references and provenance edges are not followed, so deleting
//!    a child never reaches its parent. Anchor-type nodes (memory spaces,
//!    agents, users) are never candidates and the walk does not pass through
//!    them.
//! 2. **Anchor search**: for each candidate, in walk order, breadth-first walk
//!    over incoming edges, skipping sources that are being deleted or already
//!    known to be orphans. The candidate is anchored as soon as a source is
//!    outside the candidate region, is an anchor-type node, or is a candidate
//!    already found to be anchored.
//! 3. **Islands**: if the anchor search runs out of sources, every node it
//!    visited is only reachable from the deletion set or from other orphans.
//!    The whole visited set is reported as one orphan island. Self-loops and
//!    cycles fall out of the visited set naturally.
//!
//! Both walks are bounded by `max_depth`. Whatever is not resolved within the
//! bound is kept: the candidate walk stops expanding, and an anchor search that
//! would need to go deeper treats the candidate as anchored. `depth_limited` in
//! the report records that the bound was hit.

use crate::config::OrphanDetectorConfig;
use crate::db::{EdgeFilter, GraphStore};
use crate::models::NodeKey;
use crate::services::error::SyncError;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Per-invocation traversal state; created for one detection and dropped after
#[derive(Debug)]
pub struct DeletionContext {
    deletion_set: BTreeSet<NodeKey>,
    /// Nodes inspected by the candidate walk
    visited: BTreeSet<NodeKey>,
    frontier: VecDeque<(NodeKey, usize)>,
    max_depth: usize,
}

impl DeletionContext {
    pub fn new(deletion_set: BTreeSet<NodeKey>, max_depth: usize) -> Self {
        let frontier = deletion_set.iter().map(|key| (key.clone(), 0)).collect();
        Self {
            deletion_set,
            visited: BTreeSet::new(),
            frontier,
            max_depth,
        }
    }

    pub fn deletion_set(&self) -> &BTreeSet<NodeKey> {
        &self.deletion_set
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn is_deleted(&self, key: &NodeKey) -> bool {
        self.deletion_set.contains(key)
    }
}

/// Result of a detection run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrphanReport {
    /// Nodes to delete in addition to the deletion set
    pub orphans: BTreeSet<NodeKey>,
    /// A traversal hit `max_depth`; some nodes were kept without a full check
    pub depth_limited: bool,
    /// Orphans grouped by the anchor search that found them
    pub islands: Vec<BTreeSet<NodeKey>>,
}

enum AnchorSearch {
    Anchored,
    DepthExceeded,
    Island(BTreeSet<NodeKey>),
}

pub struct OrphanDetector {
    store: Arc<dyn GraphStore>,
    config: OrphanDetectorConfig,
}

impl OrphanDetector {
    pub fn new(store: Arc<dyn GraphStore>, config: OrphanDetectorConfig) -> Self {
        Self { store, config }
    }

    pub fn max_depth(&self) -> usize {
        self.config.max_depth
    }

    /// Orphan keys only
    pub async fn find_orphan_keys(
        &self,
        deletion_set: &BTreeSet<NodeKey>,
    ) -> Result<BTreeSet<NodeKey>, SyncError> {
        Ok(self.find_orphans(deletion_set).await?.orphans)
    }

    /// Find every node that loses its last anchor when `deletion_set` is removed
    ///
    /// Deterministic for a given graph snapshot. Never reports a node that a
    /// node outside `deletion_set ∪ orphans` still reaches.
    pub async fn find_orphans(
        &self,
        deletion_set: &BTreeSet<NodeKey>,
    ) -> Result<OrphanReport, SyncError> {
        let mut ctx = DeletionContext::new(deletion_set.clone(), self.config.max_depth);
        let mut report = OrphanReport::default();

        let candidates = self.collect_candidates(&mut ctx, &mut report).await?;
        if candidates.is_empty() {
            return Ok(report);
        }
        let region: HashSet<NodeKey> = candidates.iter().cloned().collect();

        let mut anchored: HashSet<NodeKey> = HashSet::new();
        let mut incoming_cache: HashMap<NodeKey, Vec<NodeKey>> = HashMap::new();

        for candidate in &candidates {
            if report.orphans.contains(candidate) || anchored.contains(candidate) {
                continue;
            }

            match self
                .search_anchor(
                    &ctx,
                    candidate,
                    &region,
                    &anchored,
                    &report.orphans,
                    &mut incoming_cache,
                )
                .await?
            {
                AnchorSearch::Anchored => {
                    anchored.insert(candidate.clone());
                }
                AnchorSearch::DepthExceeded => {
                    tracing::warn!(
                        key = %candidate,
                        max_depth = ctx.max_depth(),
                        "Anchor search exceeded depth bound; keeping node"
                    );
                    report.depth_limited = true;
                    anchored.insert(candidate.clone());
                }
                AnchorSearch::Island(island) => {
                    report.orphans.extend(island.iter().cloned());
                    report.islands.push(island);
                }
            }
        }

        tracing::debug!(
            deletion_set = ctx.deletion_set().len(),
            candidates = candidates.len(),
            orphans = report.orphans.len(),
            "Orphan detection complete"
        );
        Ok(report)
    }

    /// Forward walk from the deletion set; returns candidates in walk order
    async fn collect_candidates(
        &self,
        ctx: &mut DeletionContext,
        report: &mut OrphanReport,
    ) -> Result<Vec<NodeKey>, SyncError> {
        let mut candidates = Vec::new();

        while let Some((current, depth)) = ctx.frontier.pop_front() {
            let targets: BTreeSet<NodeKey> = self
                .store
                .find_edges(EdgeFilter::outgoing(&current))
                .await?
                .into_iter()
                .filter(|edge| edge.edge_type.cascades())
                .map(|edge| edge.to)
                .filter(|to| {
                    !ctx.deletion_set.contains(to)
                        && !ctx.visited.contains(to)
                        && !to.entity_type.is_anchor_type()
                })
                .collect();

            if targets.is_empty() {
                continue;
            }
            if depth >= ctx.max_depth {
                if !report.depth_limited {
                    tracing::warn!(
                        key = %current,
                        max_depth = ctx.max_depth,
                        "Candidate walk truncated at depth bound; nodes beyond it are kept"
                    );
                }
                report.depth_limited = true;
                continue;
            }

            for target in targets {
                ctx.visited.insert(target.clone());
                candidates.push(target.clone());
                ctx.frontier.push_back((target, depth + 1));
            }
        }

        Ok(candidates)
    }

    /// Backward walk from one candidate looking for a surviving anchor
    async fn search_anchor(
        &self,
        ctx: &DeletionContext,
        candidate: &NodeKey,
        region: &HashSet<NodeKey>,
        anchored: &HashSet<NodeKey>,
        orphans: &BTreeSet<NodeKey>,
        incoming_cache: &mut HashMap<NodeKey, Vec<NodeKey>>,
    ) -> Result<AnchorSearch, SyncError> {
        let mut visited: BTreeSet<NodeKey> = BTreeSet::from([candidate.clone()]);
        let mut frontier: VecDeque<(NodeKey, usize)> = VecDeque::from([(candidate.clone(), 0)]);

        while let Some((current, depth)) = frontier.pop_front() {
            let sources = match incoming_cache.get(&current) {
                Some(sources) => sources.clone(),
                None => {
                    let sources: Vec<NodeKey> = self
                        .store
                        .find_edges(EdgeFilter::incoming(&current))
                        .await?
                        .into_iter()
                        .map(|edge| edge.from)
                        .collect::<BTreeSet<_>>()
                        .into_iter()
                        .collect();
                    incoming_cache.insert(current.clone(), sources.clone());
                    sources
                }
            };

            for source in sources {
                if ctx.is_deleted(&source) || orphans.contains(&source) || visited.contains(&source)
                {
                    continue;
                }
                if source.entity_type.is_anchor_type()
                    || !region.contains(&source)
                    || anchored.contains(&source)
                {
                    return Ok(AnchorSearch::Anchored);
                }
                if depth + 1 > ctx.max_depth {
                    return Ok(AnchorSearch::DepthExceeded);
                }
                visited.insert(source.clone());
                frontier.push_back((source, depth + 1));
            }
        }

        Ok(AnchorSearch::Island(visited))
    }
}
