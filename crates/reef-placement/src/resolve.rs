//! Resolution of a placement rule against the live node view.

use std::collections::{BTreeMap, HashSet};

use reef_types::policy::ANY_FILTER;
use reef_types::{Clause, ContainerId, NodeId, NodeRecord, ObjectId, PlacementRule, Selector};
use tracing::debug;

use crate::PlacementError;

/// Nodes chosen for one `REP` descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementVector {
    /// Copies required from this vector.
    pub replicas: u32,
    /// Candidate nodes in preference order. The first `replicas` are the
    /// primary targets, the rest are backup-factor fallbacks.
    pub nodes: Vec<NodeId>,
}

impl PlacementVector {
    /// The primary targets of this vector.
    pub fn primaries(&self) -> &[NodeId] {
        let n = (self.replicas as usize).min(self.nodes.len());
        &self.nodes[..n]
    }
}

/// Result of resolving a rule: one vector per `REP` descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    vectors: Vec<PlacementVector>,
}

impl Placement {
    /// The placement vectors, in `REP` order.
    pub fn vectors(&self) -> &[PlacementVector] {
        &self.vectors
    }

    /// Re-order every vector by the HRW score of `object_id`.
    ///
    /// The node set stays the container's; only the preference order changes
    /// from object to object, which spreads primaries across the vector.
    pub fn for_object(&self, object_id: &ObjectId) -> Placement {
        let vectors = self
            .vectors
            .iter()
            .map(|v| {
                let mut nodes = v.nodes.clone();
                hrw_sort(&mut nodes, object_id.as_bytes());
                PlacementVector {
                    replicas: v.replicas,
                    nodes,
                }
            })
            .collect();
        Placement { vectors }
    }

    /// Primary targets of every vector, deduplicated, in order.
    pub fn primary_targets(&self) -> Vec<NodeId> {
        dedup(self.vectors.iter().flat_map(|v| v.primaries().iter()))
    }

    /// Every node of every vector, deduplicated, in order.
    pub fn nodes(&self) -> Vec<NodeId> {
        dedup(self.vectors.iter().flat_map(|v| v.nodes.iter()))
    }

    /// Whether `node_id` appears in any vector.
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.vectors.iter().any(|v| v.nodes.contains(node_id))
    }

    /// Total number of copies the rule requires.
    pub fn required_copies(&self) -> usize {
        self.vectors.iter().map(|v| v.replicas as usize).sum()
    }
}

/// Rendezvous score of `node_id` for `pivot`: the first 8 bytes of
/// `blake3(pivot ++ node_id)` as a little-endian u64.
pub fn hrw_score(pivot: &[u8], node_id: &NodeId) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(pivot);
    hasher.update(node_id.as_bytes());
    let hash = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Sort nodes by descending HRW score for `pivot`, ties broken by node id.
pub fn hrw_sort(nodes: &mut [NodeId], pivot: &[u8]) {
    nodes.sort_by_cached_key(|id| (std::cmp::Reverse(hrw_score(pivot, id)), *id));
}

/// Resolve `rule` against `candidates` for the container `pivot`.
///
/// Unreachable candidates are never selected. Each selector yields at least
/// its `count` and at most `count * CBF` nodes; each `REP` must find at least
/// `count` nodes in its selector.
pub fn resolve(
    rule: &PlacementRule,
    candidates: &[NodeRecord],
    pivot: &ContainerId,
) -> Result<Placement, PlacementError> {
    let cbf = rule.effective_backup_factor() as usize;

    // Deduplicate by id; the BTreeMap also fixes the iteration order.
    let live: BTreeMap<NodeId, &NodeRecord> = candidates
        .iter()
        .filter(|n| n.reachable())
        .map(|n| (n.node_id, n))
        .collect();
    let mut live_ids: Vec<NodeId> = live.keys().copied().collect();
    hrw_sort(&mut live_ids, pivot.as_bytes());

    let mut vectors = Vec::with_capacity(rule.replicas.len());

    if rule.selectors.is_empty() {
        for replica in &rule.replicas {
            let needed = replica.count as usize;
            if live_ids.len() < needed {
                return Err(PlacementError::InsufficientNodes {
                    selector: replica.to_string(),
                    needed,
                    available: live_ids.len(),
                });
            }
            let take = live_ids.len().min(needed * cbf);
            vectors.push(PlacementVector {
                replicas: replica.count,
                nodes: live_ids[..take].to_vec(),
            });
        }
    } else {
        let selected: Vec<Vec<NodeId>> = rule
            .selectors
            .iter()
            .map(|sel| select(rule, sel, &live_ids, &live, cbf))
            .collect::<Result<_, _>>()?;

        for replica in &rule.replicas {
            let nodes = match &replica.selector {
                Some(name) => {
                    let idx = rule
                        .selectors
                        .iter()
                        .position(|s| s.name.as_deref() == Some(name.as_str()))
                        .ok_or_else(|| {
                            PlacementError::Invalid(format!("unknown selector {name}"))
                        })?;
                    selected[idx].clone()
                }
                None => dedup(selected.iter().flatten()),
            };

            let needed = replica.count as usize;
            if nodes.len() < needed {
                return Err(PlacementError::InsufficientNodes {
                    selector: replica.to_string(),
                    needed,
                    available: nodes.len(),
                });
            }
            vectors.push(PlacementVector {
                replicas: replica.count,
                nodes,
            });
        }
    }

    debug!(
        container = %pivot,
        live = live_ids.len(),
        vectors = vectors.len(),
        "resolved placement"
    );
    Ok(Placement { vectors })
}

/// Apply one selector to the HRW-ordered live nodes.
fn select(
    rule: &PlacementRule,
    selector: &Selector,
    ordered: &[NodeId],
    live: &BTreeMap<NodeId, &NodeRecord>,
    cbf: usize,
) -> Result<Vec<NodeId>, PlacementError> {
    let filter = if selector.filter == ANY_FILTER {
        None
    } else {
        Some(rule.filter(&selector.filter).ok_or_else(|| {
            PlacementError::Invalid(format!("unknown filter {}", selector.filter))
        })?)
    };

    let matching: Vec<&NodeRecord> = ordered
        .iter()
        .filter_map(|id| live.get(id).copied())
        .filter(|n| filter.is_none_or(|f| f.expr.matches(&n.attributes)))
        .collect();

    let needed = selector.count as usize;
    let max = needed * cbf;

    let (chosen, available): (Vec<NodeId>, usize) = match (&selector.attribute, selector.clause)
    {
        (None, _) => {
            let chosen: Vec<NodeId> = matching.iter().take(max).map(|n| n.node_id).collect();
            let available = matching.len();
            (chosen, available)
        }
        (Some(attr), Clause::Same) => {
            // Groups in order of first appearance, i.e. by their best node.
            let mut groups: Vec<(&str, Vec<NodeId>)> = Vec::new();
            for node in &matching {
                let Some(value) = node.attributes.get(attr) else {
                    continue;
                };
                match groups.iter_mut().find(|(v, _)| *v == value.as_str()) {
                    Some((_, members)) => members.push(node.node_id),
                    None => groups.push((value.as_str(), vec![node.node_id])),
                }
            }
            let largest = groups.iter().map(|(_, m)| m.len()).max().unwrap_or(0);
            match groups.into_iter().find(|(_, m)| m.len() >= needed) {
                Some((_, mut members)) => {
                    members.truncate(max);
                    (members, largest)
                }
                None => (Vec::new(), largest),
            }
        }
        // `IN attr` without a clause keeps attribute values apart, like DISTINCT.
        (Some(attr), Clause::Distinct | Clause::Unspecified) => {
            let mut seen = HashSet::new();
            let distinct: Vec<NodeId> = matching
                .iter()
                .filter(|n| {
                    n.attributes
                        .get(attr)
                        .is_some_and(|v| seen.insert(v.clone()))
                })
                .map(|n| n.node_id)
                .collect();
            let available = distinct.len();
            (distinct.into_iter().take(max).collect(), available)
        }
    };

    if chosen.len() < needed {
        return Err(PlacementError::InsufficientNodes {
            selector: selector.to_string(),
            needed,
            available,
        });
    }
    Ok(chosen)
}

fn dedup<'a>(ids: impl Iterator<Item = &'a NodeId>) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(**id)).copied().collect()
}
