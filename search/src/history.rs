//! Per-trace history reconstruction and digest-index assignment.

use crate::result::DigestStatus;
use crate::result::Trace;
use crate::result::TraceGroup;
use crate::window::WindowContext;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use vdiff_trace_store::Digest;
use vdiff_trace_store::HistoryRow;
use vdiff_trace_store::Label;
use vdiff_trace_store::Params;
use vdiff_trace_store::TraceId;

/// Most distinct digests a trace group draws, the "other" bucket included.
pub const MAX_DISTINCT_DIGESTS: usize = 9;

/// Indices handed out by recency before falling back to frequency.
const RECENT_SLOTS: usize = 3;

/// Digest per window commit, `None` where the trace produced nothing.
pub type AlignedHistory = Vec<Option<Digest>>;

/// Lays history rows out along the window. Every requested trace gets an
/// entry; traces without rows come back all-missing.
pub fn align_histories(
    window: &WindowContext,
    ids: &[TraceId],
    rows: Vec<HistoryRow>,
) -> HashMap<TraceId, AlignedHistory> {
    let mut aligned: HashMap<TraceId, AlignedHistory> = ids
        .iter()
        .map(|id| (id.clone(), vec![None; window.len()]))
        .collect();
    for row in rows {
        let Some(index) = window.index_of(&row.commit_id) else {
            continue;
        };
        if let Some(slot) = aligned
            .get_mut(&row.trace_id)
            .and_then(|history| history.get_mut(index))
        {
            *slot = Some(row.digest);
        }
    }
    aligned
}

/// Palette produced by digest-index assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestPalette {
    /// `digests[i]` is drawn with index `i`.
    digests: Vec<Digest>,
    lookup: HashMap<Digest, i32>,
    other_bucket: Option<i32>,
    total: usize,
}

impl DigestPalette {
    /// Index for `digest`; digests without their own index share the last
    /// one.
    pub fn index_of(&self, digest: &Digest) -> i32 {
        self.lookup
            .get(digest)
            .copied()
            .unwrap_or((MAX_DISTINCT_DIGESTS - 1) as i32)
    }

    pub fn digests(&self) -> &[Digest] {
        &self.digests
    }

    pub fn other_bucket(&self) -> Option<i32> {
        self.other_bucket
    }

    /// Distinct digests seen, the primary included.
    pub fn total(&self) -> usize {
        self.total
    }
}

#[derive(Debug, Default)]
struct Tally {
    count: usize,
    last_seen: usize,
}

/// Assigns small indices to the digests of a set of traces.
///
/// The primary digest gets 0. Up to three of the most recently seen
/// digests follow, then the most frequent ones until nine indices are used.
/// When more digests exist than fit, the rest share the last index with the
/// digest that owns it.
pub fn assign_digest_indices(primary: &Digest, histories: &[&AlignedHistory]) -> DigestPalette {
    let mut tallies: BTreeMap<&Digest, Tally> = BTreeMap::new();
    for history in histories {
        for (index, digest) in history.iter().enumerate() {
            let Some(digest) = digest else {
                continue;
            };
            let tally = tallies.entry(digest).or_default();
            tally.count += 1;
            tally.last_seen = tally.last_seen.max(index);
        }
    }

    let total = tallies.len() + usize::from(!tallies.contains_key(primary));
    let overflow = total > MAX_DISTINCT_DIGESTS;

    let mut digests = vec![primary.clone()];
    let mut assigned: HashSet<&Digest> = HashSet::from([primary]);

    let mut by_recency: Vec<(&Digest, &Tally)> = tallies
        .iter()
        .filter(|(digest, _)| !assigned.contains(*digest))
        .map(|(digest, tally)| (*digest, tally))
        .collect();
    by_recency.sort_by_key(|(digest, tally)| (Reverse(tally.last_seen), Reverse(tally.count), *digest));
    for (digest, _) in by_recency.into_iter().take(RECENT_SLOTS) {
        if digests.len() >= MAX_DISTINCT_DIGESTS {
            break;
        }
        assigned.insert(digest);
        digests.push(digest.clone());
    }

    let mut by_count: Vec<(&Digest, &Tally)> = tallies
        .iter()
        .filter(|(digest, _)| !assigned.contains(*digest))
        .map(|(digest, tally)| (*digest, tally))
        .collect();
    by_count.sort_by_key(|(digest, tally)| (Reverse(tally.count), Reverse(tally.last_seen), *digest));
    for (digest, _) in by_count {
        if digests.len() >= MAX_DISTINCT_DIGESTS {
            break;
        }
        digests.push(digest.clone());
    }

    let lookup = digests
        .iter()
        .enumerate()
        .map(|(i, digest)| (digest.clone(), i as i32))
        .collect();
    DigestPalette {
        digests,
        lookup,
        other_bucket: overflow.then_some((MAX_DISTINCT_DIGESTS - 1) as i32),
        total,
    }
}

/// Builds the visualization payload for one result.
pub fn build_trace_group(
    primary: &Digest,
    traces: &[(TraceId, Params)],
    histories: &HashMap<TraceId, AlignedHistory>,
    labels: &HashMap<Digest, Label>,
    window_len: usize,
) -> TraceGroup {
    let empty = vec![None; window_len];
    let ordered: Vec<&AlignedHistory> = traces
        .iter()
        .map(|(id, _)| histories.get(id).unwrap_or(&empty))
        .collect();
    let palette = assign_digest_indices(primary, &ordered);

    let traces = traces
        .iter()
        .zip(&ordered)
        .map(|((id, params), history)| Trace {
            id: id.clone(),
            digest_indices: history
                .iter()
                .map(|cell| cell.as_ref().map_or(-1, |digest| palette.index_of(digest)))
                .collect(),
            params: params.clone(),
        })
        .collect();

    TraceGroup {
        traces,
        digests: palette
            .digests()
            .iter()
            .map(|digest| DigestStatus {
                digest: digest.clone(),
                label: labels.get(digest).copied().unwrap_or_default(),
            })
            .collect(),
        other_bucket: palette.other_bucket(),
        total_digests: palette.total(),
    }
}
