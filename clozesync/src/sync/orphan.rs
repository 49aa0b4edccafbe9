use std::collections::{HashMap, HashSet};

use clozesync_core::NoteId;

use super::fingerprint::Fingerprint;

/// A cached card with no counterpart in this run's extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanCandidate {
    pub path: String,
    pub position: usize,
    pub fingerprint: Fingerprint,
    pub note_id: NoteId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveFilter {
    /// Real deletion candidates, to be confirmed by the user.
    pub presented: Vec<OrphanCandidate>,
    /// Entries whose note is now bound elsewhere; dropped without deleting.
    pub released: Vec<OrphanCandidate>,
    /// Moved to a card that got a different note; kept until a later run.
    pub deferred: Vec<OrphanCandidate>,
}

/// Separates moves from deletions once every file of the run is processed.
///
/// `created` maps fingerprints created this run to the ids they received;
/// `bound` holds ids still referenced by entries that are not candidates.
pub fn filter_moves(
    candidates: Vec<OrphanCandidate>,
    created: &HashMap<Fingerprint, Vec<NoteId>>,
    bound: &HashSet<NoteId>,
) -> MoveFilter {
    let mut filter = MoveFilter::default();
    for candidate in candidates {
        if bound.contains(&candidate.note_id) {
            filter.released.push(candidate);
            continue;
        }
        match created.get(&candidate.fingerprint) {
            Some(ids) if ids.contains(&candidate.note_id) => filter.released.push(candidate),
            Some(_) => filter.deferred.push(candidate),
            None => filter.presented.push(candidate),
        }
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(path: &str, content: &str, id: u64) -> OrphanCandidate {
        OrphanCandidate {
            path: path.to_string(),
            position: 0,
            fingerprint: Fingerprint::of(content),
            note_id: NoteId(id),
        }
    }

    #[test]
    fn splits_moves_from_deletions() {
        let created = HashMap::from([
            (Fingerprint::of("moved same note"), vec![NoteId(1)]),
            (Fingerprint::of("moved new note"), vec![NoteId(99)]),
        ]);
        let bound = HashSet::from([NoteId(3)]);
        let filter = filter_moves(
            vec![
                candidate("a.md", "moved same note", 1),
                candidate("a.md", "moved new note", 2),
                candidate("a.md", "shared", 3),
                candidate("a.md", "gone", 4),
            ],
            &created,
            &bound,
        );

        let ids = |list: &[OrphanCandidate]| list.iter().map(|c| c.note_id.0).collect::<Vec<_>>();
        assert_eq!(ids(&filter.released), vec![1, 3]);
        assert_eq!(ids(&filter.deferred), vec![2]);
        assert_eq!(ids(&filter.presented), vec![4]);
    }

    #[test]
    fn unknown_fingerprints_never_count_as_moves() {
        let created = HashMap::from([(Fingerprint::of(""), vec![NoteId(1)])]);
        let mut orphan = candidate("a.md", "", 1);
        orphan.fingerprint = Fingerprint::unknown();
        let filter = filter_moves(vec![orphan], &created, &HashSet::new());
        assert_eq!(filter.presented.len(), 1);
    }
}
