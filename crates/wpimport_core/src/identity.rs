use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::model::{ContentKind, DestinationId};

/// Frozen copy of the identity map taken at page start.
pub type IdentitySnapshot = HashMap<(ContentKind, u64), DestinationId>;

/// Source id to destination id, for one run. Shared across write workers.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: Mutex<IdentitySnapshot>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (ContentKind, u64, DestinationId)>,
    {
        let map = entries
            .into_iter()
            .map(|(kind, external_id, id)| ((kind, external_id), id))
            .collect();
        Self {
            entries: Mutex::new(map),
        }
    }

    /// Returns the previous destination id when the key was already mapped.
    pub fn insert(
        &self,
        kind: ContentKind,
        external_id: u64,
        id: DestinationId,
    ) -> Option<DestinationId> {
        self.lock().insert((kind, external_id), id)
    }

    pub fn get(&self, kind: ContentKind, external_id: u64) -> Option<DestinationId> {
        self.lock().get(&(kind, external_id)).copied()
    }

    pub fn contains(&self, kind: ContentKind, external_id: u64) -> bool {
        self.lock().contains_key(&(kind, external_id))
    }

    pub fn snapshot(&self) -> IdentitySnapshot {
        self.lock().clone()
    }

    /// Entries sorted by kind then external id.
    pub fn entries(&self) -> Vec<(ContentKind, u64, DestinationId)> {
        let mut out: Vec<_> = self
            .lock()
            .iter()
            .map(|((kind, external_id), id)| (*kind, *external_id, *id))
            .collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IdentitySnapshot> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_isolated_from_later_inserts() {
        let map = IdentityMap::new();
        map.insert(ContentKind::Author, 3, DestinationId(10));
        let snapshot = map.snapshot();
        map.insert(ContentKind::Tag, 4, DestinationId(11));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(ContentKind::Tag, 4), Some(DestinationId(11)));
        assert_eq!(map.get(ContentKind::Category, 4), None);
    }

    #[test]
    fn entries_round_trip_through_from_entries() {
        let map = IdentityMap::new();
        map.insert(ContentKind::Post, 9, DestinationId(3));
        map.insert(ContentKind::Author, 1, DestinationId(1));

        let restored = IdentityMap::from_entries(map.entries());
        assert_eq!(
            restored.entries(),
            vec![
                (ContentKind::Author, 1, DestinationId(1)),
                (ContentKind::Post, 9, DestinationId(3)),
            ]
        );
        assert!(restored.contains(ContentKind::Post, 9));
    }

    #[test]
    fn insert_reports_previous_mapping() {
        let map = IdentityMap::new();
        assert_eq!(map.insert(ContentKind::Media, 5, DestinationId(2)), None);
        assert_eq!(
            map.insert(ContentKind::Media, 5, DestinationId(7)),
            Some(DestinationId(2))
        );
    }
}
