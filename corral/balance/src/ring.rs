use indexmap::IndexMap;

/// An insertion-ordered collection cycled through by [`Ring::next`], used by
/// both the round-robin chooser's available set and the sharded chooser's
/// per-shard pools. Removing an entry shifts later entries down rather than
/// swapping in the last one, so relative order -- and therefore the fairness
/// guarantee -- survives membership churn.
pub(crate) struct Ring<T> {
    items: IndexMap<String, T>,
    cursor: usize,
}

impl<T> Ring<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: IndexMap::new(),
            cursor: 0,
        }
    }

    pub(crate) fn insert(&mut self, id: String, value: T) {
        self.items.insert(id, value);
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<T> {
        let idx = self.items.get_index_of(id)?;
        let (_, value) = self.items.shift_remove_index(idx)?;
        if idx < self.cursor {
            self.cursor -= 1;
        }
        Some(value)
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub(crate) fn get(&self, id: &str) -> Option<&T> {
        self.items.get(id)
    }

    pub(crate) fn peer_ids(&self) -> impl Iterator<Item = String> + '_ {
        self.items.keys().cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the next entry in cyclic insertion order and advances the
    /// cursor. `None` if empty.
    pub(crate) fn next(&mut self) -> Option<(&str, &T)>
    where
        T: Clone,
    {
        if self.items.is_empty() {
            return None;
        }
        let idx = self.cursor % self.items.len();
        self.cursor = idx + 1;
        self.items.get_index(idx).map(|(k, v)| (k.as_str(), v))
    }
}
