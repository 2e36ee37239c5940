use std::rc::Rc;

/// Compile-time map from names to environment slots.
///
/// A persistent list: [`IndexTable::extend`] prepends an entry and returns a
/// new table, leaving `self` untouched so enclosing scopes can keep using it.
/// A new entry takes the slot after the current head's slot, so slots grow
/// with declaration order and lookups walk from the most recent entry back.
#[derive(Debug, Clone, Default)]
pub struct IndexTable {
    head: Option<Rc<Entry>>,
    len: usize,
}

#[derive(Debug)]
struct Entry {
    name: String,
    slot: usize,
    next: Option<Rc<Entry>>,
}

impl IndexTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&self, name: &str) -> IndexTable {
        let slot = self.head.as_ref().map_or(0, |entry| entry.slot + 1);
        IndexTable {
            head: Some(Rc::new(Entry {
                name: name.to_string(),
                slot,
                next: self.head.clone(),
            })),
            len: self.len + 1,
        }
    }

    /// Extend with every name in order.
    pub fn extend_all<'n>(&self, names: impl IntoIterator<Item = &'n str>) -> IndexTable {
        names
            .into_iter()
            .fold(self.clone(), |table, name| table.extend(name))
    }

    /// Slot of the most recently declared `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        let mut cursor = self.head.as_deref();
        while let Some(entry) = cursor {
            if entry.name == name {
                return Some(entry.slot);
            }
            cursor = entry.next.as_deref();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
