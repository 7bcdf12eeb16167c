use std::collections::HashMap;

/// A content-addressed in-memory store.
///
/// Keys are lowercase hex SHA-1 strings and values are the hashed bytes, so
/// overwrites are idempotent. Entries live for the process lifetime.
#[derive(Default)]
pub struct Storage {
    items: HashMap<String, Vec<u8>>,
}

impl Storage {
    /// Constructs a new, empty `Storage`.
    pub fn new() -> Self {
        Storage {
            items: HashMap::new(),
        }
    }

    /// Inserts an item. The value buffer is copied to decouple it from the
    /// caller's memory.
    pub fn insert(&mut self, key: String, value: &[u8]) {
        self.items.insert(key, value.to_vec());
    }

    /// Returns the value associated with `key`, if any.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.items.get(key).map(|value| value.as_slice())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
