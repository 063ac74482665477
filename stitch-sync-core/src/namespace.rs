use serde::{Deserialize, Serialize};
use std::fmt;

/// A (database, collection) pair identifying a logical collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MongoNamespace {
    pub database: String,
    pub collection: String,
}

impl MongoNamespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Name of the persisted user-document collection: `sync_user_<db>.<coll>`.
    pub fn user_collection(&self) -> String {
        format!("sync_user_{}.{}", self.database, self.collection)
    }

    /// Name of the per-namespace undo collection: `sync_undo_<db>.<coll>`.
    pub fn undo_collection(&self) -> String {
        format!("sync_undo_{}.{}", self.database, self.collection)
    }
}

impl fmt::Display for MongoNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_pair() {
        let a = MongoNamespace::new("db", "coll");
        let b = MongoNamespace::new("db", "coll");
        let c = MongoNamespace::new("db", "other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn collection_names_are_namespaced() {
        let ns = MongoNamespace::new("t", "c");
        assert_eq!(ns.undo_collection(), "sync_undo_t.c");
        assert_eq!(ns.user_collection(), "sync_user_t.c");
    }
}
