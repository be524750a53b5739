//! Local database handle.

/// The local side of a replication.
///
/// The controller only needs the identifier the server uses to address the
/// database in a `_replicate` body: its name for databases on the same
/// server, or a full URL.
pub trait LocalDatabase: Send + Sync {
    /// Identifier used as `source` (push) or `target` (pull).
    fn identifier(&self) -> String;
}

/// A database known only by its name or URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedDatabase {
    name: String,
}

impl NamedDatabase {
    /// Creates a handle for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl LocalDatabase for NamedDatabase {
    fn identifier(&self) -> String {
        self.name.clone()
    }
}
