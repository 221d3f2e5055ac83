//! Session lookups against the relational user store.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::Result;

/// Lookup seam over the relational user store.
///
/// `lookup` flattens the row for a session id into a field mapping; an
/// empty mapping means "no such session". The database itself lives
/// behind this trait and outside the crate.
#[async_trait::async_trait]
pub trait SessionSource: Send + Sync + 'static {
    /// Fields for `session_id`, empty when unknown.
    async fn lookup(&self, session_id: &str)
        -> Result<HashMap<String, String>>;
}

/// A fixed in-memory session table.
///
/// Serves development and tests; inserts replace the whole row.
#[derive(Debug, Default)]
pub struct StaticSessions {
    rows: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl StaticSessions {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the row for `session_id`.
    pub fn insert(
        &self,
        session_id: impl Into<String>,
        fields: HashMap<String, String>,
    ) {
        self.rows.write().insert(session_id.into(), fields);
    }
}

#[async_trait::async_trait]
impl SessionSource for StaticSessions {
    async fn lookup(
        &self,
        session_id: &str,
    ) -> Result<HashMap<String, String>> {
        Ok(self.rows.read().get(session_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_sessions_are_empty() {
        let sessions = StaticSessions::new();
        sessions.insert(
            "u1",
            HashMap::from([("username".to_string(), "Ada".to_string())]),
        );
        assert_eq!(
            sessions.lookup("u1").await.unwrap().get("username"),
            Some(&"Ada".to_string())
        );
        assert!(sessions.lookup("nobody").await.unwrap().is_empty());
    }
}
