use std::sync::Arc;

use convoai_core::types::Subject;

use crate::error::Result;
use crate::manager::StoreManager;
use crate::types::ToolServerRegistration;

/// Thin facade the dispatcher uses to find a user's active tool servers.
///
/// Exists so the dispatcher depends on one narrow question ("which servers
/// should I probe for this owner?") instead of the whole store surface.
#[derive(Clone)]
pub struct ToolRegistry {
    store: Arc<StoreManager>,
}

impl ToolRegistry {
    pub fn new(store: Arc<StoreManager>) -> Self {
        Self { store }
    }

    /// Enabled registrations in creation order. Built fresh per turn —
    /// enabling or disabling a server is visible on the very next turn.
    pub fn active_tool_servers(&self, owner: &Subject) -> Result<Vec<ToolServerRegistration>> {
        self.store.list_tool_servers(owner, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use rusqlite::Connection;

    #[test]
    fn only_enabled_servers_are_active() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let store = Arc::new(StoreManager::new(conn));
        let owner = Subject::from("alice");

        store
            .create_tool_server(&owner, "up", "", "http://up", true)
            .unwrap();
        store
            .create_tool_server(&owner, "down", "", "http://down", false)
            .unwrap();

        let registry = ToolRegistry::new(store);
        let active = registry.active_tool_servers(&owner).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "up");
    }
}
