use std::collections::HashMap;

use serde_json::Value;

use convoai_core::types::ServerId;

use crate::rpc::AdvertisedTool;

/// One advertised tool, qualified by its origin server. Lives for a single
/// model-pipeline turn.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub origin_server_id: ServerId,
    /// Name as the server advertised it.
    pub tool_name: String,
    /// Name as presented to the model — differs from `tool_name` only when
    /// two servers advertise the same name.
    pub presented_name: String,
    pub description: String,
    pub parameter_schema: Value,
}

/// The per-turn function catalog: an ordered tool list plus the reverse
/// route from presented name back to `(server_id, tool_name)`.
///
/// A value type — built fresh each turn, never retained, so a newly enabled
/// server appears immediately and a disabled one vanishes.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: Vec<ToolDescriptor>,
    route: HashMap<String, (ServerId, String)>,
    endpoints: HashMap<ServerId, String>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one server's advertised tools into the catalog. Call in
    /// registration order: the first server to advertise a name keeps the
    /// bare name, later duplicates get a deterministic
    /// `name__{server-id prefix}` suffix.
    pub fn add_server_tools(
        &mut self,
        server_id: &ServerId,
        endpoint_url: &str,
        advertised: Vec<AdvertisedTool>,
    ) {
        if !advertised.is_empty() {
            self.endpoints
                .insert(server_id.clone(), endpoint_url.to_string());
        }
        for tool in advertised {
            let presented = if let Some((claimed_by, _)) = self.route.get(&tool.name) {
                if claimed_by == server_id {
                    // a server advertising the same name twice is broken;
                    // keep the first advertisement
                    continue;
                }
                disambiguate(&tool.name, server_id)
            } else {
                tool.name.clone()
            };

            // A suffix collision would still be ambiguous — skip rather than
            // overwrite the route.
            if self.route.contains_key(&presented) {
                continue;
            }

            self.route
                .insert(presented.clone(), (server_id.clone(), tool.name.clone()));
            self.tools.push(ToolDescriptor {
                origin_server_id: server_id.clone(),
                tool_name: tool.name,
                presented_name: presented,
                description: tool.description,
                parameter_schema: tool.parameters,
            });
        }
    }

    /// Resolve a presented name to its owning server and original name.
    pub fn resolve(&self, presented_name: &str) -> Option<(&ServerId, &str)> {
        self.route
            .get(presented_name)
            .map(|(server, name)| (server, name.as_str()))
    }

    /// Endpoint URL for a server that contributed tools this turn.
    pub fn endpoint(&self, server_id: &ServerId) -> Option<&str> {
        self.endpoints.get(server_id).map(String::as_str)
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

fn disambiguate(name: &str, server_id: &ServerId) -> String {
    let prefix: String = server_id.as_str().chars().take(8).collect();
    format!("{}__{}", name, prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> AdvertisedTool {
        AdvertisedTool {
            name: name.to_string(),
            description: String::new(),
            parameters: json!({"type": "object"}),
        }
    }

    #[test]
    fn first_server_wins_the_bare_name() {
        let s1 = ServerId::from("server-one-0001");
        let s2 = ServerId::from("server-two-0002");

        let mut catalog = ToolCatalog::new();
        catalog.add_server_tools(&s1, "http://one", vec![tool("get_current_time")]);
        catalog.add_server_tools(&s2, "http://two", vec![tool("get_current_time")]);

        assert_eq!(catalog.len(), 2);

        let (server, name) = catalog.resolve("get_current_time").unwrap();
        assert_eq!(server, &s1);
        assert_eq!(name, "get_current_time");

        let (server, name) = catalog.resolve("get_current_time__server-t").unwrap();
        assert_eq!(server, &s2);
        assert_eq!(name, "get_current_time");

        assert_eq!(catalog.endpoint(&s1), Some("http://one"));
        assert_eq!(catalog.endpoint(&s2), Some("http://two"));
    }

    #[test]
    fn every_presented_name_resolves_to_exactly_one_route() {
        let s1 = ServerId::from("aaaaaaaa-1");
        let s2 = ServerId::from("bbbbbbbb-2");

        let mut catalog = ToolCatalog::new();
        catalog.add_server_tools(&s1, "http://a", vec![tool("search"), tool("fetch")]);
        catalog.add_server_tools(&s2, "http://b", vec![tool("search")]);

        for descriptor in catalog.tools() {
            let (server, name) = catalog.resolve(&descriptor.presented_name).unwrap();
            assert_eq!(server, &descriptor.origin_server_id);
            assert_eq!(name, descriptor.tool_name);
        }
    }

    #[test]
    fn unknown_name_does_not_resolve() {
        let catalog = ToolCatalog::new();
        assert!(catalog.resolve("nope").is_none());
        assert!(catalog.is_empty());
    }

    #[test]
    fn same_server_duplicate_is_dropped_not_overwritten() {
        let s1 = ServerId::from("cccccccc-3");
        let mut catalog = ToolCatalog::new();
        catalog.add_server_tools(&s1, "http://c", vec![tool("echo"), tool("echo")]);

        // bare name routes once; the duplicate can't silently steal it
        assert_eq!(catalog.resolve("echo").unwrap().0, &s1);
        assert_eq!(catalog.len(), 1);
    }
}
