//! Tool discovery for one downstream server.

use std::collections::HashSet;

use tracing::{info, instrument, warn};

use super::descriptor::ToolDescriptor;
use super::schema::ParamSchema;
use crate::domains::connections::{ConnectionManager, ConnectionResult, ToolInfo};

/// Acquire a connection to `server`, list its tools and wrap each one in a
/// [`ToolDescriptor`].
///
/// A tool whose schema cannot be translated is still exposed, with
/// unconstrained parameters.
#[instrument(skip(connections))]
pub async fn discover_tools(
    connections: &ConnectionManager,
    server: &str,
) -> ConnectionResult<Vec<ToolDescriptor>> {
    let connection = connections.acquire(server).await?;
    let advertised = connection.client().list_tools().await?;

    let descriptors = describe(connections, server, advertised);
    info!("Discovered {} tools on {}", descriptors.len(), server);
    Ok(descriptors)
}

/// Turn a raw advertisement into descriptors.
pub fn describe(
    connections: &ConnectionManager,
    server: &str,
    advertised: Vec<ToolInfo>,
) -> Vec<ToolDescriptor> {
    let mut seen = HashSet::new();
    let mut descriptors = Vec::with_capacity(advertised.len());

    for info in advertised {
        if info.name.is_empty() {
            warn!("{} advertised a tool without a name, skipping", server);
            continue;
        }
        if !seen.insert(info.name.clone()) {
            warn!("{} advertised {} twice, keeping the first", server, info.name);
            continue;
        }

        let parameters = match ParamSchema::from_input_schema(info.input_schema.as_ref()) {
            Ok(schema) => schema,
            Err(e) => {
                warn!("Schema of {}/{} is unusable, accepting any arguments: {}", server, info.name, e);
                ParamSchema::Any
            }
        };

        descriptors.push(ToolDescriptor::new(
            server,
            info.name,
            info.description.unwrap_or_default(),
            parameters,
            connections.clone(),
        ));
    }

    descriptors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::connections::ConnectionSettings;
    use crate::domains::directory::MemoryDirectory;
    use serde_json::json;
    use std::sync::Arc;

    fn info(value: serde_json::Value) -> ToolInfo {
        serde_json::from_value(value).unwrap()
    }

    fn pool() -> ConnectionManager {
        let directory = Arc::new(MemoryDirectory::new());
        ConnectionManager::new(directory.clone(), directory, ConnectionSettings::default())
    }

    #[test]
    fn test_bad_schema_degrades_single_tool() {
        let advertised = vec![
            info(json!({"name": "good", "inputSchema": {"type": "object", "properties": {"n": {"type": "integer"}}}})),
            info(json!({"name": "broken", "inputSchema": {"properties": {"x": {"type": "string", "pattern": "("}}}})),
            info(json!({"name": "bare"})),
        ];

        let descriptors = describe(&pool(), "a", advertised);
        let names: Vec<_> = descriptors.iter().map(|d| d.qualified_name()).collect();
        assert_eq!(names, vec!["a/good", "a/broken", "a/bare"]);

        assert!(matches!(descriptors[0].parameters(), ParamSchema::Object(_)));
        assert!(matches!(descriptors[1].parameters(), ParamSchema::Any));
        assert!(descriptors[2].parameters().validate(&json!({})).is_ok());
    }

    #[test]
    fn test_duplicates_and_unnamed_are_skipped() {
        let advertised = vec![
            info(json!({"name": "echo", "description": "first"})),
            info(json!({"name": "echo", "description": "second"})),
            info(json!({"name": ""})),
        ];

        let descriptors = describe(&pool(), "a", advertised);
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].description(), "first");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_discover_over_socket() {
        use crate::testing::{FakeServer, tool};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.sock");
        let _server = FakeServer::with_tools(vec![tool("sum", json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"]
        }))])
        .serve(&path);

        let directory = Arc::new(MemoryDirectory::new());
        directory.insert_socket("b", &path);
        let connections =
            ConnectionManager::new(directory.clone(), directory, ConnectionSettings::default());

        let descriptors = discover_tools(&connections, "b").await.unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].qualified_name(), "b/sum");

        let result = descriptors[0].invoke(Some(json!({"a": 2, "b": 3}))).await.unwrap();
        assert_eq!(result["content"][0]["text"], "5");
    }
}
