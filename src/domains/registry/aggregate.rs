//! One immutable generation of the aggregated tool set.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::warn;

use crate::domains::tools::ToolDescriptor;

/// The union of every discovered tool at one point in time.
///
/// Built off to the side and published whole; never mutated afterwards.
#[derive(Debug, Default)]
pub struct AggregatedRegistry {
    generation: u64,
    tools: HashMap<String, Arc<ToolDescriptor>>,
    source_servers: BTreeSet<String>,
}

impl AggregatedRegistry {
    /// Generation zero: no servers, no tools.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Assemble a generation from per-server discovery results.
    ///
    /// If two servers produce the same qualified name (`a/b` + `c` against
    /// `a` + `b/c`), the first one seen wins.
    pub fn new(
        generation: u64,
        discovered: impl IntoIterator<Item = (String, Vec<ToolDescriptor>)>,
    ) -> Self {
        let mut tools = HashMap::new();
        let mut source_servers = BTreeSet::new();

        for (server, descriptors) in discovered {
            for descriptor in descriptors {
                match tools.entry(descriptor.qualified_name().to_string()) {
                    Entry::Occupied(existing) => {
                        let kept: &Arc<ToolDescriptor> = existing.get();
                        warn!(
                            "Qualified name {} from server {} collides with server {}, skipping",
                            existing.key(),
                            server,
                            kept.server()
                        );
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(Arc::new(descriptor));
                    }
                }
            }
            source_servers.insert(server);
        }

        Self {
            generation,
            tools,
            source_servers,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Look up a tool by qualified name.
    pub fn get(&self, qualified_name: &str) -> Option<Arc<ToolDescriptor>> {
        self.tools.get(qualified_name).cloned()
    }

    /// Every qualified name, sorted.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every descriptor, sorted by qualified name.
    pub fn tools(&self) -> Vec<Arc<ToolDescriptor>> {
        let mut tools: Vec<_> = self.tools.values().cloned().collect();
        tools.sort_by(|a, b| a.qualified_name().cmp(b.qualified_name()));
        tools
    }

    /// Servers whose tools made it into this generation.
    pub fn source_servers(&self) -> &BTreeSet<String> {
        &self.source_servers
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
