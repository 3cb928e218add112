//! Capability registry: the merged tool catalog of all ready backends.
//!
//! Built once after every handshake has finished and shared read-only through
//! an `Arc`. Each tool name maps to an ordered list of candidate backends:
//! the first backend (in discovery order) to export a name owns its
//! descriptor and is tried first; later exporters are kept as fallbacks.
//!
//! Owners are held as `Weak` references so the registry never keeps a
//! connection alive past gateway shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;

use super::connection::BackendConnection;
use super::errors::GatewayError;
use super::types::ToolDescriptor;

// ─── Types ───────────────────────────────────────────────────────────────────

/// One backend exporting a tool, with the descriptor it advertised.
#[derive(Debug, Clone)]
struct Owner {
    conn: Weak<BackendConnection>,
    descriptor: ToolDescriptor,
}

impl Owner {
    fn ready(&self) -> Option<Arc<BackendConnection>> {
        self.conn.upgrade().filter(|c| c.is_ready())
    }
}

/// A tool in the merged catalog with its candidate backends.
#[derive(Debug, Clone)]
pub struct RegisteredTool {
    /// Descriptor as advertised by the first backend to register the name.
    pub descriptor: ToolDescriptor,
    /// Exporting backends, preferred first.
    owners: Vec<Owner>,
}

impl RegisteredTool {
    /// Number of backends that exported this tool at discovery time.
    pub fn candidate_count(&self) -> usize {
        self.owners.len()
    }

    /// Descriptor of the first exporter that is still ready. Fallback
    /// owners may advertise a different schema than the discovery owner.
    pub fn active_descriptor(&self) -> Option<&ToolDescriptor> {
        self.owners
            .iter()
            .find(|o| o.ready().is_some())
            .map(|o| &o.descriptor)
    }
}

/// Tool name → ordered candidate backends.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    /// Tools in registration order.
    tools: Vec<RegisteredTool>,
    /// Tool name → index into `tools`.
    index: HashMap<String, usize>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// List every ready connection's tools and merge them.
    ///
    /// Listings run concurrently, but results are inserted in discovery order
    /// so the preferred owner of a shared name does not depend on which
    /// backend answered first. A connection whose listing fails is marked
    /// failed and contributes nothing.
    pub async fn build(connections: &[Arc<BackendConnection>], timeout: Duration) -> Self {
        let mut ready: Vec<&Arc<BackendConnection>> =
            connections.iter().filter(|c| c.is_ready()).collect();
        ready.sort_by_key(|c| c.order());

        let listings = join_all(ready.iter().map(|conn| conn.client().list_tools(timeout))).await;

        let mut registry = Self::new();
        for (conn, listing) in ready.into_iter().zip(listings) {
            match listing {
                Ok(tools) => {
                    tracing::info!(backend = %conn.name(), tool_count = tools.len(), "discovered tools");
                    registry.register(conn, tools);
                }
                Err(e) => {
                    tracing::warn!(backend = %conn.name(), error = %e, "tool listing failed");
                    conn.mark_failed(format!("tool listing failed: {e}"));
                }
            }
        }

        tracing::info!(tool_count = registry.len(), "capability registry built");
        registry
    }

    /// Register the tools exported by one connection.
    ///
    /// A name seen for the first time is owned by `conn`. A name already
    /// registered by another backend gets `conn` appended as a fallback.
    /// Repeats within the same backend's catalog are ignored.
    pub fn register(&mut self, conn: &Arc<BackendConnection>, tools: Vec<ToolDescriptor>) {
        for tool in tools {
            match self.index.get(&tool.name) {
                Some(&idx) => {
                    let owner = self.owner_name(idx).unwrap_or_default();
                    let entry = &mut self.tools[idx];
                    let already_listed = entry
                        .owners
                        .iter()
                        .any(|o| o.conn.upgrade().is_some_and(|c| Arc::ptr_eq(&c, conn)));
                    if already_listed {
                        tracing::debug!(backend = %conn.name(), tool = %tool.name, "duplicate tool in catalog ignored");
                        continue;
                    }
                    tracing::info!(
                        tool = %tool.name,
                        backend = %conn.name(),
                        owner = %owner,
                        "tool name conflict: keeping first owner, adding fallback"
                    );
                    entry.owners.push(Owner {
                        conn: Arc::downgrade(conn),
                        descriptor: tool,
                    });
                }
                None => {
                    self.index.insert(tool.name.clone(), self.tools.len());
                    self.tools.push(RegisteredTool {
                        descriptor: tool.clone(),
                        owners: vec![Owner {
                            conn: Arc::downgrade(conn),
                            descriptor: tool,
                        }],
                    });
                }
            }
        }
    }

    /// Ready candidates for `tool_name`, preferred first.
    ///
    /// Connections that were dropped or are no longer `Ready` are skipped;
    /// when nothing remains the tool is reported as not found.
    pub fn resolve(&self, tool_name: &str) -> Result<Vec<Arc<BackendConnection>>, GatewayError> {
        let not_found = || GatewayError::ToolNotFound {
            name: tool_name.to_string(),
        };
        let entry = self.index.get(tool_name).map(|&i| &self.tools[i]).ok_or_else(not_found)?;

        let candidates: Vec<Arc<BackendConnection>> =
            entry.owners.iter().filter_map(Owner::ready).collect();

        if candidates.is_empty() {
            return Err(not_found());
        }
        Ok(candidates)
    }

    /// Name of the backend that owns `tool_name`'s descriptor.
    pub fn owner_of(&self, tool_name: &str) -> Option<String> {
        self.index.get(tool_name).and_then(|&i| self.owner_name(i))
    }

    /// Look up a registered tool by name.
    pub fn get_tool(&self, tool_name: &str) -> Option<&RegisteredTool> {
        self.index.get(tool_name).map(|&i| &self.tools[i])
    }

    /// Tools that still have at least one ready backend, in registration
    /// order, each described by its first ready exporter.
    pub fn available_tools(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .filter_map(RegisteredTool::active_descriptor)
            .cloned()
            .collect()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.descriptor.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Check that all required top-level fields in the input schema of the
    /// first ready exporter are present in `arguments`.
    ///
    /// Schemas without a `required` array accept anything.
    pub fn validate_tool_call(
        &self,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> Result<(), GatewayError> {
        let descriptor = self
            .get_tool(tool_name)
            .and_then(RegisteredTool::active_descriptor)
            .ok_or_else(|| GatewayError::ToolNotFound {
                name: tool_name.to_string(),
            })?;

        let Some(required) = descriptor.input_schema.get("required").and_then(|r| r.as_array())
        else {
            return Ok(());
        };

        for field in required {
            if let Some(field_name) = field.as_str() {
                if arguments.get(field_name).is_none() {
                    return Err(GatewayError::InvalidArguments {
                        tool: tool_name.to_string(),
                        reason: format!("missing required field: '{field_name}'"),
                    });
                }
            }
        }

        Ok(())
    }

    fn owner_name(&self, idx: usize) -> Option<String> {
        self.tools[idx]
            .owners
            .first()
            .and_then(|o| o.conn.upgrade())
            .map(|c| c.name().to_string())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
