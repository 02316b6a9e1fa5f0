use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Direction of the traffic a resource sees.
///
/// Only inbound traffic is subject to system protection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    In,
    #[default]
    Out,
}

/// Rough classification of a resource, carried through to metrics output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    #[default]
    Common,
    Web,
    Rpc,
    ApiGateway,
    DbSql,
}

/// Identity of a protected resource. Two wrappers are the same resource when
/// their names match, whatever their direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceWrapper {
    pub name: String,
    pub entry_type: EntryType,
    pub resource_type: ResourceType,
}

impl ResourceWrapper {
    pub fn new(name: impl Into<String>, entry_type: EntryType) -> Self {
        Self {
            name: name.into(),
            entry_type,
            resource_type: ResourceType::Common,
        }
    }

    pub fn with_resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_inbound(&self) -> bool {
        self.entry_type == EntryType::In
    }
}

impl PartialEq for ResourceWrapper {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ResourceWrapper {}

impl std::hash::Hash for ResourceWrapper {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for ResourceWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
