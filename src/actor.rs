//! Actor identity attached to every `Task` and `LedgerEntry`: who opened the
//! task, as opposed to what it was asked to do. The core never reasons about
//! intent, so this is deliberately the only provenance field carried.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorKind {
    Human,
    Agent,
    System,
    McpClient,
    Other(String),
}

impl fmt::Display for ActorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorKind::Human => write!(f, "human"),
            ActorKind::Agent => write!(f, "agent"),
            ActorKind::System => write!(f, "system"),
            ActorKind::McpClient => write!(f, "mcp_client"),
            ActorKind::Other(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for ActorKind {
    fn from(s: &str) -> Self {
        match s {
            "human" => ActorKind::Human,
            "agent" => ActorKind::Agent,
            "system" => ActorKind::System,
            "mcp_client" => ActorKind::McpClient,
            other => ActorKind::Other(other.to_string()),
        }
    }
}

/// Serialized as its plain string form (`"human"`, `"agent"`, ... or the
/// raw custom string for `Other`), not as a tagged enum.
impl Serialize for ActorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ActorKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ActorKind::from(s.as_str()))
    }
}

/// Who opened a task or triggered an operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActorRef {
    kind: ActorKind,
    id: String,
    display_name: Option<String>,
}

impl ActorRef {
    pub fn new(kind: impl Into<ActorKind>, id: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err("actor id cannot be empty".to_string());
        }
        Ok(Self {
            kind: kind.into(),
            id,
            display_name: None,
        })
    }

    pub fn human(id: impl Into<String>) -> Result<Self, String> {
        Self::new(ActorKind::Human, id)
    }

    pub fn agent(name: impl Into<String>) -> Result<Self, String> {
        Self::new(ActorKind::Agent, name)
    }

    pub fn system(component: impl Into<String>) -> Result<Self, String> {
        Self::new(ActorKind::System, component)
    }

    pub fn mcp_client(client_id: impl Into<String>) -> Result<Self, String> {
        Self::new(ActorKind::McpClient, client_id)
    }

    pub fn kind(&self) -> &ActorKind {
        &self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn set_display_name(&mut self, display_name: Option<String>) {
        self.display_name = display_name;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_id() {
        assert!(ActorRef::human("").is_err());
    }

    #[test]
    fn kind_round_trips_through_display() {
        let a = ActorRef::agent("refactor-bot").unwrap();
        assert_eq!(a.kind().to_string(), "agent");
    }
}
