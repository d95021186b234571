//! Identifier types used throughout convsync.
//!
//! Machines are identified by UUID v7 (generated once per device and
//! persisted). Conversations keep the identifier the editor assigned them.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Separator between an original conversation id and the machine id that
/// produced a divergent version, e.g. `abc.conflict-0190...`.
pub const CONFLICT_MARKER: &str = ".conflict-";

/// Unique identifier for a machine (device) in the sync network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(Uuid);

impl MachineId {
    /// Creates a new machine ID with the current timestamp.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a machine ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parses a machine ID from a string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for MachineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MachineId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Stable identifier of a conversation.
///
/// The id doubles as the name of the conversation's local directory and as
/// part of its blob keys, so it must be a single, non-hidden path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationId(String);

impl ConversationId {
    /// Validates and wraps a conversation id.
    pub fn new(id: impl Into<String>) -> Result<Self, Error> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidConversationId(id, "empty"));
        }
        if id.starts_with('.') {
            return Err(Error::InvalidConversationId(id, "must not start with '.'"));
        }
        if id.contains(['/', '\\']) {
            return Err(Error::InvalidConversationId(id, "must not contain path separators"));
        }
        if id.chars().any(char::is_control) {
            return Err(Error::InvalidConversationId(id, "must not contain control characters"));
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id of the conflict copy holding `machine`'s divergent version of this
    /// conversation.
    #[must_use]
    pub fn conflict_copy(&self, machine: MachineId) -> Self {
        Self(format!("{}{CONFLICT_MARKER}{machine}", self.0))
    }

    /// For a conflict copy id, returns the original id and the machine that
    /// produced the divergent version.
    #[must_use]
    pub fn conflict_origin(&self) -> Option<(ConversationId, MachineId)> {
        let (original, machine) = self.0.rsplit_once(CONFLICT_MARKER)?;
        let machine = MachineId::parse(machine).ok()?;
        let original = ConversationId::new(original).ok()?;
        Some((original, machine))
    }

    /// Returns true if this id names a conflict copy.
    #[must_use]
    pub fn is_conflict_copy(&self) -> bool {
        self.conflict_origin().is_some()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConversationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ConversationId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ConversationId> for String {
    fn from(id: ConversationId) -> Self {
        id.0
    }
}

impl AsRef<str> for ConversationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
