//! Edit capability for a participant on a document.
//!
//! Privileged participants may edit any document while connected.
//! Restricted participants may edit only their own documents, again only
//! while connected. Nobody edits offline.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::handlers::{HandlerRegistry, Subscription};
use crate::status::ConnectionStatus;

/// Document key of the shared privileged document.
pub const SHARED_DOCUMENT_KEY: &str = "teacher-code";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Privileged,
    Restricted,
}

impl Role {
    /// Name sent to the relay hub when joining a session.
    pub fn wire_name(self) -> &'static str {
        match self {
            Role::Privileged => "teacher",
            Role::Restricted => "student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Privileged => f.write_str("privileged"),
            Role::Restricted => f.write_str("restricted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown role: {0}")]
pub struct ParseRoleError(pub String);

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "privileged" | "teacher" => Ok(Role::Privileged),
            "restricted" | "student" => Ok(Role::Restricted),
            other => Err(ParseRoleError(other.to_string())),
        }
    }
}

/// Identity supplied by the external session layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub participant_id: String,
    pub display_name: String,
    pub role: Role,
}

impl SessionContext {
    pub fn new(participant_id: impl Into<String>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            participant_id: participant_id.into(),
            display_name: display_name.into(),
            role,
        }
    }

    /// Key of the document this participant writes by default.
    pub fn default_document_key(&self) -> String {
        match self.role {
            Role::Privileged => SHARED_DOCUMENT_KEY.to_string(),
            Role::Restricted => personal_document_key(&self.participant_id),
        }
    }
}

/// The personal document key of a participant.
pub fn personal_document_key(participant_id: &str) -> String {
    format!("student-{participant_id}")
}

/// Every key a restricted participant counts as their own.
pub fn own_document_keys(participant_id: &str) -> [String; 2] {
    [
        personal_document_key(participant_id),
        participant_id.to_string(),
    ]
}

fn is_own_document(document_key: &str, participant_id: &str) -> bool {
    !participant_id.is_empty()
        && own_document_keys(participant_id)
            .iter()
            .any(|k| k == document_key)
}

pub fn can_edit(
    role: Role,
    document_key: &str,
    participant_id: &str,
    connection: ConnectionStatus,
) -> bool {
    if !connection.is_connected() {
        return false;
    }
    match role {
        Role::Privileged => true,
        Role::Restricted => is_own_document(document_key, participant_id),
    }
}

struct GateInputs {
    role: Role,
    document_key: String,
    participant_id: String,
    connection: ConnectionStatus,
    value: bool,
}

impl GateInputs {
    fn evaluate(&self) -> bool {
        can_edit(
            self.role,
            &self.document_key,
            &self.participant_id,
            self.connection,
        )
    }
}

/// Reactive wrapper around [`can_edit`].
///
/// Listeners fire only when the computed capability actually flips.
pub struct PermissionGate {
    inputs: Mutex<GateInputs>,
    listeners: HandlerRegistry<(), bool>,
}

impl PermissionGate {
    pub fn new(context: &SessionContext, document_key: impl Into<String>) -> Self {
        let inputs = GateInputs {
            role: context.role,
            document_key: document_key.into(),
            participant_id: context.participant_id.clone(),
            connection: ConnectionStatus::Disconnected,
            value: false,
        };
        Self {
            inputs: Mutex::new(inputs),
            listeners: HandlerRegistry::new(),
        }
    }

    pub fn can_edit(&self) -> bool {
        self.inputs.lock().value
    }

    pub fn role(&self) -> Role {
        self.inputs.lock().role
    }

    pub fn document_key(&self) -> String {
        self.inputs.lock().document_key.clone()
    }

    pub fn set_role(&self, role: Role) {
        self.update(|inputs| inputs.role = role);
    }

    pub fn set_document_key(&self, document_key: &str) {
        self.update(|inputs| inputs.document_key = document_key.to_string());
    }

    pub fn set_connection(&self, connection: ConnectionStatus) {
        self.update(|inputs| inputs.connection = connection);
    }

    /// Called with the new capability whenever it changes.
    pub fn on_change<F>(&self, f: F) -> Subscription
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.listeners.subscribe((), f)
    }

    fn update(&self, apply: impl FnOnce(&mut GateInputs)) {
        let changed = {
            let mut inputs = self.inputs.lock();
            apply(&mut inputs);
            let next = inputs.evaluate();
            let changed = next != inputs.value;
            inputs.value = next;
            changed.then_some(next)
        };
        if let Some(value) = changed {
            log::debug!("Edit capability is now {value}");
            self.listeners.dispatch(&(), &value);
        }
    }
}

impl fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inputs = self.inputs.lock();
        f.debug_struct("PermissionGate")
            .field("role", &inputs.role)
            .field("document_key", &inputs.document_key)
            .field("connection", &inputs.connection)
            .field("can_edit", &inputs.value)
            .finish()
    }
}
