//! Routing-update event types.
//!
//! The messaging plugin publishes one message per membership change. The
//! controller only relies on the fields modelled here; anything else the
//! plugin sends (protocols, mappings, scaling hints) is ignored.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Action Constants
// =============================================================================

/// Canonical wire names of every routing action.
pub mod actions {
    pub const CREATE_APPLICATION: &str = "create_application";
    pub const DELETE_APPLICATION: &str = "delete_application";
    pub const ADD_GEAR: &str = "add_gear";
    pub const REMOVE_GEAR: &str = "remove_gear";
}

// =============================================================================
// Action
// =============================================================================

/// What happened to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingAction {
    #[serde(alias = "create-application")]
    CreateApplication,
    #[serde(alias = "delete-application")]
    DeleteApplication,
    #[serde(alias = "add-gear")]
    AddGear,
    #[serde(alias = "remove-gear")]
    RemoveGear,
}

impl RoutingAction {
    /// Canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingAction::CreateApplication => actions::CREATE_APPLICATION,
            RoutingAction::DeleteApplication => actions::DELETE_APPLICATION,
            RoutingAction::AddGear => actions::ADD_GEAR,
            RoutingAction::RemoveGear => actions::REMOVE_GEAR,
        }
    }

    /// Whether the action addresses a single gear (and so needs address/port).
    pub fn is_gear_action(&self) -> bool {
        matches!(self, RoutingAction::AddGear | RoutingAction::RemoveGear)
    }
}

impl fmt::Display for RoutingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingAction {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().replace('-', "_").as_str() {
            actions::CREATE_APPLICATION => Ok(RoutingAction::CreateApplication),
            actions::DELETE_APPLICATION => Ok(RoutingAction::DeleteApplication),
            actions::ADD_GEAR => Ok(RoutingAction::AddGear),
            actions::REMOVE_GEAR => Ok(RoutingAction::RemoveGear),
            _ => Err(EventError::UnknownAction(s.to_string())),
        }
    }
}

// =============================================================================
// Gear
// =============================================================================

/// Public endpoint of one application instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gear {
    pub address: String,
    pub port: u16,
}

impl fmt::Display for Gear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

// =============================================================================
// Routing Update
// =============================================================================

/// A validated routing-update event.
///
/// Gear actions always carry a [`Gear`]; application actions never need one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingUpdate {
    pub action: RoutingAction,
    pub app_name: String,
    pub namespace: String,
    #[serde(flatten)]
    pub gear: Option<WireGear>,
}

/// Gear fields as they appear on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireGear {
    pub public_address: String,
    pub public_port: u16,
}

/// Payload exactly as the plugin sends it, before validation.
#[derive(Debug, Deserialize)]
struct RawRoutingUpdate {
    action: String,
    #[serde(default)]
    app_name: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    public_address: Option<String>,
    #[serde(default)]
    public_port: Option<u16>,
}

impl RoutingUpdate {
    pub fn create_application(app_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::application(RoutingAction::CreateApplication, app_name, namespace)
    }

    pub fn delete_application(app_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::application(RoutingAction::DeleteApplication, app_name, namespace)
    }

    pub fn add_gear(
        app_name: impl Into<String>,
        namespace: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self::gear_event(RoutingAction::AddGear, app_name, namespace, address, port)
    }

    pub fn remove_gear(
        app_name: impl Into<String>,
        namespace: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self::gear_event(RoutingAction::RemoveGear, app_name, namespace, address, port)
    }

    fn application(
        action: RoutingAction,
        app_name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            action,
            app_name: app_name.into(),
            namespace: namespace.into(),
            gear: None,
        }
    }

    fn gear_event(
        action: RoutingAction,
        app_name: impl Into<String>,
        namespace: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            action,
            app_name: app_name.into(),
            namespace: namespace.into(),
            gear: Some(WireGear {
                public_address: address.into(),
                public_port: port,
            }),
        }
    }

    /// Decode and validate a payload.
    pub fn from_json(value: serde_json::Value) -> Result<Self, EventError> {
        let raw: RawRoutingUpdate = serde_json::from_value(value)?;
        let action: RoutingAction = raw.action.parse()?;
        let name = action.as_str();

        let app_name = required(raw.app_name, name, "app_name")?;
        let namespace = required(raw.namespace, name, "namespace")?;

        let gear = if action.is_gear_action() {
            let public_address = required(raw.public_address, name, "public_address")?;
            let public_port = raw.public_port.ok_or(EventError::MissingField {
                action: name,
                field: "public_port",
            })?;
            if public_port == 0 {
                return Err(EventError::InvalidPayload(format!(
                    "{name} event has public_port 0"
                )));
            }
            Some(WireGear {
                public_address,
                public_port,
            })
        } else {
            None
        };

        Ok(Self {
            action,
            app_name,
            namespace,
            gear,
        })
    }

    /// The gear addressed by a gear action.
    pub fn gear(&self) -> Option<Gear> {
        self.gear.as_ref().map(|g| Gear {
            address: g.public_address.clone(),
            port: g.public_port,
        })
    }
}

fn required(
    value: Option<String>,
    action: &'static str,
    field: &'static str,
) -> Result<String, EventError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(EventError::MissingField { action, field }),
    }
}

// =============================================================================
// Tests
// =============================================================================
