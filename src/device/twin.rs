//! Seams between a device session and the cloud-facing twin.

use std::sync::Arc;

use async_trait::async_trait;

use super::Result;
use crate::descriptor::{DeviceDescriptor, InterfaceDefinition};

/// Twin client the session publishes to. Implemented by the host application.
#[async_trait]
pub trait TwinClient: Send + Sync {
    /// Register an interface. Publishing the same id twice is an error.
    async fn publish_interface(&self, interface: &InterfaceDefinition) -> anyhow::Result<()>;

    async fn send_event(&self, interface_id: &str, event_name: &str, value: &str) -> anyhow::Result<()>;

    async fn update_property(
        &self,
        interface_id: &str,
        property_name: &str,
        value: &str,
    ) -> anyhow::Result<()>;

    /// Route cloud-originated calls for `interface_id` through `dispatch`.
    async fn bind_methods(
        &self,
        interface_id: &str,
        dispatch: Arc<dyn MethodDispatch>,
    ) -> anyhow::Result<()>;
}

/// Handle given to the twin for calling back into the session.
#[async_trait]
pub trait MethodDispatch: Send + Sync {
    async fn invoke_command(&self, name: &str, input: &str) -> Result<String>;

    async fn write_property(&self, name: &str, value: &str) -> Result<String>;
}

/// Local listener for session activity. Called from the dispatch task in
/// arrival order; implementations must not block.
pub trait SessionObserver: Send + Sync {
    fn on_interfaces_discovered(&self, _descriptor: &DeviceDescriptor) {}

    fn on_event(&self, _interface_id: &str, _event_name: &str, _value: &str) {}

    fn on_property_update(&self, _interface_id: &str, _property_name: &str, _value: &str) {}
}
