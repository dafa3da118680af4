use serde::Serialize;

use super::Schema;

/// Naming shared by commands, properties and events.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct FieldDefinition {
    pub name: String,
    pub display_name: String,
    pub description: String,
}

impl FieldDefinition {
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyDefinition {
    #[serde(flatten)]
    pub field: FieldDefinition,
    pub units: String,
    pub required: bool,
    pub writeable: bool,
    pub data_schema: Schema,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventDefinition {
    #[serde(flatten)]
    pub field: FieldDefinition,
    pub units: String,
    pub data_schema: Schema,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandDefinition {
    #[serde(flatten)]
    pub field: FieldDefinition,
    pub request_schema: Schema,
    pub response_schema: Schema,
}

macro_rules! field_name {
    ($($ty:ty),*) => {
        $(impl $ty {
            pub fn name(&self) -> &str {
                &self.field.name
            }
        })*
    };
}

field_name!(PropertyDefinition, EventDefinition, CommandDefinition);

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct InterfaceDefinition {
    pub id: String,
    pub properties: Vec<PropertyDefinition>,
    pub commands: Vec<CommandDefinition>,
    pub events: Vec<EventDefinition>,
}

impl InterfaceDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.name() == name)
    }

    pub fn command(&self, name: &str) -> Option<&CommandDefinition> {
        self.commands.iter().find(|c| c.name() == name)
    }

    pub fn event(&self, name: &str) -> Option<&EventDefinition> {
        self.events.iter().find(|e| e.name() == name)
    }

    /// Interface document handed to the twin when publishing.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// A field located in the descriptor, with the position of its interface.
#[derive(Debug)]
pub struct Located<'a, T> {
    pub interface_index: usize,
    pub interface: &'a InterfaceDefinition,
    pub definition: &'a T,
}

/// Self-description reported by the device during the handshake.
///
/// Lookups walk interfaces in descriptor order and return the first match.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DeviceDescriptor {
    pub version: u8,
    pub display_name: String,
    pub interfaces: Vec<InterfaceDefinition>,
}

impl DeviceDescriptor {
    pub fn find_command(&self, name: &str) -> Option<Located<'_, CommandDefinition>> {
        self.locate(|iface| iface.command(name))
    }

    pub fn find_property(&self, name: &str) -> Option<Located<'_, PropertyDefinition>> {
        self.locate(|iface| iface.property(name))
    }

    pub fn find_event(&self, name: &str) -> Option<Located<'_, EventDefinition>> {
        self.locate(|iface| iface.event(name))
    }

    pub fn interface_ids(&self) -> Vec<String> {
        self.interfaces.iter().map(|i| i.id.clone()).collect()
    }

    fn locate<'a, T>(
        &'a self,
        lookup: impl Fn(&'a InterfaceDefinition) -> Option<&'a T>,
    ) -> Option<Located<'a, T>> {
        self.interfaces
            .iter()
            .enumerate()
            .find_map(|(interface_index, interface)| {
                lookup(interface).map(|definition| Located {
                    interface_index,
                    interface,
                    definition,
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DeviceDescriptor {
        let mut first = InterfaceDefinition::new("http://example.com/sensor");
        first.events.push(EventDefinition {
            field: FieldDefinition::new("temp", "Temperature", ""),
            units: "C".into(),
            data_schema: Schema::Float,
        });
        let mut second = InterfaceDefinition::new("http://example.com/led");
        second.events.push(EventDefinition {
            field: FieldDefinition::new("temp", "Shadowed", ""),
            units: "C".into(),
            data_schema: Schema::Int,
        });
        second.commands.push(CommandDefinition {
            field: FieldDefinition::new("blink", "Blink", "Blink the LED"),
            request_schema: Schema::Int,
            response_schema: Schema::Int,
        });
        DeviceDescriptor {
            version: 1,
            display_name: "Sample".into(),
            interfaces: vec![first, second],
        }
    }

    #[test]
    fn test_first_match_wins() {
        let descriptor = sample();
        let found = descriptor.find_event("temp").unwrap();
        assert_eq!(found.interface_index, 0);
        assert_eq!(found.definition.data_schema, Schema::Float);

        let blink = descriptor.find_command("blink").unwrap();
        assert_eq!(blink.interface_index, 1);
        assert!(descriptor.find_property("missing").is_none());
    }

    #[test]
    fn test_interface_json_flattens_fields() {
        let descriptor = sample();
        let json = descriptor.interfaces[1].to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["id"], "http://example.com/led");
        assert_eq!(value["commands"][0]["name"], "blink");
        assert_eq!(value["commands"][0]["request_schema"], "Int");
    }
}
