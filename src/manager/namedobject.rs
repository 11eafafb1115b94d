use serde::{
    Deserialize,
    Serialize
};

/// The `name` field every configuration entry carries; other fields are
/// ignored here and parsed by the entry's own settings type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedJsonObject {
    name: String
}

impl NamedJsonObject {
    pub fn new(name: String) -> NamedJsonObject {
        NamedJsonObject { name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
