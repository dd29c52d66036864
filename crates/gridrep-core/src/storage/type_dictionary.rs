//! Type dictionary
//!
//! The type dictionary describes every persisted type by id. Its text form is
//! a JSON document replicated as a whole whenever it changes:
//!
//! ```json
//! { "types": [ { "type_id": 1000001, "type_name": "app.Customer",
//!                "role": "entity", "fields": [ { "name": "id", "type_name": "u64" } ] } ] }
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Role of a persisted type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeRole {
    /// Regular application entity
    #[default]
    Entity,
    /// Storage roots registry
    Root,
    /// Reference to the application root
    RootReference,
}

impl TypeRole {
    /// Root records must never be overwritten by replicated data
    pub fn is_root(self) -> bool {
        matches!(self, Self::Root | Self::RootReference)
    }
}

/// One persisted field of a type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Field name
    pub name: String,
    /// Persisted field type name
    pub type_name: String,
}

/// Persisted structure of one type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDefinition {
    /// Type id
    pub type_id: u64,
    /// Fully qualified type name
    pub type_name: String,
    /// Role of the type
    #[serde(default)]
    pub role: TypeRole,
    /// Persisted fields in storage order
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

impl TypeDefinition {
    /// Create a field-less entity type
    pub fn new(type_id: u64, type_name: impl Into<String>) -> Self {
        Self {
            type_id,
            type_name: type_name.into(),
            role: TypeRole::Entity,
            fields: Vec::new(),
        }
    }

    /// Set the role
    pub fn with_role(mut self, role: TypeRole) -> Self {
        self.role = role;
        self
    }

    /// Append a field
    pub fn with_field(mut self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.fields.push(FieldDefinition {
            name: name.into(),
            type_name: type_name.into(),
        });
        self
    }

    /// Same name, role and field layout
    pub fn equal_structure(&self, other: &TypeDefinition) -> bool {
        self.type_id == other.type_id
            && self.type_name == other.type_name
            && self.role == other.role
            && self.fields == other.fields
    }
}

impl fmt::Display for TypeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}{{", self.type_id, self.type_name)?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", field.name, field.type_name)?;
        }
        f.write_str("}")
    }
}

#[derive(Serialize, Deserialize)]
struct TypeDictionaryDocument {
    types: Vec<TypeDefinition>,
}

/// All known type definitions, keyed by type id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeDictionary {
    types: BTreeMap<u64, TypeDefinition>,
}

impl TypeDictionary {
    /// Empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the text form
    pub fn parse(text: &str) -> Result<Self> {
        let document: TypeDictionaryDocument = serde_json::from_str(text)?;
        let mut dictionary = Self::new();
        for definition in document.types {
            if dictionary.types.contains_key(&definition.type_id) {
                return Err(Error::decode(format!(
                    "Duplicate type id {} in type dictionary",
                    definition.type_id
                )));
            }
            dictionary.types.insert(definition.type_id, definition);
        }
        Ok(dictionary)
    }

    /// Render the text form
    pub fn assemble(&self) -> Result<String> {
        let document = TypeDictionaryDocument {
            types: self.types.values().cloned().collect(),
        };
        Ok(serde_json::to_string(&document)?)
    }

    /// Look up a type by id
    pub fn get(&self, type_id: u64) -> Option<&TypeDefinition> {
        self.types.get(&type_id)
    }

    /// Register a definition.
    ///
    /// Returns `true` if the type was new, `false` if a structurally equal
    /// definition already existed.
    pub fn register(&mut self, definition: TypeDefinition) -> Result<bool> {
        match self.types.get(&definition.type_id) {
            None => {
                self.types.insert(definition.type_id, definition);
                Ok(true)
            }
            Some(existing) if existing.equal_structure(&definition) => Ok(false),
            Some(existing) => Err(Error::SchemaDivergence {
                type_id: definition.type_id,
                local: existing.to_string(),
                remote: definition.to_string(),
            }),
        }
    }

    /// All definitions ordered by type id
    pub fn iter(&self) -> impl Iterator<Item = &TypeDefinition> {
        self.types.values()
    }

    /// Number of types
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// No types at all
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl FromIterator<TypeDefinition> for TypeDictionary {
    fn from_iter<I: IntoIterator<Item = TypeDefinition>>(iter: I) -> Self {
        Self {
            types: iter.into_iter().map(|t| (t.type_id, t)).collect(),
        }
    }
}
