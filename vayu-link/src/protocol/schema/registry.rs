//! Runtime message-definition registry
//!
//! One registry per SDK instance, shared by the dynamic receiver of every
//! connection. Decodes take the read lock, schema loads the write lock.

use super::definition::MessageDef;
use crate::error::SchemaError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// MAVLink common dialect, compiled into the crate
///
/// Loaded in include order since `load_xml` does not follow `<include>`.
const BUILTIN_SCHEMAS: [&str; 3] = [
    include_str!("../../../schemas/minimal.xml"),
    include_str!("../../../schemas/standard.xml"),
    include_str!("../../../schemas/common.xml"),
];

#[derive(Default)]
struct Definitions {
    by_id: HashMap<u32, Arc<MessageDef>>,
    id_by_name: HashMap<String, u32>,
}

/// Message definitions keyed by id and name
#[derive(Default)]
pub struct SchemaRegistry {
    definitions: RwLock<Definitions>,
}

impl SchemaRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the common dialect
    pub fn with_builtin() -> Result<Self, SchemaError> {
        let registry = Self::new();
        for xml in BUILTIN_SCHEMAS {
            registry.load_xml(xml)?;
        }
        Ok(registry)
    }

    /// Merge the messages of a MAVLink XML document
    ///
    /// All-or-nothing: on error the registry is unchanged. A message whose id
    /// is already known replaces the old definition. Returns the number of
    /// messages loaded.
    pub fn load_xml(&self, xml: &str) -> Result<usize, SchemaError> {
        let doc = roxmltree::Document::parse(xml)?;

        for include in doc.descendants().filter(|n| n.has_tag_name("include")) {
            log::debug!(
                "Ignoring <include>{}</include>, load it separately",
                include.text().unwrap_or_default()
            );
        }

        let parsed = doc
            .descendants()
            .filter(|n| n.has_tag_name("message"))
            .map(MessageDef::from_xml)
            .collect::<Result<Vec<_>, _>>()?;

        let count = parsed.len();
        let mut guard = self.definitions.write();
        let definitions = &mut *guard;
        for def in parsed {
            if let Some(old) = definitions.by_id.get(&def.id)
                && old.name != def.name
            {
                log::info!("Message id {} redefined: {} -> {}", def.id, old.name, def.name);
                definitions.id_by_name.remove(&old.name);
            }
            definitions.id_by_name.insert(def.name.clone(), def.id);
            definitions.by_id.insert(def.id, Arc::new(def));
        }
        log::debug!(
            "Loaded {} message definitions ({} total)",
            count,
            definitions.by_id.len()
        );
        Ok(count)
    }

    pub fn message(&self, id: u32) -> Option<Arc<MessageDef>> {
        self.definitions.read().by_id.get(&id).cloned()
    }

    pub fn message_by_name(&self, name: &str) -> Option<Arc<MessageDef>> {
        let definitions = self.definitions.read();
        let id = definitions.id_by_name.get(name)?;
        definitions.by_id.get(id).cloned()
    }

    pub fn crc_extra(&self, id: u32) -> Option<u8> {
        self.definitions.read().by_id.get(&id).map(|def| def.crc_extra)
    }

    pub fn id_to_name(&self, id: u32) -> Result<String, SchemaError> {
        self.message(id)
            .map(|def| def.name.clone())
            .ok_or(SchemaError::UnknownMessageId(id))
    }

    pub fn name_to_id(&self, name: &str) -> Result<u32, SchemaError> {
        self.definitions
            .read()
            .id_by_name
            .get(name)
            .copied()
            .ok_or_else(|| SchemaError::UnknownMessageName(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.definitions.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
