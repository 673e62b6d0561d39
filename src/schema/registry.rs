//! Descriptor registry: built once, frozen, shared read-only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info};

use super::descriptor::{FieldType, Label, MessageDescriptor, MethodDescriptor};
use crate::error::{BridgeError, Result};

/// Largest legal field number (2^29 - 1).
pub const MAX_FIELD_TAG: u32 = 536_870_911;
/// Field numbers reserved by the wire format implementation.
pub const RESERVED_TAGS: core::ops::RangeInclusive<u32> = 19_000..=19_999;

/// Collects descriptors and validates them as a set.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    messages: HashMap<String, MessageDescriptor>,
    methods: HashMap<String, MethodDescriptor>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message. Identical re-registration is a no-op.
    pub fn message(&mut self, desc: MessageDescriptor) -> Result<&mut Self> {
        if let Some(existing) = self.messages.get(desc.name()) {
            if *existing != desc {
                return Err(BridgeError::DescriptorConflict(desc.name().to_owned()));
            }
            return Ok(self);
        }
        self.messages.insert(desc.name().to_owned(), desc);
        Ok(self)
    }

    /// Register a method. Identical re-registration is a no-op.
    pub fn method(&mut self, desc: MethodDescriptor) -> Result<&mut Self> {
        if let Some(existing) = self.methods.get(&desc.path) {
            if *existing != desc {
                return Err(BridgeError::DescriptorConflict(desc.path.clone()));
            }
            return Ok(self);
        }
        self.methods.insert(desc.path.clone(), desc);
        Ok(self)
    }

    /// Validate and freeze.
    pub fn build(self) -> Result<Arc<DescriptorRegistry>> {
        let Self {
            mut messages,
            methods,
        } = self;

        for msg in messages.values() {
            validate_message(msg, &messages)?;
        }
        for m in methods.values() {
            let well_formed = m.path.strip_prefix('/').is_some_and(|rest| {
                let parts: Vec<&str> = rest.split('/').collect();
                parts.len() == 2 && parts.iter().all(|p| !p.is_empty())
            });
            if !well_formed {
                return Err(BridgeError::Config(format!(
                    "method path '{}' is not /package.Service/Method",
                    m.path
                )));
            }
            for name in [&m.input, &m.output] {
                if !messages.contains_key(name) {
                    return Err(BridgeError::UnknownDescriptor(name.clone()));
                }
            }
        }

        for msg in messages.values_mut() {
            msg.build_index();
        }

        info!(
            "SCHEMA: registry frozen ({} messages, {} methods)",
            messages.len(),
            methods.len()
        );
        Ok(Arc::new(DescriptorRegistry { messages, methods }))
    }
}

fn validate_message(
    msg: &MessageDescriptor,
    all: &HashMap<String, MessageDescriptor>,
) -> Result<()> {
    let mut tags = HashSet::new();
    let mut host_names = HashSet::new();
    for f in msg.fields() {
        if f.tag == 0 || f.tag > MAX_FIELD_TAG || RESERVED_TAGS.contains(&f.tag) {
            return Err(BridgeError::Config(format!(
                "{}.{}: illegal field number {}",
                msg.name(),
                f.name,
                f.tag
            )));
        }
        if !tags.insert(f.tag) {
            return Err(BridgeError::Config(format!(
                "{}: duplicate field number {}",
                msg.name(),
                f.tag
            )));
        }
        if f.name.is_empty() || !host_names.insert(f.host_key()) {
            return Err(BridgeError::Config(format!(
                "{}: empty or duplicate field name '{}'",
                msg.name(),
                f.host_key()
            )));
        }
        if let FieldType::Map(key, value) = &f.ty {
            let legal = f.label == Label::Singular
                && key.is_valid_map_key()
                && !matches!(**value, FieldType::Map(..));
            if !legal {
                return Err(BridgeError::Config(format!(
                    "{}.{}: illegal map field {:?}",
                    msg.name(),
                    f.name,
                    f.ty
                )));
            }
        }
        if let Some(nested) = f.ty.referenced_message() {
            if !all.contains_key(nested) {
                return Err(BridgeError::UnknownDescriptor(nested.to_owned()));
            }
        }
    }
    debug!("SCHEMA: {} ok ({} fields)", msg.name(), msg.fields().len());
    Ok(())
}

/// Immutable, process-wide set of descriptors.
#[derive(Debug)]
pub struct DescriptorRegistry {
    messages: HashMap<String, MessageDescriptor>,
    methods: HashMap<String, MethodDescriptor>,
}

impl DescriptorRegistry {
    pub fn message(&self, name: &str) -> Result<&MessageDescriptor> {
        self.messages
            .get(name)
            .ok_or_else(|| BridgeError::UnknownDescriptor(name.to_owned()))
    }

    pub fn method(&self, path: &str) -> Result<&MethodDescriptor> {
        self.methods
            .get(path)
            .ok_or_else(|| BridgeError::UnknownDescriptor(path.to_owned()))
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}
