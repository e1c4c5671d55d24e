// Vertex layout builder
//
// Accumulates vertex bindings and attributes. Attribute offsets are packed
// automatically: each attribute starts where the previous attribute of the
// same binding ended.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::VertexFormat;
use crate::error::ValidationError;

/// Whether a binding advances per vertex or per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VertexRate {
    PerVertex,
    PerInstance,
}

impl fmt::Display for VertexRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PerVertex => "per-vertex",
            Self::PerInstance => "per-instance",
        })
    }
}

/// One vertex buffer binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VertexBinding {
    pub binding_index: u32,
    pub stride_bytes: u32,
    pub rate: VertexRate,
}

/// One shader input attribute sourced from a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VertexInputEntry {
    pub location: u32,
    pub binding: u32,
    pub format: VertexFormat,
    pub offset_bytes: u32,
}

impl VertexInputEntry {
    /// First byte past this attribute within its binding's stride.
    pub fn end_bytes(&self) -> u32 {
        self.offset_bytes.saturating_add(self.format.size_bytes())
    }
}

/// Ordered vertex bindings plus ordered attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct VertexInputDescription {
    pub bindings: Vec<VertexBinding>,
    pub attributes: Vec<VertexInputEntry>,
}

impl VertexInputDescription {
    pub fn binding(&self, binding_index: u32) -> Option<&VertexBinding> {
        self.bindings.iter().find(|b| b.binding_index == binding_index)
    }

    pub fn attributes_of(&self, binding_index: u32) -> impl Iterator<Item = &VertexInputEntry> {
        self.attributes.iter().filter(move |a| a.binding == binding_index)
    }
}

/// Builds a [`VertexInputDescription`] with auto-computed attribute offsets.
#[derive(Debug, Default)]
pub struct VertexLayoutBuilder {
    description: VertexInputDescription,
    // binding index -> next free byte offset
    cursors: BTreeMap<u32, u32>,
}

impl VertexLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a vertex buffer binding.
    pub fn add_vertex_binding(
        &mut self,
        binding_index: u32,
        stride_bytes: u32,
        rate: VertexRate,
    ) -> Result<&mut Self, ValidationError> {
        if self.cursors.contains_key(&binding_index) {
            return Err(ValidationError::DuplicateVertexBinding(binding_index));
        }

        self.description.bindings.push(VertexBinding {
            binding_index,
            stride_bytes,
            rate,
        });
        self.cursors.insert(binding_index, 0);
        Ok(self)
    }

    /// Append an attribute to `binding` and return the offset it was placed at.
    ///
    /// The binding must already exist and `location` must be unused. On error
    /// the builder is left untouched. Stride overflow is not checked here; the
    /// compiler reports it as [`ValidationError::StrideOverflow`].
    pub fn add_vertex_attribute(
        &mut self,
        location: u32,
        binding: u32,
        format: VertexFormat,
    ) -> Result<u32, ValidationError> {
        let offset_bytes = *self
            .cursors
            .get(&binding)
            .ok_or(ValidationError::InvalidBinding { location, binding })?;

        if self.description.attributes.iter().any(|a| a.location == location) {
            return Err(ValidationError::DuplicateLocation(location));
        }

        self.description.attributes.push(VertexInputEntry {
            location,
            binding,
            format,
            offset_bytes,
        });
        self.cursors
            .insert(binding, offset_bytes.saturating_add(format.size_bytes()));

        Ok(offset_bytes)
    }

    /// Current contents, for inspection before finishing.
    pub fn description(&self) -> &VertexInputDescription {
        &self.description
    }

    pub fn finish(self) -> VertexInputDescription {
        self.description
    }
}
