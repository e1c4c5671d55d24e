// Resource binding builder
//
// Descriptor-set bindings and push-constant ranges. Push constants are packed
// per stage: a new range starts where the last range visible to any of its
// stages ended.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::DeviceLimits;
use crate::error::ValidationError;

/// A single programmable stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VulkanStage {
    Vertex,
    Fragment,
}

impl VulkanStage {
    pub const ALL: [VulkanStage; 2] = [VulkanStage::Vertex, VulkanStage::Fragment];

    pub fn name(self) -> &'static str {
        match self {
            Self::Vertex => "vertex",
            Self::Fragment => "fragment",
        }
    }
}

impl fmt::Display for VulkanStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// A set of stages a resource is visible to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct StageMask: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
    }
}

impl StageMask {
    pub fn stages(self) -> impl Iterator<Item = VulkanStage> {
        VulkanStage::ALL
            .into_iter()
            .filter(move |stage| self.contains(StageMask::from(*stage)))
    }
}

impl From<VulkanStage> for StageMask {
    fn from(stage: VulkanStage) -> Self {
        match stage {
            VulkanStage::Vertex => StageMask::VERTEX,
            VulkanStage::Fragment => StageMask::FRAGMENT,
        }
    }
}

impl fmt::Display for StageMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self.stages().map(VulkanStage::name).collect();
        f.write_str(&names.join("|"))
    }
}

/// A push-constant byte range and the stages that read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VulkanPushConstantEntry {
    pub stage: StageMask,
    pub offset_bytes: u32,
    pub size_bytes: u32,
}

impl VulkanPushConstantEntry {
    pub fn end_bytes(&self) -> u32 {
        self.offset_bytes.saturating_add(self.size_bytes)
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.offset_bytes < other.end_bytes() && other.offset_bytes < self.end_bytes()
    }
}

/// What a descriptor binding points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VulkanDescriptorSetType {
    /// A uniform buffer of `size_bytes`; one is allocated per swapchain image.
    UniformBuffer { size_bytes: u32 },
}

impl fmt::Display for VulkanDescriptorSetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UniformBuffer { size_bytes } => write!(f, "uniform-buffer size={size_bytes}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VulkanDescriptorSetEntryBinding {
    pub binding_index: u32,
    pub kind: VulkanDescriptorSetType,
    pub stage: StageMask,
}

/// One descriptor set: its bindings in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct VulkanDescriptorSetEntry {
    pub bindings: Vec<VulkanDescriptorSetEntryBinding>,
}

impl VulkanDescriptorSetEntry {
    pub fn binding(&self, binding_index: u32) -> Option<&VulkanDescriptorSetEntryBinding> {
        self.bindings.iter().find(|b| b.binding_index == binding_index)
    }
}

/// Push constants and descriptor sets of a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceBindings {
    pub push_constants: Vec<VulkanPushConstantEntry>,
    pub descriptor_sets: Vec<VulkanDescriptorSetEntry>,
}

/// Builds [`ResourceBindings`] against an injected push-constant budget.
#[derive(Debug)]
pub struct ResourceBindingBuilder {
    push_constant_limit: u32,
    bindings: ResourceBindings,
}

impl ResourceBindingBuilder {
    pub fn new(limits: &DeviceLimits) -> Self {
        Self {
            push_constant_limit: limits.max_push_constants_size,
            bindings: ResourceBindings::default(),
        }
    }

    /// Next free push-constant offset for every stage in `stage`.
    fn push_cursor(&self, stage: StageMask) -> u32 {
        self.bindings
            .push_constants
            .iter()
            .filter(|range| range.stage.intersects(stage))
            .map(VulkanPushConstantEntry::end_bytes)
            .max()
            .unwrap_or(0)
    }

    fn check_push_range(&self, range: &VulkanPushConstantEntry) -> Result<(), ValidationError> {
        if range.stage.is_empty() {
            return Err(ValidationError::EmptyStageMask);
        }
        if range.size_bytes == 0 || range.size_bytes % 4 != 0 || range.offset_bytes % 4 != 0 {
            return Err(ValidationError::MisalignedPushConstant {
                offset: range.offset_bytes,
                size: range.size_bytes,
            });
        }
        let end = range.offset_bytes as u64 + range.size_bytes as u64;
        if end > self.push_constant_limit as u64 {
            return Err(ValidationError::PushConstantOverflow {
                end: u32::try_from(end).unwrap_or(u32::MAX),
                limit: self.push_constant_limit,
            });
        }
        Ok(())
    }

    /// Append a push-constant range for `stage`, packed after the ranges
    /// already visible to it. The builder is unchanged when this fails.
    pub fn add_push_constant(
        &mut self,
        stage: impl Into<StageMask>,
        size_bytes: u32,
    ) -> Result<VulkanPushConstantEntry, ValidationError> {
        let stage = stage.into();
        let range = VulkanPushConstantEntry {
            stage,
            offset_bytes: self.push_cursor(stage),
            size_bytes,
        };
        self.check_push_range(&range)?;
        self.bindings.push_constants.push(range);
        Ok(range)
    }

    /// Append a push-constant range at an explicit offset. Overlap with other
    /// ranges of the same stage is reported when the pipeline is compiled.
    pub fn add_push_constant_range(
        &mut self,
        stage: impl Into<StageMask>,
        offset_bytes: u32,
        size_bytes: u32,
    ) -> Result<VulkanPushConstantEntry, ValidationError> {
        let range = VulkanPushConstantEntry {
            stage: stage.into(),
            offset_bytes,
            size_bytes,
        };
        self.check_push_range(&range)?;
        self.bindings.push_constants.push(range);
        Ok(range)
    }

    /// Add a binding to the current descriptor set (set 0 if none was started).
    pub fn add_descriptor_binding(
        &mut self,
        binding_index: u32,
        kind: VulkanDescriptorSetType,
        stage: impl Into<StageMask>,
    ) -> Result<&mut Self, ValidationError> {
        let stage = stage.into();
        if stage.is_empty() {
            return Err(ValidationError::EmptyStageMask);
        }
        if self.bindings.descriptor_sets.is_empty() {
            self.bindings.descriptor_sets.push(VulkanDescriptorSetEntry::default());
        }

        let set_index = self.bindings.descriptor_sets.len() - 1;
        let set = &mut self.bindings.descriptor_sets[set_index];
        if set.binding(binding_index).is_some() {
            return Err(ValidationError::DuplicateBinding {
                set: set_index as u32,
                binding: binding_index,
            });
        }

        set.bindings.push(VulkanDescriptorSetEntryBinding {
            binding_index,
            kind,
            stage,
        });
        Ok(self)
    }

    /// Start a new descriptor set; later bindings go into it. Returns its index.
    pub fn next_descriptor_set(&mut self) -> u32 {
        self.bindings.descriptor_sets.push(VulkanDescriptorSetEntry::default());
        (self.bindings.descriptor_sets.len() - 1) as u32
    }

    pub fn bindings(&self) -> &ResourceBindings {
        &self.bindings
    }

    pub fn finish(self) -> ResourceBindings {
        self.bindings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> ResourceBindingBuilder {
        ResourceBindingBuilder::new(&DeviceLimits::default())
    }

    #[test]
    fn push_constants_pack_per_stage() {
        let mut b = builder();
        let first = b.add_push_constant(VulkanStage::Vertex, 16).unwrap();
        let second = b.add_push_constant(VulkanStage::Vertex, 16).unwrap();

        assert_eq!((first.offset_bytes, first.end_bytes()), (0, 16));
        assert_eq!((second.offset_bytes, second.end_bytes()), (16, 32));
        assert!(!first.overlaps(&second));

        // Fragment has its own cursor.
        let fragment = b.add_push_constant(VulkanStage::Fragment, 8).unwrap();
        assert_eq!(fragment.offset_bytes, 0);
    }

    #[test]
    fn shared_range_starts_after_both_stages() {
        let mut b = builder();
        b.add_push_constant(VulkanStage::Vertex, 64).unwrap();
        b.add_push_constant(VulkanStage::Fragment, 16).unwrap();
        let shared = b.add_push_constant(StageMask::all(), 16).unwrap();
        assert_eq!(shared.offset_bytes, 64);
    }

    #[test]
    fn overflow_fails_and_leaves_ranges_unchanged() {
        let mut b = builder();
        b.add_push_constant(VulkanStage::Vertex, 16).unwrap();
        b.add_push_constant(VulkanStage::Vertex, 16).unwrap();
        let before = b.bindings().push_constants.clone();

        let err = b.add_push_constant(VulkanStage::Vertex, 100).unwrap_err();

        assert_eq!(err, ValidationError::PushConstantOverflow { end: 132, limit: 128 });
        assert_eq!(b.bindings().push_constants, before);
        // Exactly filling the budget is fine.
        assert!(b.add_push_constant(VulkanStage::Vertex, 96).is_ok());
    }

    #[test]
    fn injected_limit_is_respected() {
        let limits = DeviceLimits::default().with_push_constant_limit(256);
        let mut b = ResourceBindingBuilder::new(&limits);
        assert!(b.add_push_constant(VulkanStage::Vertex, 256).is_ok());
        assert!(b.add_push_constant(VulkanStage::Vertex, 4).is_err());
    }

    #[test]
    fn push_constant_sizes_must_be_aligned() {
        let mut b = builder();
        assert!(matches!(
            b.add_push_constant(VulkanStage::Vertex, 6),
            Err(ValidationError::MisalignedPushConstant { .. })
        ));
        assert!(matches!(
            b.add_push_constant(VulkanStage::Vertex, 0),
            Err(ValidationError::MisalignedPushConstant { .. })
        ));
        assert!(b.bindings().push_constants.is_empty());
    }

    #[test]
    fn duplicate_descriptor_binding_is_rejected() {
        let mut b = builder();
        let ubo = VulkanDescriptorSetType::UniformBuffer { size_bytes: 64 };
        b.add_descriptor_binding(0, ubo, VulkanStage::Vertex).unwrap();

        let err = b.add_descriptor_binding(0, ubo, VulkanStage::Fragment).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateBinding { set: 0, binding: 0 });

        // Same index in a new set is fine.
        assert_eq!(b.next_descriptor_set(), 1);
        b.add_descriptor_binding(0, ubo, VulkanStage::Fragment).unwrap();

        let bindings = b.finish();
        assert_eq!(bindings.descriptor_sets.len(), 2);
        assert_eq!(bindings.descriptor_sets[0].bindings.len(), 1);
    }

    #[test]
    fn stage_mask_display() {
        assert_eq!(StageMask::VERTEX.to_string(), "vertex");
        assert_eq!(StageMask::all().to_string(), "vertex|fragment");
        assert_eq!(StageMask::empty().to_string(), "none");
    }
}
