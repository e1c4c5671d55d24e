// Shader module loading
//
// Shader bytecode is compiled elsewhere; this only wraps SPIR-V words in
// modules and pairs them with the stages a pipeline declares.

use ash::vk;
use std::collections::BTreeMap;
use std::io::Cursor;

use super::VulkanDevice;
use crate::description::VulkanStage;
use crate::error::{GraphicsError, Result};

/// Create a shader module from SPIR-V bytes. The bytes need not be aligned.
pub fn load_shader_module(device: &VulkanDevice, spirv: &[u8]) -> Result<vk::ShaderModule> {
    let code = ash::util::read_spv(&mut Cursor::new(spirv)).map_err(GraphicsError::InvalidSpirv)?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

    let module = unsafe { device.device.create_shader_module(&create_info, None) }?;
    log::debug!("Created shader module ({} words)", code.len());
    Ok(module)
}

/// Shader modules keyed by stage. Non-owning: whoever loaded the modules
/// destroys them, which is safe once the pipeline using them is compiled.
#[derive(Debug, Clone, Default)]
pub struct ShaderSet {
    modules: BTreeMap<VulkanStage, vk::ShaderModule>,
}

impl ShaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, stage: VulkanStage, module: vk::ShaderModule) -> Self {
        self.modules.insert(stage, module);
        self
    }

    pub fn get(&self, stage: VulkanStage) -> Option<vk::ShaderModule> {
        self.modules.get(&stage).copied()
    }

    pub fn stages(&self) -> impl Iterator<Item = VulkanStage> + '_ {
        self.modules.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn shader_set_lookup() {
        let vertex = vk::ShaderModule::from_raw(1);
        let set = ShaderSet::new().with(VulkanStage::Vertex, vertex);

        assert_eq!(set.get(VulkanStage::Vertex), Some(vertex));
        assert_eq!(set.get(VulkanStage::Fragment), None);
        assert_eq!(set.stages().collect::<Vec<_>>(), vec![VulkanStage::Vertex]);
    }

    #[test]
    fn read_spv_rejects_truncated_words() {
        let bytes = [0x03, 0x02, 0x23];
        assert!(ash::util::read_spv(&mut Cursor::new(&bytes[..])).is_err());
    }
}
