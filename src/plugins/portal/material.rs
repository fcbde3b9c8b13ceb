use bevy::{
    pbr::{MaterialPipeline, MaterialPipelineKey},
    prelude::*,
    reflect::TypeUuid,
    render::{
        mesh::MeshVertexBufferLayout,
        render_resource::{
            AsBindGroup, RenderPipelineDescriptor, ShaderRef, ShaderType,
            SpecializedMeshPipelineError,
        },
    },
};

use super::config::ViewConfig;

/// Portal surface showing the view rendered by the other portal's camera, sampled in screen space.
#[derive(AsBindGroup, Debug, Clone, TypeUuid, Reflect)]
#[uuid = "04901b22-de12-43a9-8e2e-79d333201b93"]
pub struct OpenPortalMaterial {
    #[uniform(0)]
    pub uniform: PortalUniform,
    #[texture(1)]
    #[sampler(2)]
    pub texture: Handle<Image>,
}

impl Material for OpenPortalMaterial {
    fn fragment_shader() -> ShaderRef {
        "shaders/portal_open.wgsl".into()
    }

    fn specialize(
        _pipeline: &MaterialPipeline<Self>,
        descriptor: &mut RenderPipelineDescriptor,
        _layout: &MeshVertexBufferLayout,
        _key: MaterialPipelineKey<Self>,
    ) -> Result<(), SpecializedMeshPipelineError> {
        descriptor.primitive.cull_mode = None;
        Ok(())
    }
}

/// Flat colored surface, for portals without a counterpart and the deepest recursion level.
#[derive(AsBindGroup, Debug, Clone, TypeUuid, Reflect)]
#[uuid = "3373a227-c84e-4da6-bc1d-c7927ff75ef9"]
pub struct ClosedPortalMaterial {
    #[uniform(0)]
    pub uniform: PortalUniform,
}

impl Material for ClosedPortalMaterial {
    fn fragment_shader() -> ShaderRef {
        "shaders/portal_closed.wgsl".into()
    }

    fn specialize(
        _pipeline: &MaterialPipeline<Self>,
        descriptor: &mut RenderPipelineDescriptor,
        _layout: &MeshVertexBufferLayout,
        _key: MaterialPipelineKey<Self>,
    ) -> Result<(), SpecializedMeshPipelineError> {
        descriptor.primitive.cull_mode = None;
        Ok(())
    }
}

#[derive(Debug, Clone, ShaderType, Reflect)]
pub struct PortalUniform {
    /// Fill color, unused by open portals.
    pub color: Color,
    pub border_color: Color,
}

impl PortalUniform {
    pub fn new(config: &ViewConfig, color: [f32; 4]) -> Self {
        PortalUniform {
            color: Color::from(color),
            border_color: Color::from(config.border_color),
        }
    }
}
