//! The narrow rendering interface the clipmaps draw through.
//!
//! The terrain never talks to a GPU API directly. It creates buffers and
//! texture arrays through a [`TerrainRenderer`], uploads sub-ranges when
//! regions change and issues one indexed draw per visible level.
//! [`RecordingRenderer`] implements the trait headlessly for tools and tests.

use glam::Vec3;
use tessera_common::TextureStoreFormat;

use crate::texture_clipmap::TextureClipmapState;

/// Handle of a GPU buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u32);

/// Handle of a GPU texture array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u32);

/// Usage of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Per-vertex data
    Vertex,
    /// 32-bit triangle indices
    Index,
}

/// One indexed draw of a clip level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawCall {
    /// Clip level being drawn
    pub level: u32,
    /// Vertex buffer of the level
    pub vertex_buffer: BufferHandle,
    /// Index buffer of the level
    pub index_buffer: BufferHandle,
    /// Number of indices to draw
    pub index_count: u32,
    /// Terrain-local distance between neighbouring vertices
    pub vertex_distance: f32,
}

/// Rendering backend used by the terrain.
pub trait TerrainRenderer {
    /// Allocates a buffer of `size` bytes.
    fn create_buffer(&mut self, kind: BufferKind, size: usize) -> BufferHandle;

    /// Uploads `data` at byte `offset` of a buffer.
    fn write_buffer(&mut self, buffer: BufferHandle, offset: usize, data: &[u8]);

    /// Allocates a `size × size` texture array with `layers` layers.
    fn create_texture_array(
        &mut self,
        size: u32,
        layers: u32,
        format: TextureStoreFormat,
    ) -> TextureHandle;

    /// Uploads a rectangle of texels into one layer.
    fn write_texture_region(
        &mut self,
        texture: TextureHandle,
        layer: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: &[u8],
    );

    /// Binds a texture to a unit.
    fn bind_texture(&mut self, unit: u32, texture: TextureHandle);

    /// Binds a texture clipmap and its shader parameters to a unit.
    fn bind_texture_clipmap(&mut self, unit: u32, state: &TextureClipmapState);

    /// Sets the terrain-local eye position used by the shaders.
    fn set_eye_position(&mut self, eye: Vec3);

    /// Enables or disables blending for following draws.
    fn set_blend_enabled(&mut self, enabled: bool);

    /// Opens a nested render queue.
    fn push_buckets(&mut self);

    /// Flushes the current render queue.
    fn render_buckets(&mut self);

    /// Closes the current render queue.
    fn pop_buckets(&mut self);

    /// Issues an indexed draw.
    fn draw_indexed(&mut self, call: &DrawCall);
}

/// A command captured by [`RecordingRenderer`].
#[derive(Debug, Clone, PartialEq)]
pub enum RenderCommand {
    /// Buffer allocation
    CreateBuffer {
        /// Returned handle
        handle: BufferHandle,
        /// Buffer usage
        kind: BufferKind,
        /// Size in bytes
        size: usize,
    },
    /// Buffer upload
    WriteBuffer {
        /// Target buffer
        handle: BufferHandle,
        /// Byte offset
        offset: usize,
        /// Uploaded bytes
        len: usize,
    },
    /// Texture array allocation
    CreateTextureArray {
        /// Returned handle
        handle: TextureHandle,
        /// Side length in texels
        size: u32,
        /// Layer count
        layers: u32,
    },
    /// Texture upload
    WriteTextureRegion {
        /// Target texture
        handle: TextureHandle,
        /// Target layer
        layer: u32,
        /// Rectangle as `(x, y, width, height)`
        rect: (u32, u32, u32, u32),
        /// Uploaded bytes
        len: usize,
    },
    /// Plain texture bind
    BindTexture {
        /// Texture unit
        unit: u32,
        /// Bound texture
        handle: TextureHandle,
    },
    /// Texture clipmap bind
    BindTextureClipmap {
        /// Texture unit
        unit: u32,
        /// Bound clipmap state
        state: TextureClipmapState,
    },
    /// Eye position update
    SetEyePosition(Vec3),
    /// Blend state change
    SetBlendEnabled(bool),
    /// Render queue push
    PushBuckets,
    /// Render queue flush
    RenderBuckets,
    /// Render queue pop
    PopBuckets,
    /// Indexed draw
    Draw(DrawCall),
}

/// Headless renderer that records every command.
#[derive(Debug, Default)]
pub struct RecordingRenderer {
    commands: Vec<RenderCommand>,
    next_handle: u32,
    uploaded_bytes: u64,
}

impl RecordingRenderer {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded commands, oldest first.
    #[must_use]
    pub fn commands(&self) -> &[RenderCommand] {
        &self.commands
    }

    /// Removes and returns the recorded commands.
    pub fn take_commands(&mut self) -> Vec<RenderCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Recorded draws, oldest first.
    pub fn draw_calls(&self) -> impl Iterator<Item = &DrawCall> {
        self.commands.iter().filter_map(|c| match c {
            RenderCommand::Draw(call) => Some(call),
            _ => None,
        })
    }

    /// Total bytes uploaded to buffers and textures since creation.
    #[must_use]
    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes
    }

    fn allocate(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }
}

impl TerrainRenderer for RecordingRenderer {
    fn create_buffer(&mut self, kind: BufferKind, size: usize) -> BufferHandle {
        let handle = BufferHandle(self.allocate());
        self.commands.push(RenderCommand::CreateBuffer { handle, kind, size });
        handle
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: usize, data: &[u8]) {
        self.uploaded_bytes += data.len() as u64;
        self.commands.push(RenderCommand::WriteBuffer {
            handle: buffer,
            offset,
            len: data.len(),
        });
    }

    fn create_texture_array(
        &mut self,
        size: u32,
        layers: u32,
        _format: TextureStoreFormat,
    ) -> TextureHandle {
        let handle = TextureHandle(self.allocate());
        self.commands
            .push(RenderCommand::CreateTextureArray { handle, size, layers });
        handle
    }

    fn write_texture_region(
        &mut self,
        texture: TextureHandle,
        layer: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: &[u8],
    ) {
        self.uploaded_bytes += data.len() as u64;
        self.commands.push(RenderCommand::WriteTextureRegion {
            handle: texture,
            layer,
            rect: (x, y, width, height),
            len: data.len(),
        });
    }

    fn bind_texture(&mut self, unit: u32, texture: TextureHandle) {
        self.commands.push(RenderCommand::BindTexture {
            unit,
            handle: texture,
        });
    }

    fn bind_texture_clipmap(&mut self, unit: u32, state: &TextureClipmapState) {
        self.commands.push(RenderCommand::BindTextureClipmap {
            unit,
            state: state.clone(),
        });
    }

    fn set_eye_position(&mut self, eye: Vec3) {
        self.commands.push(RenderCommand::SetEyePosition(eye));
    }

    fn set_blend_enabled(&mut self, enabled: bool) {
        self.commands.push(RenderCommand::SetBlendEnabled(enabled));
    }

    fn push_buckets(&mut self) {
        self.commands.push(RenderCommand::PushBuckets);
    }

    fn render_buckets(&mut self) {
        self.commands.push(RenderCommand::RenderBuckets);
    }

    fn pop_buckets(&mut self) {
        self.commands.push(RenderCommand::PopBuckets);
    }

    fn draw_indexed(&mut self, call: &DrawCall) {
        self.commands.push(RenderCommand::Draw(*call));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique() {
        let mut renderer = RecordingRenderer::new();
        let a = renderer.create_buffer(BufferKind::Vertex, 16);
        let b = renderer.create_buffer(BufferKind::Index, 16);
        let t = renderer.create_texture_array(32, 2, TextureStoreFormat::Rgba8);
        assert_ne!(a, b);
        assert_ne!(a.0, t.0);
        assert_eq!(renderer.commands().len(), 3);
    }

    #[test]
    fn test_upload_accounting() {
        let mut renderer = RecordingRenderer::new();
        let buffer = renderer.create_buffer(BufferKind::Vertex, 64);
        renderer.write_buffer(buffer, 16, &[0u8; 32]);
        renderer.write_texture_region(TextureHandle(9), 0, 0, 0, 2, 2, &[0u8; 16]);
        assert_eq!(renderer.uploaded_bytes(), 48);
        assert_eq!(renderer.take_commands().len(), 3);
        assert!(renderer.commands().is_empty());
    }
}
