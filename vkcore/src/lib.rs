//! A Vulkan resource core: lifetime tracking, lockable buffers and
//! textures, cross-queue synchronization and a pipeline state cache.
//!
//! `vkcore` naming conventions:
//! - `raw_*` accessors return the Vulkan handle type from `ash::vk`.
//! - `ash_*` accessors return the corresponding `ash` wrapper object.
//!
//! # Object graph
//!
//! ```text
//! Instance ◄── Device ◄── GpuContext ◄── GpuBuffer / GpuTexture
//!                             │              │
//!                             │              └─ ResourceId ─► ResourceTracker
//!                             ├─ per-queue streams (timeline, pool, transfer batch)
//!                             └─ render-target / vertex-input interners
//! ```
//!
//! User-facing objects ([`GpuBuffer`], [`GpuTexture`]) never own native
//! handles directly. They name an entry in the context's
//! [`ResourceTracker`](tracker::ResourceTracker), which frees the native
//! object only once no command buffer still references it. Locking a
//! resource that queued GPU work still uses swaps in a fresh native
//! object instead of stalling.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod barrier;
pub mod buffer;
pub mod command;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod instance;
pub mod mapping;
pub mod memory;
pub mod pipeline;
pub mod proxy;
pub mod queue;
pub mod shader;
pub mod subresource;
pub mod sync;
pub mod texture;
pub mod tracker;
pub mod transfer;
pub mod vertex;

pub use ash;
pub use buffer::{BufferDesc, BufferKind, BufferUsage, GpuBuffer, LockError, LockKind, WriteMode};
pub use command::{CommandBuffer, CommandBufferState, RecordError, RenderTarget, SubmitError};
pub use context::GpuContext;
pub use device::{Device, DeviceConfig, QueueMode};
pub use instance::{Instance, VulkanLogLevel};
pub use pipeline::{
    ComputePipelineState, CreatePipelineError, GraphicsPipelineDesc, GraphicsPipelineState,
    ReadOnlyFlags,
};
pub use queue::{QueueId, QueueType};
pub use shader::ShaderProgram;
pub use texture::{GpuTexture, TextureCopy, TextureDesc, TextureKind, TextureUsage};
