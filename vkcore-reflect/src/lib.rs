//! Shader reflection and uniform block layout for the `vkcore` backend.
//!
//! This crate knows nothing about Vulkan objects. It turns a compiled
//! program's introspection data into a [`ParameterManifest`]: a
//! language-agnostic description of every texture, sampler, buffer and
//! packed uniform-block member a shader stage consumes.
//!
//! # Pieces
//!
//! ```text
//! source ──► ShaderCompiler ──► SPIR-V ──► spirv::introspect
//!                                              │
//!                                              ▼
//!                                     ProgramIntrospection
//!                                              │ build_manifest
//!                                              ▼
//!                                      ParameterManifest
//! ```
//!
//! [`compute_block_layout`] is the std140 packing calculator used by
//! [`build_manifest`]; it is public so callers can lay out CPU-side
//! mirrors of uniform blocks themselves.

pub mod compile;
pub mod introspect;
pub mod layout;
pub mod manifest;
pub mod semantic;
pub mod spirv;
pub mod types;

pub use compile::{CompileOutput, GlslangCompiler, ShaderCompiler, ShaderStage};
pub use introspect::{ProgramIntrospection, build_manifest};
pub use layout::{BlockField, BlockLayout, FieldKind, FieldLayout, compute_block_layout};
pub use manifest::ParameterManifest;
pub use types::ParamDataType;
