use std::{fs, path::Path, sync::Arc};

use eyre::{WrapErr, ensure, eyre};
use vkcore::{
    BufferDesc, BufferKind, BufferUsage, GpuBuffer, GpuContext, GpuTexture, GraphicsPipelineDesc,
    GraphicsPipelineState, QueueType, ReadOnlyFlags, RenderTarget, ShaderProgram, TextureCopy,
    TextureDesc, TextureUsage, WriteMode,
    ash::vk,
    mapping::{CullMode, DrawOp, VertexElementType},
    pipeline::{DepthStencilState, RasterizerState},
    proxy,
    vertex::VertexDeclaration,
};
use vkcore_reflect::{
    CompileOutput, GlslangCompiler, ShaderCompiler, ShaderStage, semantic::VertexSemantic,
};

use crate::config::ProbeConfig;

const TRIANGLE_VERT: &str = include_str!("../shaders/triangle.vert");
const TRIANGLE_FRAG: &str = include_str!("../shaders/triangle.frag");

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Scenario {
    /// Discard-write a buffer while a submitted copy still reads it.
    CloneOnBind,
    /// Producer on one queue, consumer on another.
    ReadAfterWrite,
    /// Discard-write then read back, for device-local and dynamic buffers.
    DiscardReadback,
    /// Per-mip texture upload, read back and texture-to-texture copy.
    Texture,
    /// One pipeline state used with two render target layouts.
    PipelineCache,
    /// Snapshot published from a simulation thread feeding a buffer.
    Proxy,
    /// Compile and reflect the built-in and configured shaders.
    Reflect,
}

impl Scenario {
    pub const ALL: [Scenario; 7] = [
        Scenario::CloneOnBind,
        Scenario::ReadAfterWrite,
        Scenario::DiscardReadback,
        Scenario::Texture,
        Scenario::PipelineCache,
        Scenario::Proxy,
        Scenario::Reflect,
    ];
}

#[derive(Debug)]
pub enum Outcome {
    Passed,
    Skipped(String),
}

pub struct Probe<'a> {
    pub ctx: &'a Arc<GpuContext>,
    pub compiler: &'a GlslangCompiler,
    pub config: &'a ProbeConfig,
}

impl Probe<'_> {
    pub fn run(&self, scenario: Scenario) -> eyre::Result<Outcome> {
        let _span = tracing::info_span!("scenario", ?scenario).entered();
        let outcome = match scenario {
            Scenario::CloneOnBind => self.clone_on_bind(),
            Scenario::ReadAfterWrite => self.read_after_write(),
            Scenario::DiscardReadback => self.discard_readback(),
            Scenario::Texture => self.texture(),
            Scenario::PipelineCache => self.pipeline_cache(),
            Scenario::Proxy => self.proxy(),
            Scenario::Reflect => self.reflect(),
        };
        // Leave nothing in flight for the next scenario.
        self.ctx.wait_idle()?;
        outcome
    }

    fn clone_on_bind(&self) -> eyre::Result<Outcome> {
        const SIZE: usize = 256;
        let ctx = self.ctx;
        let source = GpuBuffer::new(
            ctx,
            BufferDesc::new(BufferKind::Uniform, SIZE as u64, BufferUsage::DYNAMIC),
            Some("clone-on-bind source"),
        )?;
        let observer = GpuBuffer::new(
            ctx,
            BufferDesc::new(BufferKind::Generic, SIZE as u64, BufferUsage::empty()),
            Some("clone-on-bind observer"),
        )?;
        let first = pattern(SIZE, 0xA0);
        let second = pattern(SIZE, 0x0B);

        source.write(0, &first, WriteMode::Discard)?;
        let mut cb = ctx.command_buffer(QueueType::Graphics);
        observer.copy_from(&mut cb, &source, 0, 0, SIZE as u64)?;
        cb.submit()?;
        // The copy may still be running; this must not disturb it.
        source.write(0, &second, WriteMode::Discard)?;
        ctx.wait_idle()?;

        let mut seen = vec![0; SIZE];
        observer.read(0, &mut seen)?;
        ensure!(seen == first, "in-flight copy observed the later write");
        let mut current = vec![0; SIZE];
        source.read(0, &mut current)?;
        ensure!(current == second, "source does not hold the later write");
        Ok(Outcome::Passed)
    }

    fn read_after_write(&self) -> eyre::Result<Outcome> {
        const SIZE: usize = 1024;
        let ctx = self.ctx;
        let desc = BufferDesc::new(BufferKind::Structured, SIZE as u64, BufferUsage::empty());
        let producer = GpuBuffer::new(ctx, desc, Some("raw producer"))?;
        let middle = GpuBuffer::new(ctx, desc, Some("raw middle"))?;
        let consumer = GpuBuffer::new(ctx, desc, Some("raw consumer"))?;
        let data = pattern(SIZE, 0x31);
        producer.write(0, &data, WriteMode::Normal)?;

        let mut first = ctx.command_buffer(QueueType::Graphics);
        middle.copy_from(&mut first, &producer, 0, 0, SIZE as u64)?;
        first.submit()?;

        // Submitted without waiting; the second queue must sync on the first.
        let mut second = ctx.command_buffer(QueueType::Compute);
        consumer.copy_from(&mut second, &middle, 0, 0, SIZE as u64)?;
        tracing::debug!(
            "Consumer recorded on {:?} after producer on {:?}",
            second.queue(),
            first.queue()
        );
        second.submit()?;

        let mut out = vec![0; SIZE];
        consumer.read(0, &mut out)?;
        ensure!(out == data, "consumer read stale contents");
        Ok(Outcome::Passed)
    }

    fn discard_readback(&self) -> eyre::Result<Outcome> {
        const SIZE: usize = 4096;
        for (usage, seed) in [(BufferUsage::empty(), 0x10), (BufferUsage::DYNAMIC, 0x55)] {
            let buffer = GpuBuffer::new(
                self.ctx,
                BufferDesc::new(BufferKind::Generic, SIZE as u64, usage),
                Some("discard readback"),
            )?;
            let data = pattern(SIZE, seed);
            buffer.write(0, &data, WriteMode::Discard)?;
            let mut out = vec![0; SIZE];
            buffer.read(0, &mut out)?;
            ensure!(out == data, "{usage:?} buffer returned different bytes");

            // A partial overwrite leaves the rest alone.
            let patch = pattern(64, seed.wrapping_add(1));
            buffer.write(128, &patch, WriteMode::Normal)?;
            let mut expected = data;
            expected[128..192].copy_from_slice(&patch);
            buffer.read(0, &mut out)?;
            ensure!(out == expected, "{usage:?} buffer lost bytes on partial write");
        }
        Ok(Outcome::Passed)
    }

    fn texture(&self) -> eyre::Result<Outcome> {
        const MIPS: u32 = 3;
        let ctx = self.ctx;
        let desc = TextureDesc::new_2d(vk::Format::R8G8B8A8_UNORM, 64, 64, TextureUsage::empty())
            .with_mips(MIPS);
        let source = GpuTexture::new(ctx, desc, Some("probe mips"))?;

        let mut uploaded = Vec::new();
        for mip in 0..MIPS {
            let extent = desc.mip_extent(mip);
            let data = pattern((extent.width * extent.height * 4) as usize, mip as u8 * 40);
            source.write_data(mip, 0, &data, true)?;
            uploaded.push(data);
        }
        for (mip, expected) in uploaded.iter().enumerate() {
            let mut out = vec![0; expected.len()];
            source.read_data(mip as u32, 0, &mut out)?;
            ensure!(&out == expected, "mip {mip} read back differently");
        }

        let dst = GpuTexture::new(
            ctx,
            TextureDesc::new_2d(vk::Format::R8G8B8A8_UNORM, 32, 32, TextureUsage::empty()),
            Some("probe copy target"),
        )?;
        let mut cb = ctx.command_buffer(QueueType::Graphics);
        source.copy(
            &mut cb,
            &dst,
            &TextureCopy {
                src_mip: 1,
                ..Default::default()
            },
        )?;
        cb.submit()?;
        let mut out = vec![0; uploaded[1].len()];
        dst.read_data(0, 0, &mut out)?;
        ensure!(out == uploaded[1], "copied mip differs from its source");
        Ok(Outcome::Passed)
    }

    fn pipeline_cache(&self) -> eyre::Result<Outcome> {
        let ctx = self.ctx;
        let device = ctx.device();
        if !device.has_dynamic_rendering() {
            return Ok(Outcome::Skipped("device lacks dynamic rendering".into()));
        }
        if !self.compiler.is_available() {
            return Ok(Outcome::Skipped(format!(
                "{} not found",
                self.compiler.executable.display()
            )));
        }

        let vertex = Arc::new(ShaderProgram::new(
            device,
            &compiled(self.compiler, TRIANGLE_VERT, ShaderStage::Vertex, "triangle.vert")?,
            ShaderStage::Vertex,
            Some("triangle.vert"),
        )?);
        let fragment = Arc::new(ShaderProgram::new(
            device,
            &compiled(self.compiler, TRIANGLE_FRAG, ShaderStage::Fragment, "triangle.frag")?,
            ShaderStage::Fragment,
            Some("triangle.frag"),
        )?);
        let state = GraphicsPipelineState::new(
            device,
            GraphicsPipelineDesc {
                vertex: Some(vertex.clone()),
                fragment: Some(fragment),
                rasterizer: RasterizerState {
                    cull_mode: CullMode::None,
                    ..Default::default()
                },
                depth_stencil: DepthStencilState {
                    depth_read: false,
                    depth_write: false,
                    ..Default::default()
                },
                ..Default::default()
            },
            Some("probe triangle"),
        )?;

        let mesh = VertexDeclaration::packed(&[(VertexSemantic::Position, 0, VertexElementType::Float3)]);
        let vertex_input = ctx.intern_vertex_input(mesh.input_layout(&vertex.manifest().vertex_inputs)?);
        let vertices = GpuBuffer::new(
            ctx,
            BufferDesc::new(BufferKind::Vertex, 36, BufferUsage::empty()),
            Some("triangle vertices"),
        )?;
        let positions: [f32; 9] = [0.0, -0.5, 0.0, 0.5, 0.5, 0.0, -0.5, 0.5, 0.0];
        vertices.write_pod(0, &positions, WriteMode::Discard)?;

        let target_desc = TextureDesc::new_2d(
            vk::Format::R8G8B8A8_UNORM,
            64,
            64,
            TextureUsage::RENDER_TARGET,
        );
        let albedo = GpuTexture::new(ctx, target_desc, Some("probe albedo"))?;
        let normals = GpuTexture::new(ctx, target_desc, Some("probe normals"))?;
        let two_colors = RenderTarget {
            colors: vec![&albedo, &normals],
            clear_color: Some([0.0; 4]),
            ..Default::default()
        };
        let one_color = RenderTarget {
            colors: vec![&albedo],
            ..Default::default()
        };

        let mut cb = ctx.command_buffer(QueueType::Graphics);
        let mut bound = Vec::new();
        for target in [&two_colors, &one_color, &two_colors] {
            cb.begin_render_pass(target, ReadOnlyFlags::empty())?;
            bound.push(cb.bind_graphics_pipeline(&state, vertex_input, DrawOp::TriangleList)?);
            cb.bind_vertex_buffers(0, &[(&vertices, 0)])?;
            cb.draw(3, 1, 0, 0)?;
            cb.end_render_pass()?;
        }
        cb.submit()?;
        // Pipelines die with their state, so the draws must finish first.
        ctx.wait_idle()?;

        ensure!(bound[0] != bound[1], "render target layouts shared a pipeline");
        ensure!(bound[0] == bound[2], "repeated key built a second pipeline");
        ensure!(
            state.cached_pipelines() == 2,
            "expected 2 cached pipelines, found {}",
            state.cached_pipelines()
        );
        Ok(Outcome::Passed)
    }

    fn proxy(&self) -> eyre::Result<Outcome> {
        let buffer = GpuBuffer::new(
            self.ctx,
            BufferDesc::new(BufferKind::Uniform, 64, BufferUsage::DYNAMIC),
            Some("proxy target"),
        )?;
        let (mut sim, mut core) = proxy::pair([0u32; 16]);
        let worker = std::thread::spawn(move || {
            for frame in 1..=4u32 {
                sim.update(|s| s.fill(frame));
                sim.publish();
            }
        });
        worker
            .join()
            .map_err(|_| eyre!("simulation thread panicked"))?;

        ensure!(core.sync(), "no snapshot arrived");
        buffer.write_pod(0, core.get().as_slice(), WriteMode::Discard)?;
        ensure!(core.get()[0] == 4, "core state is not the newest snapshot");

        let mut out = [0u8; 64];
        buffer.read(0, &mut out)?;
        let expected: &[u8] = bytemuck::cast_slice(core.get().as_slice());
        ensure!(out.as_slice() == expected, "buffer does not hold the snapshot");
        Ok(Outcome::Passed)
    }

    fn reflect(&self) -> eyre::Result<Outcome> {
        if !self.compiler.is_available() {
            return Ok(Outcome::Skipped(format!(
                "{} not found",
                self.compiler.executable.display()
            )));
        }
        let mut sources = vec![
            ("triangle_vert".to_owned(), TRIANGLE_VERT.to_owned(), ShaderStage::Vertex),
            ("triangle_frag".to_owned(), TRIANGLE_FRAG.to_owned(), ShaderStage::Fragment),
        ];
        for entry in &self.config.shader {
            let source = fs::read_to_string(&entry.file)
                .wrap_err_with(|| format!("reading {}", entry.file.display()))?;
            sources.push((entry.name.clone(), source, entry.stage));
        }

        for (name, source, stage) in &sources {
            let output = compiled(self.compiler, source, *stage, name)?;
            let manifest = &output.manifest;
            tracing::info!(
                "{name}: {} inputs, {} blocks, {} textures, {} storage images, {} buffers",
                manifest.vertex_inputs.len(),
                manifest.param_blocks.len(),
                manifest.textures.len(),
                manifest.load_store_textures.len(),
                manifest.buffers.len(),
            );
            // Creating a module proves the words are valid for this device.
            ShaderProgram::new(self.ctx.device(), &output, *stage, Some(name.as_str()))?;
            if let Some(dir) = &self.config.dump_manifests {
                dump_manifest(dir, name, &output)?;
            }
        }
        Ok(Outcome::Passed)
    }
}

fn compiled(
    compiler: &GlslangCompiler,
    source: &str,
    stage: ShaderStage,
    name: &str,
) -> eyre::Result<CompileOutput> {
    let output = compiler.compile(source, stage);
    ensure!(output.is_success(), "{name} failed to compile:\n{}", output.log);
    Ok(output)
}

fn dump_manifest(dir: &Path, name: &str, output: &CompileOutput) -> eyre::Result<()> {
    fs::create_dir_all(dir)?;
    let path = dir.join(name).with_extension("toml");
    fs::write(&path, toml::to_string_pretty(&output.manifest)?)
        .wrap_err_with(|| format!("writing {}", path.display()))?;
    tracing::debug!("Wrote manifest {}", path.display());
    Ok(())
}

/// Bytes that differ per position and per seed.
fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_differ_by_seed() {
        assert_ne!(pattern(32, 1), pattern(32, 2));
        assert_eq!(pattern(4, 0), vec![0, 7, 14, 21]);
    }

    #[test]
    fn every_scenario_is_listed() {
        use clap::ValueEnum;
        assert_eq!(Scenario::value_variants().len(), Scenario::ALL.len());
    }

    #[test]
    fn builtin_shaders_are_embedded() {
        assert!(TRIANGLE_VERT.contains("bs_position"));
        assert!(TRIANGLE_FRAG.contains("location = 1"));
    }
}
