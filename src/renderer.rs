use std::num::NonZeroU32;
use std::sync::{mpsc, Arc};

use anyhow::{anyhow, bail, Context, Result};
use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::ptm::{PtmFile, PtmFormat, COEFFICIENT_COUNT};
use crate::shading::FrameParams;

const PTM_SHADER: &str = include_str!("../shaders/ptm_relight.wgsl");

/// Target format used by [`PtmRenderer::render_rgba`] and the headless CLI.
pub const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

const EMPTY_CLEAR: wgpu::Color = wgpu::Color {
    r: 0.15,
    g: 0.15,
    b: 0.15,
    a: 1.0,
};
const FRAME_CLEAR: wgpu::Color = wgpu::Color {
    r: 0.1,
    g: 0.1,
    b: 0.1,
    a: 1.0,
};

const COLOR_BINDING: u32 = COEFFICIENT_COUNT as u32 + 1;
const COLOR_SAMPLER_BINDING: u32 = COEFFICIENT_COUNT as u32 + 2;
const UNIFORM_BINDING: u32 = COEFFICIENT_COUNT as u32 + 3;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq)]
struct ShadingUniform {
    light: [f32; 2],
    mode: u32,
    is_luminance: u32,
    specular_exponent: f32,
    diffuse_gain: f32,
    _padding: [f32; 2],
}

impl ShadingUniform {
    fn new(params: &FrameParams, format: PtmFormat) -> Self {
        Self {
            light: [params.light.u, params.light.v],
            mode: params.mode.index(),
            is_luminance: u32::from(format == PtmFormat::LuminanceRgb),
            specular_exponent: params.specular_exponent,
            diffuse_gain: params.diffuse_gain,
            _padding: [0.0; 2],
        }
    }
}

/// Adapter facts resolved once when the device is created.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub backend: String,
    pub adapter_name: String,
    pub max_texture_dimension_2d: u32,
    /// `Rgba32Float` textures may use a filtering sampler.
    pub float32_filterable: bool,
}

impl GpuCapabilities {
    fn resolve(adapter: &wgpu::Adapter, device: &wgpu::Device) -> Self {
        let info = adapter.get_info();
        Self {
            backend: format!("{:?}", info.backend),
            adapter_name: info.name,
            max_texture_dimension_2d: device.limits().max_texture_dimension_2d,
            float32_filterable: adapter
                .features()
                .contains(wgpu::Features::FLOAT32_FILTERABLE),
        }
    }

    pub fn check_texture_size(&self, width: u32, height: u32) -> Result<()> {
        let max = self.max_texture_dimension_2d;
        if width > max || height > max {
            bail!(
                "{}x{} exceeds the {}px texture limit of {} ({})",
                width,
                height,
                max,
                self.adapter_name,
                self.backend
            );
        }
        Ok(())
    }
}

pub struct GpuContext {
    pub adapter: wgpu::Adapter,
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub capabilities: GpuCapabilities,
}

impl GpuContext {
    pub async fn headless() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| anyhow!("no suitable GPU adapter found"))?;
        Self::from_adapter(adapter).await
    }

    pub async fn for_surface(
        instance: &wgpu::Instance,
        surface: &wgpu::Surface<'_>,
    ) -> Result<Self> {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: Some(surface),
            })
            .await
            .ok_or_else(|| anyhow!("no suitable GPU adapter found for surface"))?;
        Self::from_adapter(adapter).await
    }

    async fn from_adapter(adapter: wgpu::Adapter) -> Result<Self> {
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("ptm-device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default().using_resolution(adapter.limits()),
                },
                None,
            )
            .await
            .context("failed to request wgpu device")?;

        let capabilities = GpuCapabilities::resolve(&adapter, &device);
        log::info!(
            "GPU ready: {} ({}), max texture {}px, float32 filtering {}",
            capabilities.adapter_name,
            capabilities.backend,
            capabilities.max_texture_dimension_2d,
            capabilities.float32_filterable
        );

        Ok(Self {
            adapter,
            device: Arc::new(device),
            queue: Arc::new(queue),
            capabilities,
        })
    }
}

/// Pixel size of the region a frame is drawn into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Bind group layout and sampler shared by every packed file.
struct ShadingLayout {
    bind_group_layout: wgpu::BindGroupLayout,
    coefficient_sampler: wgpu::Sampler,
}

impl ShadingLayout {
    fn new(device: &wgpu::Device) -> Self {
        let mut entries = Vec::with_capacity(COEFFICIENT_COUNT + 4);
        for binding in 0..COEFFICIENT_COUNT as u32 {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
        }
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: COEFFICIENT_COUNT as u32,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
            count: None,
        });
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: COLOR_BINDING,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: COLOR_SAMPLER_BINDING,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        });
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: UNIFORM_BINDING,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: wgpu::BufferSize::new(
                    std::mem::size_of::<ShadingUniform>() as u64,
                ),
            },
            count: None,
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("ptm-bind-group-layout"),
            entries: &entries,
        });

        // Polynomial terms are never blended across pixels.
        let coefficient_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("ptm-coefficient-sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        Self {
            bind_group_layout,
            coefficient_sampler,
        }
    }
}

/// GPU copy of one decoded file: six coefficient textures plus the base color
/// (or a white placeholder), bound together with the frame uniform.
///
/// Fields drop in declaration order, which is the reverse of creation.
pub struct PackedResources {
    bind_group: wgpu::BindGroup,
    _color_sampler: wgpu::Sampler,
    _color_texture: wgpu::Texture,
    _coefficient_textures: Vec<wgpu::Texture>,
    format: PtmFormat,
    width: u32,
    height: u32,
}

impl PackedResources {
    fn pack(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        capabilities: &GpuCapabilities,
        layout: &ShadingLayout,
        uniform_buffer: &wgpu::Buffer,
        file: &PtmFile,
    ) -> Result<Self> {
        let width = file.width();
        let height = file.height();
        capabilities.check_texture_size(width, height)?;

        let pixel_count = file.pixel_count();
        let mut coefficient_textures = Vec::with_capacity(COEFFICIENT_COUNT);
        let mut texels = vec![0.0_f32; pixel_count * 4];
        for index in 0..COEFFICIENT_COUNT {
            for (pixel, texel) in texels.chunks_exact_mut(4).enumerate() {
                let [r, g, b] = file.coefficient_rgb(index, pixel);
                texel.copy_from_slice(&[r, g, b, 0.0]);
            }
            coefficient_textures.push(upload_texture(
                device,
                queue,
                &format!("ptm-coefficient-{index}"),
                width,
                height,
                wgpu::TextureFormat::Rgba32Float,
                bytemuck::cast_slice(&texels),
            )?);
        }

        let (color_texture, color_sampler) = match file.base_color() {
            Some(rgb) => {
                let rgba = rgb
                    .chunks_exact(3)
                    .flat_map(|px| [px[0], px[1], px[2], u8::MAX])
                    .collect::<Vec<_>>();
                let texture = upload_texture(
                    device,
                    queue,
                    "ptm-base-color",
                    width,
                    height,
                    wgpu::TextureFormat::Rgba8Unorm,
                    &rgba,
                )?;
                (texture, color_sampler(device, wgpu::FilterMode::Linear))
            }
            None => {
                let texture = upload_texture(
                    device,
                    queue,
                    "ptm-white-placeholder",
                    1,
                    1,
                    wgpu::TextureFormat::Rgba8Unorm,
                    &[u8::MAX; 4],
                )?;
                (texture, color_sampler(device, wgpu::FilterMode::Nearest))
            }
        };

        let coefficient_views = coefficient_textures
            .iter()
            .map(|texture| texture.create_view(&wgpu::TextureViewDescriptor::default()))
            .collect::<Vec<_>>();
        let color_view = color_texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut entries = coefficient_views
            .iter()
            .enumerate()
            .map(|(binding, view)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: wgpu::BindingResource::TextureView(view),
            })
            .collect::<Vec<_>>();
        entries.push(wgpu::BindGroupEntry {
            binding: COEFFICIENT_COUNT as u32,
            resource: wgpu::BindingResource::Sampler(&layout.coefficient_sampler),
        });
        entries.push(wgpu::BindGroupEntry {
            binding: COLOR_BINDING,
            resource: wgpu::BindingResource::TextureView(&color_view),
        });
        entries.push(wgpu::BindGroupEntry {
            binding: COLOR_SAMPLER_BINDING,
            resource: wgpu::BindingResource::Sampler(&color_sampler),
        });
        entries.push(wgpu::BindGroupEntry {
            binding: UNIFORM_BINDING,
            resource: uniform_buffer.as_entire_binding(),
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("ptm-bind-group"),
            layout: &layout.bind_group_layout,
            entries: &entries,
        });

        log::info!(
            "packed {}x{} {} into {} coefficient textures",
            width,
            height,
            file.format(),
            COEFFICIENT_COUNT
        );

        Ok(Self {
            bind_group,
            _color_sampler: color_sampler,
            _color_texture: color_texture,
            _coefficient_textures: coefficient_textures,
            format: file.format(),
            width,
            height,
        })
    }

    pub fn format(&self) -> PtmFormat {
        self.format
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

fn color_sampler(device: &wgpu::Device, filter: wgpu::FilterMode) -> wgpu::Sampler {
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("ptm-color-sampler"),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        mag_filter: filter,
        min_filter: filter,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    })
}

fn upload_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    label: &str,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
    data: &[u8],
) -> Result<wgpu::Texture> {
    let bytes_per_pixel = format
        .block_copy_size(None)
        .ok_or_else(|| anyhow!("texture format {:?} has no fixed texel size", format))?;
    let bytes_per_row = NonZeroU32::new(width.saturating_mul(bytes_per_pixel))
        .ok_or_else(|| anyhow!("texture '{}' has invalid width {}", label, width))?;
    let rows_per_image = NonZeroU32::new(height)
        .ok_or_else(|| anyhow!("texture '{}' has invalid height {}", label, height))?;

    let size = wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    };
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });

    queue.write_texture(
        wgpu::ImageCopyTexture {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        data,
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(bytes_per_row.get()),
            rows_per_image: Some(rows_per_image.get()),
        },
        size,
    );

    Ok(texture)
}

/// Render target plus readback buffer for headless frames.
struct OffscreenTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    readback_buffer: wgpu::Buffer,
    width: u32,
    height: u32,
    unpadded_bytes_per_row: u32,
    padded_bytes_per_row: u32,
}

impl OffscreenTarget {
    fn new(
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("output size must be positive, got {}x{}", width, height);
        }
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("ptm-render-target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let unpadded_bytes_per_row = width
            .checked_mul(4)
            .ok_or_else(|| anyhow!("frame width overflow when computing row bytes"))?;
        let padded_bytes_per_row =
            align_to(unpadded_bytes_per_row, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let readback_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ptm-readback-buffer"),
            size: u64::from(padded_bytes_per_row) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        Ok(Self {
            texture,
            view,
            readback_buffer,
            width,
            height,
            unpadded_bytes_per_row,
            padded_bytes_per_row,
        })
    }

    fn encode_copy(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &self.readback_buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_bytes_per_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn read(&self, device: &wgpu::Device) -> Result<Vec<u8>> {
        let buffer_slice = self.readback_buffer.slice(..);
        let (sender, receiver) = mpsc::channel();

        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device.poll(wgpu::Maintain::Wait);

        receiver
            .recv()
            .map_err(|_| anyhow!("failed receiving GPU map callback"))?
            .context("GPU buffer mapping failed")?;

        let mapped = buffer_slice.get_mapped_range();
        let row_len = self.unpadded_bytes_per_row as usize;
        let mut frame = vec![0_u8; row_len * self.height as usize];

        for (row_index, chunk) in mapped
            .chunks(self.padded_bytes_per_row as usize)
            .take(self.height as usize)
            .enumerate()
        {
            let dst_start = row_index * row_len;
            frame[dst_start..dst_start + row_len].copy_from_slice(&chunk[..row_len]);
        }

        drop(mapped);
        self.readback_buffer.unmap();
        Ok(frame)
    }
}

/// Owns the shading pipeline and the currently loaded file.
///
/// Every method must be called from the thread that owns the device. Loading
/// a file only stores it; textures are packed on the next render.
pub struct PtmRenderer {
    // Field order is drop order: per-file resources go before the pipeline.
    packed: Option<PackedResources>,
    pending: Option<PtmFile>,
    offscreen: Option<OffscreenTarget>,
    pipeline: wgpu::RenderPipeline,
    uniform_buffer: wgpu::Buffer,
    last_uniform: Option<ShadingUniform>,
    layout: ShadingLayout,
    target_format: wgpu::TextureFormat,
    capabilities: GpuCapabilities,
    queue: Arc<wgpu::Queue>,
    device: Arc<wgpu::Device>,
}

impl PtmRenderer {
    /// Compiles the shader and builds the pipeline for `target_format`.
    /// Validation failures carry the compiler's diagnostic text.
    pub fn new(context: &GpuContext, target_format: wgpu::TextureFormat) -> Result<Self> {
        let device = Arc::clone(&context.device);
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let layout = ShadingLayout::new(&device);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("ptm-relight-shader"),
            source: wgpu::ShaderSource::Wgsl(PTM_SHADER.into()),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("ptm-pipeline-layout"),
            bind_group_layouts: &[&layout.bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("ptm-relight-pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: target_format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            multiview: None,
        });

        let initial = ShadingUniform::new(&FrameParams::default(), PtmFormat::LuminanceRgb);
        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("ptm-shading-uniform"),
            contents: bytemuck::bytes_of(&initial),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            bail!("failed to build PTM shading pipeline: {error}");
        }
        log::debug!("PTM pipeline ready for {:?}", target_format);

        Ok(Self {
            packed: None,
            pending: None,
            offscreen: None,
            pipeline,
            uniform_buffer,
            last_uniform: Some(initial),
            layout,
            target_format,
            capabilities: context.capabilities.clone(),
            queue: Arc::clone(&context.queue),
            device,
        })
    }

    /// Replaces the current file. Previously packed textures are released
    /// immediately; the new file is packed on the next render.
    pub fn load(&mut self, file: PtmFile) {
        self.packed = None;
        log::debug!(
            "queued {}x{} {} for packing",
            file.width(),
            file.height(),
            file.format()
        );
        self.pending = Some(file);
    }

    pub fn unload(&mut self) {
        self.packed = None;
        self.pending = None;
    }

    pub fn has_file(&self) -> bool {
        self.packed.is_some() || self.pending.is_some()
    }

    pub fn packed(&self) -> Option<&PackedResources> {
        self.packed.as_ref()
    }

    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    pub fn target_format(&self) -> wgpu::TextureFormat {
        self.target_format
    }

    /// Packs a pending file if there is one. The CPU copy is dropped once
    /// its textures exist.
    pub fn prepare(&mut self) -> Result<()> {
        let Some(file) = self.pending.take() else {
            return Ok(());
        };
        self.packed = None;
        let packed = PackedResources::pack(
            &self.device,
            &self.queue,
            &self.capabilities,
            &self.layout,
            &self.uniform_buffer,
            &file,
        )?;
        self.packed = Some(packed);
        Ok(())
    }

    /// Draws one frame into `view`, overwriting the whole target.
    ///
    /// `viewport` must not exceed the size of the texture behind `view`;
    /// wgpu rejects larger viewports. Hosts that own the texture should
    /// prefer [`PtmRenderer::render_to_texture`], which reads the size from it.
    pub fn render_to_view(
        &mut self,
        view: &wgpu::TextureView,
        viewport: Viewport,
        params: &FrameParams,
    ) -> Result<()> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("ptm-render-encoder"),
            });
        self.encode_frame(&mut encoder, view, viewport, params)?;
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    /// Draws one frame covering all of `texture`, for example a surface
    /// texture acquired after a resize.
    pub fn render_to_texture(&mut self, texture: &wgpu::Texture, params: &FrameParams) -> Result<()> {
        if texture.format() != self.target_format {
            bail!(
                "texture format {:?} does not match the pipeline format {:?}",
                texture.format(),
                self.target_format
            );
        }
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let viewport = Viewport {
            width: texture.width(),
            height: texture.height(),
        };
        self.render_to_view(&view, viewport, params)
    }

    /// Renders into an internal `width × height` target and returns tightly
    /// packed RGBA8 rows, top row first. Only renderers built for
    /// [`OFFSCREEN_FORMAT`] can read back; sRGB targets would re-encode the
    /// shaded values.
    pub fn render_rgba(&mut self, params: &FrameParams, width: u32, height: u32) -> Result<Vec<u8>> {
        if self.target_format != OFFSCREEN_FORMAT {
            bail!(
                "readback needs a {:?} pipeline, this renderer targets {:?}",
                OFFSCREEN_FORMAT,
                self.target_format
            );
        }

        let target = match self.offscreen.take() {
            Some(target) if target.width == width && target.height == height => target,
            _ => OffscreenTarget::new(&self.device, self.target_format, width, height)?,
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("ptm-offscreen-encoder"),
            });
        let viewport = Viewport { width, height };
        if let Err(error) = self.encode_frame(&mut encoder, &target.view, viewport, params) {
            self.offscreen = Some(target);
            return Err(error);
        }
        target.encode_copy(&mut encoder);
        self.queue.submit(Some(encoder.finish()));

        let frame = target.read(&self.device);
        self.offscreen = Some(target);
        frame
    }

    fn encode_frame(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        view: &wgpu::TextureView,
        viewport: Viewport,
        params: &FrameParams,
    ) -> Result<()> {
        if viewport.width == 0 || viewport.height == 0 {
            bail!(
                "viewport must be positive, got {}x{}",
                viewport.width,
                viewport.height
            );
        }
        params.validate()?;
        self.prepare()?;

        if let Some(packed) = &self.packed {
            let uniform = ShadingUniform::new(params, packed.format);
            if self.last_uniform != Some(uniform) {
                self.queue
                    .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniform));
                self.last_uniform = Some(uniform);
            }
        }

        let clear = if self.packed.is_some() {
            FRAME_CLEAR
        } else {
            EMPTY_CLEAR
        };
        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("ptm-render-pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(clear),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });

        if let Some(packed) = &self.packed {
            render_pass.set_viewport(
                0.0,
                0.0,
                viewport.width as f32,
                viewport.height as f32,
                0.0,
                1.0,
            );
            render_pass.set_pipeline(&self.pipeline);
            render_pass.set_bind_group(0, &packed.bind_group, &[]);
            render_pass.draw(0..3, 0..1);
        }

        Ok(())
    }
}

fn align_to(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    (value + mask) & !mask
}
