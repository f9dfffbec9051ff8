//! wgpu rendering backend
//!
//! Draw calls are recorded as commands and replayed into render passes
//! when the frame is flushed, which keeps the pass borrows out of the
//! [`Device`] trait surface. Everything renders into an offscreen color
//! target so the frame can be read back mid-frame for the pause blur and
//! screenshots; the target is stretched over the surface at `end_frame`.
//!
//! Passes rendered with multisampling must be contiguous: the msaa
//! target resolves into the offscreen image at the end of each pass.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2};
use image::RgbaImage;
use rustc_hash::FxHashMap;
use wgpu::util::DeviceExt;
use winit::window::Window;

use super::{
    BufferHandle, Device, DeviceCaps, PrimitiveKind, ScenePass, ShadowPass, ShadowRegionBinding,
    TextureFilter, TextureHandle, TextureParams, TierBinding, Transparency, UiPass,
};
use crate::scene::Vertex;

const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
const MSAA_SAMPLES: u32 = 4;

/// Uniforms shared by every draw of a scene pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SceneGlobals {
    view_proj: [[f32; 4]; 4],
    shadow_matrix: [[[f32; 4]; 4]; 4],
    /// Atlas sub-rectangle per region: offset.xy, scale.xy.
    shadow_rect: [[f32; 4]; 4],
    eye: [f32; 3],
    shadow_count: u32,
}

impl SceneGlobals {
    fn new(projection: Mat4, view: Mat4) -> Self {
        Self {
            view_proj: (projection * view).to_cols_array_2d(),
            shadow_matrix: [Mat4::IDENTITY.to_cols_array_2d(); 4],
            shadow_rect: [[0.0; 4]; 4],
            eye: view.inverse().w_axis.truncate().into(),
            shadow_count: 0,
        }
    }
}

impl Default for SceneGlobals {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY, Mat4::IDENTITY)
    }
}

/// Per-draw uniforms of the scene pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct DrawUniform {
    model: [[f32; 4]; 4],
    albedo_color: [f32; 4],
    emissive_color: [f32; 4],
    uv_transform: [f32; 4],
    params: [f32; 4],
}

impl DrawUniform {
    fn from_binding(transform: Mat4, binding: &TierBinding) -> Self {
        Self {
            model: transform.to_cols_array_2d(),
            albedo_color: binding.albedo_color,
            emissive_color: binding.emissive_color,
            uv_transform: [
                binding.uv_offset.x,
                binding.uv_offset.y,
                binding.uv_scale.x,
                binding.uv_scale.y,
            ],
            params: [binding.roughness, binding.metalness, 0.0, 0.0],
        }
    }
}

/// Per-draw uniform of the shadow caster pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct CasterUniform {
    mvp: [[f32; 4]; 4],
}

/// Screen-space vertex for UI quads and lines.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct UiVertex {
    position: [f32; 2],
    uv: [f32; 2],
    color: [f32; 4],
}

const VERTEX_ATTRS: [wgpu::VertexAttribute; 4] = wgpu::vertex_attr_array![
    0 => Float32x3, // position
    1 => Float32x3, // normal
    2 => Float32x2, // uv
    3 => Float32x4, // color
];

const UI_VERTEX_ATTRS: [wgpu::VertexAttribute; 3] = wgpu::vertex_attr_array![
    0 => Float32x2, // position
    1 => Float32x2, // uv
    2 => Float32x4, // color
];

fn scene_vertex_layout() -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<Vertex>() as u64,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &VERTEX_ATTRS,
    }
}

fn ui_vertex_layout() -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<UiVertex>() as u64,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &UI_VERTEX_ATTRS,
    }
}

fn topology_of(kind: PrimitiveKind) -> wgpu::PrimitiveTopology {
    match kind {
        PrimitiveKind::TriangleList => wgpu::PrimitiveTopology::TriangleList,
        PrimitiveKind::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
    }
}

/// Index into the scene pipeline table.
fn scene_pipeline_index(kind: PrimitiveKind, transparency: Transparency, msaa: bool) -> usize {
    let strip = usize::from(kind == PrimitiveKind::TriangleStrip);
    let ghost = usize::from(transparency == Transparency::Ghost);
    let multi = usize::from(msaa);
    strip | (ghost << 1) | (multi << 2)
}

fn mip_level_count(width: u32, height: u32, mipmap: bool) -> u32 {
    if mipmap {
        32 - width.max(height).max(1).leading_zeros()
    } else {
        1
    }
}

/// Readback rows must be aligned to 256 bytes.
fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    /// None for depth textures.
    sampler: Option<wgpu::Sampler>,
    size: (u32, u32),
    mip_levels: u32,
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    len: u32,
    capacity: u64,
}

/// Recorded draw commands, replayed at flush time.
enum Cmd {
    BeginShadow {
        atlas: TextureHandle,
    },
    ShadowRegion {
        offset: Vec2,
        scale: Vec2,
    },
    ShadowCaster {
        buffer: BufferHandle,
        kind: PrimitiveKind,
        bind_group: wgpu::BindGroup,
    },
    EndShadow,
    BeginScene {
        msaa: bool,
    },
    SceneGlobals {
        bind_group: wgpu::BindGroup,
    },
    SceneTier {
        buffer: BufferHandle,
        kind: PrimitiveKind,
        transparency: Transparency,
        bind_group: wgpu::BindGroup,
    },
    SceneImmediate {
        buffer: wgpu::Buffer,
        count: u32,
        kind: PrimitiveKind,
        transparency: Transparency,
        bind_group: wgpu::BindGroup,
    },
    EndScene,
    BeginUi {
        msaa: bool,
    },
    UiQuad {
        buffer: wgpu::Buffer,
        count: u32,
        bind_group: Arc<wgpu::BindGroup>,
    },
    UiLines {
        buffer: wgpu::Buffer,
        count: u32,
        bind_group: Arc<wgpu::BindGroup>,
    },
    EndUi,
}

/// Hardware rendering backend.
pub struct WgpuDevice {
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,
    size: (u32, u32),

    offscreen: wgpu::Texture,
    offscreen_view: wgpu::TextureView,
    offscreen_depth_view: wgpu::TextureView,
    msaa_color_view: wgpu::TextureView,
    msaa_depth_view: wgpu::TextureView,

    scene_globals_layout: wgpu::BindGroupLayout,
    scene_draw_layout: wgpu::BindGroupLayout,
    shadow_layout: wgpu::BindGroupLayout,
    ui_layout: wgpu::BindGroupLayout,

    /// Indexed by [`scene_pipeline_index`].
    scene_pipelines: Vec<wgpu::RenderPipeline>,
    shadow_list_pipeline: wgpu::RenderPipeline,
    shadow_strip_pipeline: wgpu::RenderPipeline,
    /// [single sample, msaa].
    ui_quad_pipelines: [wgpu::RenderPipeline; 2],
    ui_line_pipelines: [wgpu::RenderPipeline; 2],
    blit_pipeline: wgpu::RenderPipeline,

    default_sampler: wgpu::Sampler,
    shadow_sampler: wgpu::Sampler,
    white_view: wgpu::TextureView,
    dummy_depth_view: wgpu::TextureView,
    /// Shared fallback for untextured UI draws. wgpu resources are not
    /// clonable, so the one bind group is refcounted instead.
    ui_white_bind_group: Arc<wgpu::BindGroup>,

    textures: FxHashMap<TextureHandle, GpuTexture>,
    buffers: FxHashMap<BufferHandle, GpuBuffer>,
    next_texture: u32,
    next_buffer: u32,

    commands: Vec<Cmd>,
    frame: Option<wgpu::SurfaceTexture>,
    clear_color: wgpu::Color,
    frame_cleared: bool,
    msaa_enabled: bool,
    transparency: Transparency,
    shadow_proj: Mat4,
    shadow_view: Mat4,
    staged_globals: SceneGlobals,
    globals_bound: bool,
}

impl WgpuDevice {
    /// Create a device rendering to a window surface.
    pub async fn new(window: Arc<Window>, vsync: bool) -> Self {
        let size = window.inner_size();
        let size = (size.width.max(1), size.height.max(1));

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = instance
            .create_surface(window)
            .expect("Failed to create surface");

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .expect("Failed to find GPU adapter");

        log::info!("Using GPU: {:?}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Engine Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .expect("Failed to create device");

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .unwrap_or(surface_caps.formats[0]);

        let present_mode = if vsync {
            wgpu::PresentMode::AutoVsync
        } else {
            wgpu::PresentMode::AutoNoVsync
        };

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.0,
            height: size.1,
            present_mode,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        let (offscreen, offscreen_view, offscreen_depth_view, msaa_color_view, msaa_depth_view) =
            Self::create_targets(&device, size.0, size.1);

        let scene_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Scene Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("scene.wgsl").into()),
        });
        let shadow_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Shadow Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shadow.wgsl").into()),
        });
        let ui_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("UI Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("ui.wgsl").into()),
        });

        let scene_globals_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Scene Globals Layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Depth,
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Comparison),
                        count: None,
                    },
                ],
            });

        let texture_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };

        let scene_draw_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Scene Draw Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                texture_entry(2),
                texture_entry(3),
                texture_entry(4),
                texture_entry(5),
            ],
        });

        let shadow_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Shadow Caster Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                texture_entry(1),
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let ui_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("UI Layout"),
            entries: &[
                texture_entry(0),
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let scene_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Scene Pipeline Layout"),
                bind_group_layouts: &[&scene_globals_layout, &scene_draw_layout],
                push_constant_ranges: &[],
            });
        let shadow_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Shadow Pipeline Layout"),
                bind_group_layouts: &[&shadow_layout],
                push_constant_ranges: &[],
            });
        let ui_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("UI Pipeline Layout"),
            bind_group_layouts: &[&ui_layout],
            push_constant_ranges: &[],
        });

        // Table order has to match scene_pipeline_index.
        let mut scene_pipelines = Vec::with_capacity(8);
        for samples in [1, MSAA_SAMPLES] {
            for transparency in [Transparency::Opaque, Transparency::Ghost] {
                for kind in [PrimitiveKind::TriangleList, PrimitiveKind::TriangleStrip] {
                    scene_pipelines.push(Self::build_scene_pipeline(
                        &device,
                        &scene_shader,
                        &scene_pipeline_layout,
                        kind,
                        transparency,
                        samples,
                    ));
                }
            }
        }

        let shadow_list_pipeline = Self::build_shadow_pipeline(
            &device,
            &shadow_shader,
            &shadow_pipeline_layout,
            PrimitiveKind::TriangleList,
        );
        let shadow_strip_pipeline = Self::build_shadow_pipeline(
            &device,
            &shadow_shader,
            &shadow_pipeline_layout,
            PrimitiveKind::TriangleStrip,
        );

        let ui_quad_pipelines = [
            Self::build_ui_pipeline(
                &device,
                &ui_shader,
                &ui_pipeline_layout,
                wgpu::PrimitiveTopology::TriangleList,
                1,
            ),
            Self::build_ui_pipeline(
                &device,
                &ui_shader,
                &ui_pipeline_layout,
                wgpu::PrimitiveTopology::TriangleList,
                MSAA_SAMPLES,
            ),
        ];
        let ui_line_pipelines = [
            Self::build_ui_pipeline(
                &device,
                &ui_shader,
                &ui_pipeline_layout,
                wgpu::PrimitiveTopology::LineStrip,
                1,
            ),
            Self::build_ui_pipeline(
                &device,
                &ui_shader,
                &ui_pipeline_layout,
                wgpu::PrimitiveTopology::LineStrip,
                MSAA_SAMPLES,
            ),
        ];

        let blit_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Blit Pipeline"),
            layout: Some(&ui_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &ui_shader,
                entry_point: Some("blit_vs"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &ui_shader,
                entry_point: Some("blit_fs"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: config.format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let default_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Default Sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let shadow_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Shadow Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            compare: Some(wgpu::CompareFunction::Less),
            ..Default::default()
        });

        let white = device.create_texture_with_data(
            &queue,
            &wgpu::TextureDescriptor {
                label: Some("White Texture"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: OFFSCREEN_FORMAT,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            &[255, 255, 255, 255],
        );
        let white_view = white.create_view(&wgpu::TextureViewDescriptor::default());

        let dummy_depth = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Dummy Depth"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let dummy_depth_view = dummy_depth.create_view(&wgpu::TextureViewDescriptor::default());

        let ui_white_bind_group = Arc::new(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("UI White Bind Group"),
            layout: &ui_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&white_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&default_sampler),
                },
            ],
        }));

        Self {
            surface,
            device,
            queue,
            config,
            size,
            offscreen,
            offscreen_view,
            offscreen_depth_view,
            msaa_color_view,
            msaa_depth_view,
            scene_globals_layout,
            scene_draw_layout,
            shadow_layout,
            ui_layout,
            scene_pipelines,
            shadow_list_pipeline,
            shadow_strip_pipeline,
            ui_quad_pipelines,
            ui_line_pipelines,
            blit_pipeline,
            default_sampler,
            shadow_sampler,
            white_view,
            dummy_depth_view,
            ui_white_bind_group,
            textures: FxHashMap::default(),
            buffers: FxHashMap::default(),
            next_texture: 1,
            next_buffer: 1,
            commands: Vec::new(),
            frame: None,
            clear_color: wgpu::Color::BLACK,
            frame_cleared: false,
            msaa_enabled: false,
            transparency: Transparency::Opaque,
            shadow_proj: Mat4::IDENTITY,
            shadow_view: Mat4::IDENTITY,
            staged_globals: SceneGlobals::default(),
            globals_bound: false,
        }
    }

    /// Blocking wrapper around [`WgpuDevice::new`].
    pub fn new_blocking(window: Arc<Window>, vsync: bool) -> Self {
        pollster::block_on(Self::new(window, vsync))
    }

    /// Resize the surface and the offscreen targets.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.size = (width, height);
        self.config.width = width;
        self.config.height = height;
        self.surface.configure(&self.device, &self.config);

        let (offscreen, offscreen_view, offscreen_depth_view, msaa_color_view, msaa_depth_view) =
            Self::create_targets(&self.device, width, height);
        self.offscreen = offscreen;
        self.offscreen_view = offscreen_view;
        self.offscreen_depth_view = offscreen_depth_view;
        self.msaa_color_view = msaa_color_view;
        self.msaa_depth_view = msaa_depth_view;

        log::debug!("Resized to {}x{}", width, height);
    }

    fn create_targets(
        device: &wgpu::Device,
        width: u32,
        height: u32,
    ) -> (
        wgpu::Texture,
        wgpu::TextureView,
        wgpu::TextureView,
        wgpu::TextureView,
        wgpu::TextureView,
    ) {
        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };

        let offscreen = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Offscreen Color"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: OFFSCREEN_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let offscreen_view = offscreen.create_view(&wgpu::TextureViewDescriptor::default());

        let depth = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Offscreen Depth"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let offscreen_depth_view = depth.create_view(&wgpu::TextureViewDescriptor::default());

        let msaa_color = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("MSAA Color"),
            size,
            mip_level_count: 1,
            sample_count: MSAA_SAMPLES,
            dimension: wgpu::TextureDimension::D2,
            format: OFFSCREEN_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let msaa_color_view = msaa_color.create_view(&wgpu::TextureViewDescriptor::default());

        let msaa_depth = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("MSAA Depth"),
            size,
            mip_level_count: 1,
            sample_count: MSAA_SAMPLES,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let msaa_depth_view = msaa_depth.create_view(&wgpu::TextureViewDescriptor::default());

        (
            offscreen,
            offscreen_view,
            offscreen_depth_view,
            msaa_color_view,
            msaa_depth_view,
        )
    }

    fn build_scene_pipeline(
        device: &wgpu::Device,
        shader: &wgpu::ShaderModule,
        layout: &wgpu::PipelineLayout,
        kind: PrimitiveKind,
        transparency: Transparency,
        samples: u32,
    ) -> wgpu::RenderPipeline {
        let ghost = transparency == Transparency::Ghost;
        let blend = if ghost {
            wgpu::BlendState {
                color: wgpu::BlendComponent {
                    src_factor: wgpu::BlendFactor::One,
                    dst_factor: wgpu::BlendFactor::One,
                    operation: wgpu::BlendOperation::Add,
                },
                alpha: wgpu::BlendComponent::REPLACE,
            }
        } else {
            wgpu::BlendState::REPLACE
        };

        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Scene Pipeline"),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module: shader,
                entry_point: Some("vs_main"),
                buffers: &[scene_vertex_layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: OFFSCREEN_FORMAT,
                    blend: Some(blend),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: topology_of(kind),
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: if ghost { None } else { Some(wgpu::Face::Back) },
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: !ghost,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState {
                count: samples,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
            cache: None,
        })
    }

    fn build_shadow_pipeline(
        device: &wgpu::Device,
        shader: &wgpu::ShaderModule,
        layout: &wgpu::PipelineLayout,
        kind: PrimitiveKind,
    ) -> wgpu::RenderPipeline {
        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Shadow Pipeline"),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module: shader,
                entry_point: Some("vs_main"),
                buffers: &[scene_vertex_layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: shader,
                entry_point: Some("fs_main"),
                targets: &[],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: topology_of(kind),
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState {
                    constant: 2,
                    slope_scale: 2.0,
                    clamp: 0.0,
                },
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        })
    }

    fn build_ui_pipeline(
        device: &wgpu::Device,
        shader: &wgpu::ShaderModule,
        layout: &wgpu::PipelineLayout,
        topology: wgpu::PrimitiveTopology,
        samples: u32,
    ) -> wgpu::RenderPipeline {
        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("UI Pipeline"),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module: shader,
                entry_point: Some("vs_main"),
                buffers: &[ui_vertex_layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: OFFSCREEN_FORMAT,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState {
                count: samples,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
            cache: None,
        })
    }

    fn sampler_for(&self, params: &TextureParams) -> wgpu::Sampler {
        let (mag, min, mip) = match params.filter {
            TextureFilter::Nearest => (
                wgpu::FilterMode::Nearest,
                wgpu::FilterMode::Nearest,
                wgpu::FilterMode::Nearest,
            ),
            TextureFilter::Bilinear => (
                wgpu::FilterMode::Linear,
                wgpu::FilterMode::Linear,
                wgpu::FilterMode::Nearest,
            ),
            TextureFilter::Trilinear => (
                wgpu::FilterMode::Linear,
                wgpu::FilterMode::Linear,
                wgpu::FilterMode::Linear,
            ),
        };
        let address = if params.repeat {
            wgpu::AddressMode::Repeat
        } else {
            wgpu::AddressMode::ClampToEdge
        };

        self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Texture Sampler"),
            address_mode_u: address,
            address_mode_v: address,
            address_mode_w: address,
            mag_filter: mag,
            min_filter: min,
            mipmap_filter: mip,
            ..Default::default()
        })
    }

    fn write_texture_levels(&self, texture: &wgpu::Texture, image: &RgbaImage, levels: u32) {
        let (width, height) = image.dimensions();
        for level in 0..levels {
            let w = (width >> level).max(1);
            let h = (height >> level).max(1);
            let scaled;
            let data: &[u8] = if level == 0 {
                image.as_raw()
            } else {
                scaled = image::imageops::resize(image, w, h, image::imageops::FilterType::Triangle);
                scaled.as_raw()
            };
            self.queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture,
                    mip_level: level,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                data,
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(4 * w),
                    rows_per_image: Some(h),
                },
                wgpu::Extent3d {
                    width: w,
                    height: h,
                    depth_or_array_layers: 1,
                },
            );
        }
    }

    /// View for a color texture handle, falling back to the white pixel.
    fn color_view(&self, handle: TextureHandle) -> &wgpu::TextureView {
        match self.textures.get(&handle) {
            Some(tex) if tex.sampler.is_some() => &tex.view,
            _ => &self.white_view,
        }
    }

    fn tier_bind_group(&self, transform: Mat4, binding: &TierBinding) -> wgpu::BindGroup {
        let uniform = DrawUniform::from_binding(transform, binding);
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Draw Uniform"),
                contents: bytemuck::bytes_of(&uniform),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let sampler = self
            .textures
            .get(&binding.albedo)
            .and_then(|tex| tex.sampler.as_ref())
            .unwrap_or(&self.default_sampler);

        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Draw Bind Group"),
            layout: &self.scene_draw_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(self.color_view(binding.albedo)),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(self.color_view(binding.detail)),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::TextureView(self.color_view(binding.emissive)),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: wgpu::BindingResource::TextureView(self.color_view(binding.material)),
                },
            ],
        })
    }

    fn ui_bind_group(&self, texture: TextureHandle) -> Arc<wgpu::BindGroup> {
        if !texture.is_valid() {
            return Arc::clone(&self.ui_white_bind_group);
        }
        Arc::new(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("UI Bind Group"),
            layout: &self.ui_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(self.color_view(texture)),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.default_sampler),
                },
            ],
        }))
    }

    /// Passes without an explicit shadow map still need globals bound.
    fn ensure_scene_globals(&mut self) {
        if !self.globals_bound {
            self.bind_scene_globals(self.staged_globals, None);
        }
    }

    fn bind_scene_globals(&mut self, globals: SceneGlobals, atlas: Option<TextureHandle>) {
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Scene Globals"),
                contents: bytemuck::bytes_of(&globals),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let atlas_view = match atlas.and_then(|handle| self.textures.get(&handle)) {
            Some(tex) => &tex.view,
            None => &self.dummy_depth_view,
        };

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Scene Globals Bind Group"),
            layout: &self.scene_globals_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(atlas_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.shadow_sampler),
                },
            ],
        });

        self.commands.push(Cmd::SceneGlobals { bind_group });
        self.globals_bound = true;
    }

    /// Replay all recorded commands and submit them.
    fn flush(&mut self) {
        if self.commands.is_empty() {
            return;
        }
        let commands = std::mem::take(&mut self.commands);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Replay Encoder"),
            });

        let mut i = 0;
        while i < commands.len() {
            match &commands[i] {
                Cmd::BeginShadow { .. } => {
                    i = self.replay_shadow_pass(&mut encoder, &commands, i);
                }
                Cmd::BeginScene { msaa } => {
                    let clear = (!self.frame_cleared).then_some(self.clear_color);
                    self.frame_cleared = true;
                    i = self.replay_scene_pass(&mut encoder, &commands, i, *msaa, clear);
                }
                Cmd::BeginUi { msaa } => {
                    let clear = (!self.frame_cleared).then_some(self.clear_color);
                    self.frame_cleared = true;
                    i = self.replay_ui_pass(&mut encoder, &commands, i, *msaa, clear);
                }
                _ => i += 1,
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn replay_shadow_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        commands: &[Cmd],
        start: usize,
    ) -> usize {
        let mut i = start + 1;
        let atlas = match &commands[start] {
            Cmd::BeginShadow { atlas } => *atlas,
            _ => return i,
        };
        let Some(tex) = self.textures.get(&atlas) else {
            while i < commands.len() && !matches!(commands[i], Cmd::EndShadow) {
                i += 1;
            }
            return i + 1;
        };

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Shadow Pass"),
            color_attachments: &[],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &tex.view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        let atlas_size = tex.size.0 as f32;
        while i < commands.len() {
            match &commands[i] {
                Cmd::ShadowRegion { offset, scale } => {
                    pass.set_viewport(
                        offset.x * atlas_size,
                        offset.y * atlas_size,
                        scale.x * atlas_size,
                        scale.y * atlas_size,
                        0.0,
                        1.0,
                    );
                }
                Cmd::ShadowCaster {
                    buffer,
                    kind,
                    bind_group,
                } => {
                    if let Some(buf) = self.buffers.get(buffer) {
                        let pipeline = match kind {
                            PrimitiveKind::TriangleList => &self.shadow_list_pipeline,
                            PrimitiveKind::TriangleStrip => &self.shadow_strip_pipeline,
                        };
                        pass.set_pipeline(pipeline);
                        pass.set_bind_group(0, bind_group, &[]);
                        pass.set_vertex_buffer(0, buf.buffer.slice(..));
                        pass.draw(0..buf.len, 0..1);
                    }
                }
                Cmd::EndShadow => return i + 1,
                _ => {}
            }
            i += 1;
        }
        i
    }

    fn replay_scene_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        commands: &[Cmd],
        start: usize,
        msaa: bool,
        clear: Option<wgpu::Color>,
    ) -> usize {
        let (color_view, resolve_target) = if msaa {
            (&self.msaa_color_view, Some(&self.offscreen_view))
        } else {
            (&self.offscreen_view, None)
        };
        let depth_view = if msaa {
            &self.msaa_depth_view
        } else {
            &self.offscreen_depth_view
        };

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Scene Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: color_view,
                resolve_target,
                ops: wgpu::Operations {
                    load: clear.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        let mut i = start + 1;
        while i < commands.len() {
            match &commands[i] {
                Cmd::SceneGlobals { bind_group } => {
                    pass.set_bind_group(0, bind_group, &[]);
                }
                Cmd::SceneTier {
                    buffer,
                    kind,
                    transparency,
                    bind_group,
                } => {
                    if let Some(buf) = self.buffers.get(buffer) {
                        let index = scene_pipeline_index(*kind, *transparency, msaa);
                        pass.set_pipeline(&self.scene_pipelines[index]);
                        pass.set_bind_group(1, bind_group, &[]);
                        pass.set_vertex_buffer(0, buf.buffer.slice(..));
                        pass.draw(0..buf.len, 0..1);
                    }
                }
                Cmd::SceneImmediate {
                    buffer,
                    count,
                    kind,
                    transparency,
                    bind_group,
                } => {
                    let index = scene_pipeline_index(*kind, *transparency, msaa);
                    pass.set_pipeline(&self.scene_pipelines[index]);
                    pass.set_bind_group(1, bind_group, &[]);
                    pass.set_vertex_buffer(0, buffer.slice(..));
                    pass.draw(0..*count, 0..1);
                }
                Cmd::EndScene => return i + 1,
                _ => {}
            }
            i += 1;
        }
        i
    }

    fn replay_ui_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        commands: &[Cmd],
        start: usize,
        msaa: bool,
        clear: Option<wgpu::Color>,
    ) -> usize {
        let (color_view, resolve_target) = if msaa {
            (&self.msaa_color_view, Some(&self.offscreen_view))
        } else {
            (&self.offscreen_view, None)
        };
        let pipeline_slot = usize::from(msaa);

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("UI Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: color_view,
                resolve_target,
                ops: wgpu::Operations {
                    load: clear.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        let mut i = start + 1;
        while i < commands.len() {
            match &commands[i] {
                Cmd::UiQuad {
                    buffer,
                    count,
                    bind_group,
                } => {
                    pass.set_pipeline(&self.ui_quad_pipelines[pipeline_slot]);
                    pass.set_bind_group(0, bind_group.as_ref(), &[]);
                    pass.set_vertex_buffer(0, buffer.slice(..));
                    pass.draw(0..*count, 0..1);
                }
                Cmd::UiLines {
                    buffer,
                    count,
                    bind_group,
                } => {
                    pass.set_pipeline(&self.ui_line_pipelines[pipeline_slot]);
                    pass.set_bind_group(0, bind_group.as_ref(), &[]);
                    pass.set_vertex_buffer(0, buffer.slice(..));
                    pass.draw(0..*count, 0..1);
                }
                Cmd::EndUi => return i + 1,
                _ => {}
            }
            i += 1;
        }
        i
    }
}

impl ShadowPass for WgpuDevice {
    fn begin_shadow(&mut self, atlas: TextureHandle) {
        self.commands.push(Cmd::BeginShadow { atlas });
    }

    fn set_shadow_region(&mut self, offset: Vec2, scale: Vec2) {
        self.commands.push(Cmd::ShadowRegion { offset, scale });
    }

    fn set_shadow_matrices(&mut self, projection: Mat4, view: Mat4) {
        self.shadow_proj = projection;
        self.shadow_view = view;
    }

    fn draw_shadow_caster(
        &mut self,
        buffer: BufferHandle,
        kind: PrimitiveKind,
        transform: Mat4,
        albedo: TextureHandle,
    ) {
        let uniform = CasterUniform {
            mvp: (self.shadow_proj * self.shadow_view * transform).to_cols_array_2d(),
        };
        let uniform_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Caster Uniform"),
                contents: bytemuck::bytes_of(&uniform),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Caster Bind Group"),
            layout: &self.shadow_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(self.color_view(albedo)),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.default_sampler),
                },
            ],
        });

        self.commands.push(Cmd::ShadowCaster {
            buffer,
            kind,
            bind_group,
        });
    }

    fn end_shadow(&mut self) {
        self.commands.push(Cmd::EndShadow);
    }
}

impl ScenePass for WgpuDevice {
    fn begin_scene(&mut self, projection: Mat4, view: Mat4) {
        self.staged_globals = SceneGlobals::new(projection, view);
        self.globals_bound = false;
        self.transparency = Transparency::Opaque;
        self.commands.push(Cmd::BeginScene {
            msaa: self.msaa_enabled,
        });
    }

    fn set_shadow_map(&mut self, atlas: Option<TextureHandle>, regions: &[ShadowRegionBinding]) {
        let mut globals = self.staged_globals;
        if let Some(atlas) = atlas.filter(|a| a.is_valid()) {
            for (slot, region) in regions.iter().take(4).enumerate() {
                globals.shadow_matrix[slot] = region.matrix.to_cols_array_2d();
                globals.shadow_rect[slot] = [
                    region.uv_offset.x,
                    region.uv_offset.y,
                    region.uv_scale.x,
                    region.uv_scale.y,
                ];
            }
            globals.shadow_count = regions.len().min(4) as u32;
            self.bind_scene_globals(globals, Some(atlas));
        } else {
            self.bind_scene_globals(globals, None);
        }
    }

    fn set_transparency(&mut self, mode: Transparency) {
        self.transparency = mode;
    }

    fn draw_tier(
        &mut self,
        buffer: BufferHandle,
        kind: PrimitiveKind,
        transform: Mat4,
        binding: &TierBinding,
    ) {
        self.ensure_scene_globals();
        let bind_group = self.tier_bind_group(transform, binding);
        self.commands.push(Cmd::SceneTier {
            buffer,
            kind,
            transparency: self.transparency,
            bind_group,
        });
    }

    fn draw_immediate(
        &mut self,
        kind: PrimitiveKind,
        vertices: &[Vertex],
        texture: TextureHandle,
        transparency: Transparency,
    ) {
        if vertices.is_empty() {
            return;
        }
        self.ensure_scene_globals();

        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Immediate Buffer"),
                contents: bytemuck::cast_slice(vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });

        let binding = TierBinding {
            albedo: texture,
            ..TierBinding::default()
        };
        let bind_group = self.tier_bind_group(Mat4::IDENTITY, &binding);

        self.commands.push(Cmd::SceneImmediate {
            buffer,
            count: vertices.len() as u32,
            kind,
            transparency,
            bind_group,
        });
    }

    fn end_scene(&mut self) {
        self.ensure_scene_globals();
        self.commands.push(Cmd::EndScene);
    }
}

impl UiPass for WgpuDevice {
    fn begin_ui(&mut self) {
        self.commands.push(Cmd::BeginUi {
            msaa: self.msaa_enabled,
        });
    }

    fn draw_quad(
        &mut self,
        p1: Vec2,
        p2: Vec2,
        uv1: Vec2,
        uv2: Vec2,
        texture: TextureHandle,
        color: [f32; 4],
    ) {
        let corner = |x: f32, y: f32, u: f32, v: f32| UiVertex {
            position: [x, y],
            uv: [u, v],
            color,
        };
        let vertices = [
            corner(p1.x, p1.y, uv1.x, uv1.y),
            corner(p2.x, p1.y, uv2.x, uv1.y),
            corner(p2.x, p2.y, uv2.x, uv2.y),
            corner(p1.x, p1.y, uv1.x, uv1.y),
            corner(p2.x, p2.y, uv2.x, uv2.y),
            corner(p1.x, p2.y, uv1.x, uv2.y),
        ];

        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("UI Quad Buffer"),
                contents: bytemuck::cast_slice(&vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });

        let bind_group = self.ui_bind_group(texture);
        self.commands.push(Cmd::UiQuad {
            buffer,
            count: 6,
            bind_group,
        });
    }

    fn draw_lines(&mut self, points: &[Vec2], color: [f32; 4]) {
        if points.len() < 2 {
            return;
        }
        let vertices: Vec<UiVertex> = points
            .iter()
            .map(|p| UiVertex {
                position: [p.x, p.y],
                uv: [0.0, 0.0],
                color,
            })
            .collect();

        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("UI Line Buffer"),
                contents: bytemuck::cast_slice(&vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });

        self.commands.push(Cmd::UiLines {
            buffer,
            count: vertices.len() as u32,
            bind_group: Arc::clone(&self.ui_white_bind_group),
        });
    }

    fn end_ui(&mut self) {
        self.commands.push(Cmd::EndUi);
    }
}

impl Device for WgpuDevice {
    fn caps(&self) -> DeviceCaps {
        DeviceCaps {
            shadow_mapping: true,
            offscreen_framebuffers: true,
            max_texture_size: self.device.limits().max_texture_dimension_2d,
            msaa: true,
        }
    }

    fn create_texture(
        &mut self,
        image: &RgbaImage,
        params: &TextureParams,
        label: &str,
    ) -> Option<TextureHandle> {
        let (width, height) = image.dimensions();
        let limit = self.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > limit || height > limit {
            return None;
        }

        let mip_levels = mip_level_count(width, height, params.mipmap);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: mip_levels,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: OFFSCREEN_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.write_texture_levels(&texture, image, mip_levels);

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = self.sampler_for(params);

        let handle = TextureHandle(self.next_texture);
        self.next_texture += 1;
        self.textures.insert(
            handle,
            GpuTexture {
                texture,
                view,
                sampler: Some(sampler),
                size: (width, height),
                mip_levels,
            },
        );
        Some(handle)
    }

    fn update_texture(&mut self, handle: TextureHandle, image: &RgbaImage) {
        let Some(tex) = self.textures.get(&handle) else {
            return;
        };
        if tex.size != image.dimensions() {
            log::warn!("update_texture size mismatch, ignoring");
            return;
        }
        self.write_texture_levels(&tex.texture, image, tex.mip_levels);
    }

    fn destroy_texture(&mut self, handle: TextureHandle) {
        self.textures.remove(&handle);
    }

    fn destroy_all_textures(&mut self) {
        self.textures.clear();
    }

    fn create_depth_texture(&mut self, size: u32) -> Option<TextureHandle> {
        let limit = self.device.limits().max_texture_dimension_2d;
        if size == 0 || size > limit {
            return None;
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Shadow Atlas"),
            size: wgpu::Extent3d {
                width: size,
                height: size,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let handle = TextureHandle(self.next_texture);
        self.next_texture += 1;
        self.textures.insert(
            handle,
            GpuTexture {
                texture,
                view,
                sampler: None,
                size: (size, size),
                mip_levels: 1,
            },
        );
        Some(handle)
    }

    fn create_vertex_buffer(&mut self, _kind: PrimitiveKind, vertices: &[Vertex]) -> BufferHandle {
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Vertex Buffer"),
                contents: bytemuck::cast_slice(vertices),
                usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            });

        let handle = BufferHandle(self.next_buffer);
        self.next_buffer += 1;
        self.buffers.insert(
            handle,
            GpuBuffer {
                buffer,
                len: vertices.len() as u32,
                capacity: std::mem::size_of_val(vertices) as u64,
            },
        );
        handle
    }

    fn update_vertex_buffer(
        &mut self,
        handle: BufferHandle,
        _kind: PrimitiveKind,
        vertices: &[Vertex],
    ) {
        let Some(buf) = self.buffers.get_mut(&handle) else {
            return;
        };
        let bytes: &[u8] = bytemuck::cast_slice(vertices);
        if (bytes.len() as u64) <= buf.capacity {
            self.queue.write_buffer(&buf.buffer, 0, bytes);
            buf.len = vertices.len() as u32;
        } else {
            buf.buffer = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("Vertex Buffer"),
                    contents: bytes,
                    usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
                });
            buf.len = vertices.len() as u32;
            buf.capacity = bytes.len() as u64;
        }
    }

    fn destroy_vertex_buffer(&mut self, handle: BufferHandle) {
        self.buffers.remove(&handle);
    }

    fn begin_frame(&mut self, clear: [f32; 4]) -> bool {
        let output = match self.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                self.surface.configure(&self.device, &self.config);
                return false;
            }
            Err(e) => {
                log::error!("Surface error: {:?}", e);
                return false;
            }
        };

        self.frame = Some(output);
        self.clear_color = wgpu::Color {
            r: f64::from(clear[0]),
            g: f64::from(clear[1]),
            b: f64::from(clear[2]),
            a: f64::from(clear[3]),
        };
        self.frame_cleared = false;
        self.commands.clear();
        true
    }

    fn end_frame(&mut self) {
        self.flush();
        let Some(output) = self.frame.take() else {
            return;
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Present Encoder"),
            });

        // A frame with no passes still presents the clear color.
        if !self.frame_cleared {
            encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Clear Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.offscreen_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(self.clear_color),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            self.frame_cleared = true;
        }

        let surface_view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let blit_bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Blit Bind Group"),
            layout: &self.ui_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&self.offscreen_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.default_sampler),
                },
            ],
        });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Blit Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &surface_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.blit_pipeline);
            pass.set_bind_group(0, &blit_bind_group, &[]);
            pass.draw(0..3, 0..1);
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();
    }

    fn set_msaa(&mut self, enabled: bool) {
        self.msaa_enabled = enabled;
    }

    fn read_framebuffer(&mut self) -> Option<RgbaImage> {
        self.flush();

        let (width, height) = self.size;
        let padded_row = padded_bytes_per_row(width);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: u64::from(padded_row) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.offscreen,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            _ => {
                log::error!("Framebuffer readback failed");
                return None;
            }
        }

        let data = slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        for row in 0..height {
            let start = (row * padded_row) as usize;
            pixels.extend_from_slice(&data[start..start + (width * 4) as usize]);
        }
        drop(data);
        staging.unmap();

        RgbaImage::from_raw(width, height, pixels)
    }

    fn size(&self) -> (u32, u32) {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_level_count() {
        assert_eq!(mip_level_count(1, 1, true), 1);
        assert_eq!(mip_level_count(256, 256, true), 9);
        assert_eq!(mip_level_count(640, 480, true), 10);
        assert_eq!(mip_level_count(1024, 1024, false), 1);
    }

    #[test]
    fn test_padded_bytes_per_row() {
        assert_eq!(padded_bytes_per_row(64), 256);
        assert_eq!(padded_bytes_per_row(65), 512);
        assert_eq!(padded_bytes_per_row(640), 2560);
        assert_eq!(padded_bytes_per_row(100), 512);
    }

    #[test]
    fn test_scene_pipeline_index_is_unique() {
        let mut seen = [false; 8];
        for msaa in [false, true] {
            for transparency in [Transparency::Opaque, Transparency::Ghost] {
                for kind in [PrimitiveKind::TriangleList, PrimitiveKind::TriangleStrip] {
                    let index = scene_pipeline_index(kind, transparency, msaa);
                    assert!(!seen[index]);
                    seen[index] = true;
                }
            }
        }
        assert!(seen.iter().all(|&s| s));
    }
}
