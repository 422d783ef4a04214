//! wgpu implementation of [`ComputeDevice`]
//!
//! Every command is recorded into its own encoder and submitted immediately, so the
//! queue order is the command order. Bind groups are built at dispatch time from the
//! resources bound to each slot.

use std::borrow::Cow;
use std::sync::Arc;

use futures::channel::oneshot;
use rustc_hash::FxHashMap;

use crate::constants::{layout::COUNTER_STRIDE, slots};
use crate::error::{ErrorContext, TerrainError, TerrainResult};
use crate::gpu::kernel::StorageAccess;
use crate::gpu::{
    BindingInfo, BindingKind, BufferDescriptor, BufferId, BufferKind, ChunkUniforms,
    ComputeDevice, ComputeProgram, DeviceLimits, EntryPoint, KernelHandle, TransferId,
    VolumeDescriptor, VolumeFormat, VolumeId,
};

type MapResult = Result<(), wgpu::BufferAsyncError>;

struct GpuBuffer {
    label: String,
    buffer: wgpu::Buffer,
    /// Companion atomic counter of an append buffer
    counter: Option<wgpu::Buffer>,
    kind: BufferKind,
    size: u64,
}

struct GpuVolume {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: VolumeFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundResource {
    Buffer(BufferId),
    Counter(BufferId),
    Volume(VolumeId),
}

struct GpuKernel {
    name: String,
    bindings: Vec<BindingInfo>,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    uniform_buffer: Option<wgpu::Buffer>,
    uniforms_written: bool,
    bound: FxHashMap<u32, BoundResource>,
}

impl GpuKernel {
    fn binding(&self, slot: &str) -> TerrainResult<&BindingInfo> {
        self.bindings
            .iter()
            .find(|b| b.name == slot)
            .ok_or_else(|| TerrainError::UnknownSlot {
                kernel: self.name.clone(),
                slot: slot.to_string(),
            })
    }
}

struct GpuTransfer {
    staging: wgpu::Buffer,
    size: u64,
    receiver: oneshot::Receiver<MapResult>,
    ready: bool,
}

/// Compute backend on a wgpu device and queue
pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    buffers: FxHashMap<BufferId, GpuBuffer>,
    volumes: FxHashMap<VolumeId, GpuVolume>,
    kernels: FxHashMap<KernelHandle, GpuKernel>,
    transfers: FxHashMap<TransferId, GpuTransfer>,
    next_id: u32,
    limits: DeviceLimits,
}

impl WgpuDevice {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        let raw = device.limits();
        let limits = DeviceLimits {
            max_buffer_size: raw.max_buffer_size.min(raw.max_storage_buffer_binding_size as u64),
            max_workgroups_per_dimension: raw.max_compute_workgroups_per_dimension,
            max_texture_dimension_3d: raw.max_texture_dimension_3d,
        };
        log::info!(
            "[WgpuDevice] Compute limits: max buffer {} MB, {} workgroups per dimension, 3D textures up to {}",
            limits.max_buffer_size / 1024 / 1024,
            limits.max_workgroups_per_dimension,
            limits.max_texture_dimension_3d
        );
        Self {
            device,
            queue,
            buffers: FxHashMap::default(),
            volumes: FxHashMap::default(),
            kernels: FxHashMap::default(),
            transfers: FxHashMap::default(),
            next_id: 1,
            limits,
        }
    }

    /// Create a headless device, trying high performance, low power, then the
    /// fallback adapter
    pub async fn request() -> TerrainResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let mut options = wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        };

        let adapter = match instance.request_adapter(&options).await {
            Some(adapter) => adapter,
            None => {
                log::warn!("[WgpuDevice] No high-performance adapter found, trying low power...");
                options.power_preference = wgpu::PowerPreference::LowPower;
                match instance.request_adapter(&options).await {
                    Some(adapter) => adapter,
                    None => {
                        log::warn!("[WgpuDevice] No low-power adapter found, trying fallback...");
                        options.force_fallback_adapter = true;
                        instance.request_adapter(&options).await.ok_or_else(|| {
                            TerrainError::DeviceUnavailable {
                                reason: "no GPU adapter found".to_string(),
                            }
                        })?
                    }
                }
            }
        };

        let info = adapter.get_info();
        log::info!(
            "[WgpuDevice] Adapter: {} ({:?}, {:?})",
            info.name,
            info.device_type,
            info.backend
        );

        let adapter_limits = adapter.limits();
        let required_limits = wgpu::Limits {
            max_buffer_size: adapter_limits.max_buffer_size,
            max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
            max_texture_dimension_3d: adapter_limits.max_texture_dimension_3d,
            ..wgpu::Limits::default()
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Isoterrain Compute Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits,
                },
                None,
            )
            .await
            .map_err(|e| TerrainError::DeviceUnavailable {
                reason: e.to_string(),
            })?;

        Ok(Self::new(Arc::new(device), Arc::new(queue)))
    }

    /// Blocking variant of [`WgpuDevice::request`]
    pub fn request_blocking() -> TerrainResult<Self> {
        pollster::block_on(Self::request())
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    /// Raw buffer behind an id, for render pass recording
    pub fn raw_buffer(&self, id: BufferId) -> Option<&wgpu::Buffer> {
        self.buffers.get(&id).map(|b| &b.buffer)
    }

    /// One `draw_indirect` per chunk: vertex buffer 0 holds positions, 1 holds normals
    pub fn record_indirect_draws<'a>(
        &'a self,
        pass: &mut wgpu::RenderPass<'a>,
        draws: &[crate::renderer::IndirectDraw],
    ) -> TerrainResult<u32> {
        let mut recorded = 0;
        for draw in draws {
            let vertices = self.gpu_buffer(draw.vertices)?;
            let normals = self.gpu_buffer(draw.normals)?;
            let args = self.gpu_buffer(draw.args)?;
            pass.set_vertex_buffer(0, vertices.buffer.slice(..));
            pass.set_vertex_buffer(1, normals.buffer.slice(..));
            pass.draw_indirect(&args.buffer, 0);
            recorded += 1;
        }
        Ok(recorded)
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn gpu_buffer(&self, id: BufferId) -> TerrainResult<&GpuBuffer> {
        self.buffers.get(&id).ok_or(TerrainError::UnknownResource {
            kind: BufferId::KIND,
            id: id.0,
        })
    }

    fn kernel_mut(&mut self, handle: KernelHandle) -> TerrainResult<&mut GpuKernel> {
        self.kernels.get_mut(&handle).ok_or(TerrainError::UnknownResource {
            kind: KernelHandle::KIND,
            id: handle.0,
        })
    }

    fn submit(&self, encoder: wgpu::CommandEncoder) {
        self.queue.submit(Some(encoder.finish()));
    }

    fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    /// Copy a range into a fresh staging buffer and start mapping it
    fn stage_read(
        &self,
        buffer: BufferId,
        offset: u64,
        size: u64,
    ) -> TerrainResult<(wgpu::Buffer, oneshot::Receiver<MapResult>)> {
        let source = self.gpu_buffer(buffer)?;
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0
            || size % wgpu::COPY_BUFFER_ALIGNMENT != 0
            || offset + size > source.size
        {
            return Err(TerrainError::TransferFailed {
                reason: format!(
                    "range {}..{} invalid for '{}' ({} bytes)",
                    offset,
                    offset + size,
                    source.label,
                    source.size
                ),
            });
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Staging Buffer"),
            size: size.max(COUNTER_STRIDE),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.encoder("Readback Copy");
        if size > 0 {
            encoder.copy_buffer_to_buffer(&source.buffer, offset, &staging, 0, size);
        }
        self.submit(encoder);

        let (sender, receiver) = oneshot::channel();
        staging
            .slice(..size.max(COUNTER_STRIDE))
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = sender.send(result);
            });
        Ok((staging, receiver))
    }

    fn mapped_bytes(staging: &wgpu::Buffer, size: u64) -> Vec<u8> {
        let data = {
            let view = staging.slice(..).get_mapped_range();
            view[..size as usize].to_vec()
        };
        staging.unmap();
        data
    }
}

fn texture_format(format: VolumeFormat) -> wgpu::TextureFormat {
    match format {
        VolumeFormat::Scalar => wgpu::TextureFormat::R32Float,
        VolumeFormat::Vector => wgpu::TextureFormat::Rgba16Float,
    }
}

fn storage_texture_format(kernel: &str, format: &str) -> TerrainResult<wgpu::TextureFormat> {
    match format {
        "r32float" => Ok(wgpu::TextureFormat::R32Float),
        "rgba16float" => Ok(wgpu::TextureFormat::Rgba16Float),
        "rgba32float" => Ok(wgpu::TextureFormat::Rgba32Float),
        other => Err(TerrainError::KernelCompilation {
            kernel: kernel.to_string(),
            error: format!("unsupported storage texture format '{}'", other),
        }),
    }
}

/// Bind group layout entry for one parsed binding
fn layout_entry(kernel: &str, info: &BindingInfo) -> TerrainResult<wgpu::BindGroupLayoutEntry> {
    let ty = match &info.kind {
        BindingKind::Uniform => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingKind::StorageBuffer { read_only } => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage {
                read_only: *read_only,
            },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingKind::Texture => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D3,
            multisampled: false,
        },
        BindingKind::StorageTexture { format, access } => wgpu::BindingType::StorageTexture {
            access: match access {
                StorageAccess::Read => wgpu::StorageTextureAccess::ReadOnly,
                StorageAccess::Write => wgpu::StorageTextureAccess::WriteOnly,
                StorageAccess::ReadWrite => wgpu::StorageTextureAccess::ReadWrite,
            },
            format: storage_texture_format(kernel, format)?,
            view_dimension: wgpu::TextureViewDimension::D3,
        },
    };
    Ok(wgpu::BindGroupLayoutEntry {
        binding: info.binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty,
        count: None,
    })
}

fn buffer_usage(kind: BufferKind) -> wgpu::BufferUsages {
    let copy = wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
    match kind {
        BufferKind::Storage | BufferKind::Append { .. } | BufferKind::Readback => {
            wgpu::BufferUsages::STORAGE | copy
        }
        BufferKind::Vertex => wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::STORAGE | copy,
        BufferKind::IndirectArgs => wgpu::BufferUsages::INDIRECT | copy,
    }
}

impl ComputeDevice for WgpuDevice {
    fn backend_name(&self) -> &'static str {
        "wgpu"
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> TerrainResult<BufferId> {
        if desc.size > self.limits.max_buffer_size {
            return Err(TerrainError::ResourceLimit {
                resource: desc.label.to_string(),
                requested: desc.size,
                limit: self.limits.max_buffer_size,
            });
        }
        let size = desc.size.max(COUNTER_STRIDE).div_ceil(4) * 4;

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size,
            usage: buffer_usage(desc.kind),
            mapped_at_creation: false,
        });
        let counter = matches!(desc.kind, BufferKind::Append { .. }).then(|| {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&format!("{} counter", desc.label)),
                size: COUNTER_STRIDE,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            log::error!("[WgpuDevice] Failed to allocate '{}': {}", desc.label, error);
            buffer.destroy();
            if let Some(counter) = counter {
                counter.destroy();
            }
            return Err(TerrainError::OutOfMemory {
                resource: desc.label.to_string(),
                bytes: size,
            });
        }

        let id = BufferId(self.next_id());
        self.buffers.insert(
            id,
            GpuBuffer {
                label: desc.label.to_string(),
                buffer,
                counter,
                kind: desc.kind,
                size,
            },
        );
        log::debug!("[WgpuDevice] Created buffer '{}' ({} bytes)", desc.label, size);
        Ok(id)
    }

    fn create_volume(&mut self, desc: &VolumeDescriptor) -> TerrainResult<VolumeId> {
        if desc.extent > self.limits.max_texture_dimension_3d {
            return Err(TerrainError::ResourceLimit {
                resource: desc.label.to_string(),
                requested: desc.extent as u64,
                limit: self.limits.max_texture_dimension_3d as u64,
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width: desc.extent,
                height: desc.extent,
                depth_or_array_layers: desc.extent,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D3,
            format: texture_format(desc.format),
            usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            log::error!("[WgpuDevice] Failed to allocate volume '{}': {}", desc.label, error);
            texture.destroy();
            let texel_bytes = match desc.format {
                VolumeFormat::Scalar => 4,
                VolumeFormat::Vector => 8,
            };
            return Err(TerrainError::OutOfMemory {
                resource: desc.label.to_string(),
                bytes: (desc.extent as u64).pow(3) * texel_bytes,
            });
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = VolumeId(self.next_id());
        self.volumes.insert(
            id,
            GpuVolume {
                texture,
                view,
                format: desc.format,
            },
        );
        log::debug!("[WgpuDevice] Created volume '{}' ({}^3)", desc.label, desc.extent);
        Ok(id)
    }

    fn destroy_buffer(&mut self, id: BufferId) {
        if let Some(buffer) = self.buffers.remove(&id) {
            buffer.buffer.destroy();
            if let Some(counter) = buffer.counter {
                counter.destroy();
            }
        }
    }

    fn destroy_volume(&mut self, id: VolumeId) {
        if let Some(volume) = self.volumes.remove(&id) {
            log::debug!("[WgpuDevice] Destroying {:?} volume {}", volume.format, id.0);
            volume.texture.destroy();
        }
    }

    fn buffer_size(&self, id: BufferId) -> TerrainResult<u64> {
        Ok(self.gpu_buffer(id)?.size)
    }

    fn buffer_kind(&self, id: BufferId) -> TerrainResult<BufferKind> {
        Ok(self.gpu_buffer(id)?.kind)
    }

    fn compile_kernel(
        &mut self,
        program: &ComputeProgram,
        entry: &EntryPoint,
    ) -> TerrainResult<KernelHandle> {
        let entries = program
            .bindings
            .iter()
            .map(|b| layout_entry(&entry.name, b))
            .collect::<TerrainResult<Vec<_>>>()?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&program.name),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(&program.source)),
        });
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&format!("{} Bind Group Layout", entry.name)),
                entries: &entries,
            });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&format!("{} Pipeline Layout", entry.name)),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&entry.name),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: &entry.name,
            });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            log::error!("[WgpuDevice] Kernel '{}' failed to compile", entry.name);
            return Err(TerrainError::KernelCompilation {
                kernel: entry.name.clone(),
                error: error.to_string(),
            });
        }

        let uniform_buffer = program
            .bindings
            .iter()
            .any(|b| b.kind == BindingKind::Uniform)
            .then(|| {
                self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("{} Uniforms", entry.name)),
                    size: std::mem::size_of::<ChunkUniforms>() as u64,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            });

        let handle = KernelHandle(self.next_id());
        self.kernels.insert(
            handle,
            GpuKernel {
                name: entry.name.clone(),
                bindings: program.bindings.clone(),
                pipeline,
                layout,
                uniform_buffer,
                uniforms_written: false,
                bound: FxHashMap::default(),
            },
        );
        Ok(handle)
    }

    fn set_uniforms(&mut self, kernel: KernelHandle, uniforms: &ChunkUniforms) -> TerrainResult<()> {
        let queue = Arc::clone(&self.queue);
        let kernel = self.kernel_mut(kernel)?;
        let Some(buffer) = &kernel.uniform_buffer else {
            return Err(TerrainError::UnknownSlot {
                kernel: kernel.name.clone(),
                slot: crate::constants::params::UNIFORM_BLOCK.to_string(),
            });
        };
        queue.write_buffer(buffer, 0, bytemuck::bytes_of(uniforms));
        kernel.uniforms_written = true;
        Ok(())
    }

    fn bind_buffer(&mut self, kernel: KernelHandle, slot: &str, buffer: BufferId) -> TerrainResult<()> {
        let kind = self.gpu_buffer(buffer)?.kind;
        let kernel = self.kernel_mut(kernel)?;
        let binding = kernel.binding(slot)?;
        if !matches!(binding.kind, BindingKind::StorageBuffer { .. }) {
            return Err(TerrainError::InvalidDispatch {
                kernel: kernel.name.clone(),
                reason: format!("slot '{}' is not a storage buffer", slot),
            });
        }
        let index = binding.binding;
        kernel.bound.insert(index, BoundResource::Buffer(buffer));

        let counter_slot = format!("{}{}", slot, slots::COUNTER_SUFFIX);
        if matches!(kind, BufferKind::Append { .. }) {
            if let Ok(counter) = kernel.binding(&counter_slot) {
                let index = counter.binding;
                kernel.bound.insert(index, BoundResource::Counter(buffer));
            }
        }
        Ok(())
    }

    fn bind_volume(&mut self, kernel: KernelHandle, slot: &str, volume: VolumeId) -> TerrainResult<()> {
        if !self.volumes.contains_key(&volume) {
            return Err(TerrainError::UnknownResource {
                kind: VolumeId::KIND,
                id: volume.0,
            });
        }
        let kernel = self.kernel_mut(kernel)?;
        let binding = kernel.binding(slot)?;
        if !matches!(
            binding.kind,
            BindingKind::Texture | BindingKind::StorageTexture { .. }
        ) {
            return Err(TerrainError::InvalidDispatch {
                kernel: kernel.name.clone(),
                reason: format!("slot '{}' is not a texture", slot),
            });
        }
        let index = binding.binding;
        kernel.bound.insert(index, BoundResource::Volume(volume));
        Ok(())
    }

    fn reset_counter(&mut self, buffer: BufferId) -> TerrainResult<()> {
        let target = self.gpu_buffer(buffer)?;
        let Some(counter) = &target.counter else {
            return Err(TerrainError::TransferFailed {
                reason: format!("buffer '{}' has no counter", target.label),
            });
        };
        let mut encoder = self.encoder("Reset Counter");
        encoder.clear_buffer(counter, 0, None);
        self.submit(encoder);
        Ok(())
    }

    fn dispatch(&mut self, handle: KernelHandle, groups: [u32; 3]) -> TerrainResult<()> {
        let kernel = self.kernels.get(&handle).ok_or(TerrainError::UnknownResource {
            kind: KernelHandle::KIND,
            id: handle.0,
        })?;
        let max = self.limits.max_workgroups_per_dimension;
        if groups.iter().any(|g| *g > max) {
            return Err(TerrainError::InvalidDispatch {
                kernel: kernel.name.clone(),
                reason: format!("workgroup count {:?} exceeds device limit {}", groups, max),
            });
        }

        let mut entries = Vec::with_capacity(kernel.bindings.len());
        for info in &kernel.bindings {
            let unbound = || TerrainError::UnboundSlot {
                kernel: kernel.name.clone(),
                slot: info.name.clone(),
            };
            let resource = match (&info.kind, kernel.bound.get(&info.binding)) {
                (BindingKind::Uniform, _) => match &kernel.uniform_buffer {
                    Some(buffer) if kernel.uniforms_written => buffer.as_entire_binding(),
                    _ => return Err(unbound()),
                },
                (_, Some(BoundResource::Buffer(id))) => self.gpu_buffer(*id)?.buffer.as_entire_binding(),
                (_, Some(BoundResource::Counter(id))) => self
                    .gpu_buffer(*id)?
                    .counter
                    .as_ref()
                    .ok_or_else(unbound)?
                    .as_entire_binding(),
                (_, Some(BoundResource::Volume(id))) => {
                    let volume = self.volumes.get(id).ok_or(TerrainError::UnknownResource {
                        kind: VolumeId::KIND,
                        id: id.0,
                    })?;
                    wgpu::BindingResource::TextureView(&volume.view)
                }
                (_, None) => return Err(unbound()),
            };
            entries.push(wgpu::BindGroupEntry {
                binding: info.binding,
                resource,
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("{} Bind Group", kernel.name)),
            layout: &kernel.layout,
            entries: &entries,
        });

        let mut encoder = self.encoder(&kernel.name);
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&kernel.name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }
        self.queue.submit(Some(encoder.finish()));

        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(TerrainError::InvalidDispatch {
                kernel: kernel.name.clone(),
                reason: error.to_string(),
            });
        }

        log::debug!("[WgpuDevice] Dispatched '{}' with {:?} groups", kernel.name, groups);
        Ok(())
    }

    fn copy_counter(&mut self, source: BufferId, dest: BufferId) -> TerrainResult<()> {
        let src = self.gpu_buffer(source)?;
        let Some(counter) = &src.counter else {
            return Err(TerrainError::TransferFailed {
                reason: format!("buffer '{}' has no counter", src.label),
            });
        };
        let dst = self.gpu_buffer(dest)?;
        if dst.size < COUNTER_STRIDE {
            return Err(TerrainError::TransferFailed {
                reason: format!("counter destination '{}' is too small", dst.label),
            });
        }
        let mut encoder = self.encoder("Copy Counter");
        encoder.copy_buffer_to_buffer(counter, 0, &dst.buffer, 0, COUNTER_STRIDE);
        self.submit(encoder);
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        source: BufferId,
        source_offset: u64,
        dest: BufferId,
        dest_offset: u64,
        size: u64,
    ) -> TerrainResult<()> {
        if size == 0 {
            return Ok(());
        }
        let src = self.gpu_buffer(source)?;
        let dst = self.gpu_buffer(dest)?;
        if source_offset + size > src.size || dest_offset + size > dst.size || size % 4 != 0 {
            return Err(TerrainError::TransferFailed {
                reason: format!(
                    "copy of {} bytes from '{}' to '{}' out of range",
                    size, src.label, dst.label
                ),
            });
        }
        let mut encoder = self.encoder("Copy Buffer");
        encoder.copy_buffer_to_buffer(&src.buffer, source_offset, &dst.buffer, dest_offset, size);
        self.submit(encoder);
        Ok(())
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> TerrainResult<()> {
        let target = self.gpu_buffer(buffer)?;
        if offset + data.len() as u64 > target.size || data.len() % 4 != 0 {
            return Err(TerrainError::TransferFailed {
                reason: format!("write of {} bytes to '{}' out of range", data.len(), target.label),
            });
        }
        self.queue.write_buffer(&target.buffer, offset, data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferId, offset: u64, size: u64) -> TerrainResult<Vec<u8>> {
        let (staging, receiver) = self.stage_read(buffer, offset, size)?;
        let _ = self.device.poll(wgpu::Maintain::Wait);

        pollster::block_on(receiver)
            .transfer_context("readback channel")?
            .transfer_context("map staging buffer")?;
        let data = Self::mapped_bytes(&staging, size);
        staging.destroy();
        Ok(data)
    }

    fn begin_transfer(&mut self, buffer: BufferId, offset: u64, size: u64) -> TerrainResult<TransferId> {
        let (staging, receiver) = self.stage_read(buffer, offset, size)?;
        let id = TransferId(self.next_id());
        self.transfers.insert(
            id,
            GpuTransfer {
                staging,
                size,
                receiver,
                ready: false,
            },
        );
        Ok(id)
    }

    fn poll_transfer(&mut self, id: TransferId) -> TerrainResult<bool> {
        let _ = self.device.poll(wgpu::Maintain::Poll);
        let transfer = self.transfers.get_mut(&id).ok_or(TerrainError::UnknownResource {
            kind: TransferId::KIND,
            id: id.0,
        })?;
        if transfer.ready {
            return Ok(true);
        }
        match transfer.receiver.try_recv() {
            Ok(Some(Ok(()))) => {
                transfer.ready = true;
                Ok(true)
            }
            Ok(Some(Err(e))) => {
                log::error!("[WgpuDevice] Failed to map transfer {}: {}", id.0, e);
                Err(TerrainError::TransferFailed {
                    reason: e.to_string(),
                })
            }
            Ok(None) => Ok(false),
            Err(e) => Err(TerrainError::TransferFailed {
                reason: format!("transfer {} channel closed: {}", id.0, e),
            }),
        }
    }

    fn take_transfer(&mut self, id: TransferId) -> TerrainResult<Vec<u8>> {
        match self.transfers.get(&id) {
            Some(transfer) if transfer.ready => {}
            Some(_) => {
                return Err(TerrainError::TransferFailed {
                    reason: format!("transfer {} is not finished", id.0),
                })
            }
            None => {
                return Err(TerrainError::UnknownResource {
                    kind: TransferId::KIND,
                    id: id.0,
                })
            }
        }
        let transfer = self.transfers.remove(&id).ok_or(TerrainError::UnknownResource {
            kind: TransferId::KIND,
            id: id.0,
        })?;
        let data = Self::mapped_bytes(&transfer.staging, transfer.size);
        transfer.staging.destroy();
        Ok(data)
    }

    fn cancel_transfer(&mut self, id: TransferId) {
        if let Some(transfer) = self.transfers.remove(&id) {
            transfer.staging.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_entries_follow_bindings() {
        let storage = BindingInfo {
            binding: 3,
            name: "vertices".to_string(),
            kind: BindingKind::StorageBuffer { read_only: false },
            type_name: "array<vec4<f32>>".to_string(),
        };
        let entry = layout_entry("isosurfaceExtract", &storage).unwrap();
        assert_eq!(entry.binding, 3);
        assert!(matches!(
            entry.ty,
            wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                ..
            }
        ));

        let output = BindingInfo {
            binding: 1,
            name: "noiseTexture".to_string(),
            kind: BindingKind::StorageTexture {
                format: "r32float".to_string(),
                access: StorageAccess::Write,
            },
            type_name: "texture_storage_3d<r32float, write>".to_string(),
        };
        let entry = layout_entry("noise3D", &output).unwrap();
        assert!(matches!(
            entry.ty,
            wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format: wgpu::TextureFormat::R32Float,
                ..
            }
        ));
    }

    #[test]
    fn test_unsupported_storage_format() {
        assert!(matches!(
            storage_texture_format("noise3D", "bgra8unorm"),
            Err(TerrainError::KernelCompilation { .. })
        ));
    }

    #[test]
    fn test_usage_per_kind() {
        assert!(buffer_usage(BufferKind::IndirectArgs).contains(wgpu::BufferUsages::INDIRECT));
        assert!(buffer_usage(BufferKind::Vertex).contains(wgpu::BufferUsages::VERTEX));
        assert!(buffer_usage(BufferKind::Readback).contains(wgpu::BufferUsages::COPY_DST));
    }
}
