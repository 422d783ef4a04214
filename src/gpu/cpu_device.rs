//! Software compute backend
//!
//! Runs registered Rust kernels over the same dispatch grid a GPU would, with the same
//! binding rules, counters and transfer semantics. Used when no adapter is available,
//! by the integration tests and by the benches.

use std::sync::Arc;

use glam::UVec3;
use rustc_hash::FxHashMap;

use crate::constants::{gpu_limits::MAX_WORKGROUPS_PER_DIMENSION, kernels, slots};
use crate::error::{TerrainError, TerrainResult};
use crate::gpu::software_kernels::{
    CopyMeshKernel, DensityKernel, IsosurfaceKernel, NormalKernel,
};
use crate::gpu::{
    BindingInfo, BindingKind, BufferDescriptor, BufferId, BufferKind, ChunkUniforms,
    ComputeDevice, ComputeProgram, DeviceLimits, EntryPoint, KernelHandle, TransferId,
    VolumeDescriptor, VolumeFormat, VolumeId,
};

/// A kernel the software backend can execute
pub trait SoftwareKernel {
    /// Run every invocation of one dispatch
    fn dispatch(&self, ctx: &mut KernelInvocation) -> TerrainResult<()>;
}

/// Per-thread kernels written as closures
impl<F> SoftwareKernel for F
where
    F: Fn(&mut KernelInvocation, UVec3) -> TerrainResult<()>,
{
    fn dispatch(&self, ctx: &mut KernelInvocation) -> TerrainResult<()> {
        for id in ctx.grid().ids() {
            self(ctx, id)?;
        }
        Ok(())
    }
}

/// Workgroup count and workgroup size of one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchGrid {
    pub groups: [u32; 3],
    pub group_size: [u32; 3],
}

impl DispatchGrid {
    pub fn extent(&self) -> UVec3 {
        UVec3::from_array(self.groups) * UVec3::from_array(self.group_size)
    }

    /// Global invocation ids, x fastest
    pub fn ids(&self) -> impl Iterator<Item = UVec3> {
        let extent = self.extent();
        (0..extent.z).flat_map(move |z| {
            (0..extent.y).flat_map(move |y| (0..extent.x).map(move |x| UVec3::new(x, y, z)))
        })
    }
}

struct CpuBuffer {
    label: String,
    kind: BufferKind,
    words: Vec<u32>,
    counter: u32,
}

impl CpuBuffer {
    fn size(&self) -> u64 {
        self.words.len() as u64 * 4
    }

    fn bytes(&self, offset: u64, size: u64) -> TerrainResult<Vec<u8>> {
        check_range(&self.label, offset, size, self.size())?;
        let bytes: &[u8] = bytemuck::cast_slice(&self.words);
        Ok(bytes[offset as usize..(offset + size) as usize].to_vec())
    }
}

struct CpuVolume {
    extent: u32,
    format: VolumeFormat,
    texels: Vec<[f32; 4]>,
}

impl CpuVolume {
    fn bytes(&self) -> u64 {
        let per_texel = match self.format {
            VolumeFormat::Scalar => 4,
            VolumeFormat::Vector => 8,
        };
        self.texels.len() as u64 * per_texel
    }

    fn index(&self, coord: [u32; 3]) -> Option<usize> {
        let e = self.extent;
        if coord.iter().any(|c| *c >= e) {
            return None;
        }
        Some((coord[0] + coord[1] * e + coord[2] * e * e) as usize)
    }
}

struct CpuKernel {
    name: String,
    group_size: [u32; 3],
    bindings: Vec<BindingInfo>,
    function: Arc<dyn SoftwareKernel>,
    uniforms: Option<ChunkUniforms>,
    buffer_slots: Vec<(String, BufferId)>,
    counter_slots: Vec<(String, BufferId)>,
    volume_slots: Vec<(String, VolumeId)>,
}

impl CpuKernel {
    fn binding(&self, slot: &str) -> TerrainResult<&BindingInfo> {
        self.bindings
            .iter()
            .find(|b| b.name == slot)
            .ok_or_else(|| TerrainError::UnknownSlot {
                kernel: self.name.clone(),
                slot: slot.to_string(),
            })
    }

    fn is_bound(&self, binding: &BindingInfo) -> bool {
        let name = binding.name.as_str();
        match binding.kind {
            BindingKind::Uniform => self.uniforms.is_some(),
            BindingKind::StorageBuffer { .. } => {
                self.buffer_slots.iter().any(|(s, _)| s == name)
                    || self.counter_slots.iter().any(|(s, _)| s == name)
            }
            BindingKind::Texture | BindingKind::StorageTexture { .. } => {
                self.volume_slots.iter().any(|(s, _)| s == name)
            }
        }
    }
}

fn set_slot<T: Copy>(slots: &mut Vec<(String, T)>, slot: &str, value: T) {
    match slots.iter_mut().find(|(s, _)| s == slot) {
        Some(entry) => entry.1 = value,
        None => slots.push((slot.to_string(), value)),
    }
}

struct PendingTransfer {
    data: Vec<u8>,
    remaining_polls: u32,
}

/// Resources of one dispatch, lent to a software kernel
pub struct KernelInvocation {
    kernel: String,
    uniforms: ChunkUniforms,
    grid: DispatchGrid,
    buffers: Vec<(BufferId, CpuBuffer)>,
    buffer_slots: Vec<(String, usize)>,
    counter_slots: Vec<(String, usize)>,
    volumes: Vec<(VolumeId, CpuVolume)>,
    volume_slots: Vec<(String, usize)>,
}

impl KernelInvocation {
    pub fn uniforms(&self) -> &ChunkUniforms {
        &self.uniforms
    }

    pub fn grid(&self) -> DispatchGrid {
        self.grid
    }

    /// Whether anything is bound at `slot`
    pub fn has_slot(&self, slot: &str) -> bool {
        lookup(&self.buffer_slots, slot).is_some()
            || lookup(&self.counter_slots, slot).is_some()
            || lookup(&self.volume_slots, slot).is_some()
    }

    fn unbound(&self, slot: &str) -> TerrainError {
        TerrainError::UnboundSlot {
            kernel: self.kernel.clone(),
            slot: slot.to_string(),
        }
    }

    fn buffer(&self, slot: &str) -> TerrainResult<&CpuBuffer> {
        let index = lookup(&self.buffer_slots, slot).ok_or_else(|| self.unbound(slot))?;
        Ok(&self.buffers[index].1)
    }

    fn buffer_mut(&mut self, slot: &str) -> TerrainResult<&mut CpuBuffer> {
        let index = lookup(&self.buffer_slots, slot).ok_or_else(|| self.unbound(slot))?;
        Ok(&mut self.buffers[index].1)
    }

    fn counter_buffer_mut(&mut self, slot: &str) -> TerrainResult<&mut CpuBuffer> {
        let index = lookup(&self.counter_slots, slot).ok_or_else(|| self.unbound(slot))?;
        Ok(&mut self.buffers[index].1)
    }

    fn volume(&self, slot: &str) -> TerrainResult<&CpuVolume> {
        let index = lookup(&self.volume_slots, slot).ok_or_else(|| self.unbound(slot))?;
        Ok(&self.volumes[index].1)
    }

    /// `arrayLength` of a buffer slot for elements of `stride` bytes
    pub fn element_count(&self, slot: &str, stride: u64) -> TerrainResult<u64> {
        Ok(self.buffer(slot)?.size() / stride)
    }

    /// Write consecutive words at element `index`; out-of-range writes are dropped
    pub fn write_element(&mut self, slot: &str, index: u64, words: &[u32]) -> TerrainResult<bool> {
        let buffer = self.buffer_mut(slot)?;
        let start = index as usize * words.len();
        match buffer.words.get_mut(start..start + words.len()) {
            Some(dest) => {
                dest.copy_from_slice(words);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn write_vec4(&mut self, slot: &str, index: u64, value: [f32; 4]) -> TerrainResult<bool> {
        self.write_element(slot, index, &value.map(f32::to_bits))
    }

    pub fn read_vec4(&self, slot: &str, index: u64) -> TerrainResult<Option<[f32; 4]>> {
        let buffer = self.buffer(slot)?;
        let start = index as usize * 4;
        Ok(buffer
            .words
            .get(start..start + 4)
            .map(|w| [f32::from_bits(w[0]), f32::from_bits(w[1]), f32::from_bits(w[2]), f32::from_bits(w[3])]))
    }

    /// `atomicAdd` on the counter bound at `counter_slot`, returning the old value
    pub fn atomic_add(&mut self, counter_slot: &str, value: u32) -> TerrainResult<u32> {
        let buffer = self.counter_buffer_mut(counter_slot)?;
        let old = buffer.counter;
        buffer.counter = old.wrapping_add(value);
        Ok(old)
    }

    pub fn load_counter(&mut self, counter_slot: &str) -> TerrainResult<u32> {
        Ok(self.counter_buffer_mut(counter_slot)?.counter)
    }

    pub fn volume_extent(&self, slot: &str) -> TerrainResult<u32> {
        Ok(self.volume(slot)?.extent)
    }

    /// `textureLoad` with coordinates clamped to the volume
    pub fn load_texel(&self, slot: &str, coord: [i32; 3]) -> TerrainResult<[f32; 4]> {
        let volume = self.volume(slot)?;
        let max = volume.extent as i32 - 1;
        let clamped = coord.map(|c| c.clamp(0, max) as u32);
        Ok(volume
            .index(clamped)
            .map(|i| volume.texels[i])
            .unwrap_or_default())
    }

    /// `textureStore`; out-of-range stores are dropped
    pub fn store_texel(&mut self, slot: &str, coord: [u32; 3], value: [f32; 4]) -> TerrainResult<()> {
        let index = lookup(&self.volume_slots, slot).ok_or_else(|| self.unbound(slot))?;
        let volume = &mut self.volumes[index].1;
        if let Some(i) = volume.index(coord) {
            volume.texels[i] = value;
        }
        Ok(())
    }
}

fn lookup(slots: &[(String, usize)], slot: &str) -> Option<usize> {
    slots.iter().find(|(s, _)| s == slot).map(|(_, i)| *i)
}

fn check_range(label: &str, offset: u64, size: u64, total: u64) -> TerrainResult<()> {
    if offset % 4 != 0 || size % 4 != 0 || offset + size > total {
        return Err(TerrainError::TransferFailed {
            reason: format!(
                "range {}..{} invalid for '{}' ({} bytes)",
                offset,
                offset + size,
                label,
                total
            ),
        });
    }
    Ok(())
}

/// Software implementation of [`ComputeDevice`]
pub struct CpuDevice {
    buffers: FxHashMap<BufferId, CpuBuffer>,
    volumes: FxHashMap<VolumeId, CpuVolume>,
    kernels: FxHashMap<KernelHandle, CpuKernel>,
    transfers: FxHashMap<TransferId, PendingTransfer>,
    registry: FxHashMap<String, Arc<dyn SoftwareKernel>>,
    next_id: u32,
    limits: DeviceLimits,
    memory_budget: Option<u64>,
    memory_used: u64,
    transfer_latency: u32,
    dispatch_count: u64,
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuDevice {
    /// Device with the default kernels registered
    pub fn new() -> Self {
        let mut device = Self {
            buffers: FxHashMap::default(),
            volumes: FxHashMap::default(),
            kernels: FxHashMap::default(),
            transfers: FxHashMap::default(),
            registry: FxHashMap::default(),
            next_id: 1,
            limits: DeviceLimits {
                max_buffer_size: 256 * 1024 * 1024,
                max_workgroups_per_dimension: MAX_WORKGROUPS_PER_DIMENSION,
                max_texture_dimension_3d: 2048,
            },
            memory_budget: None,
            memory_used: 0,
            transfer_latency: 1,
            dispatch_count: 0,
        };
        device.register_kernel(kernels::NOISE_3D, DensityKernel);
        device.register_kernel(kernels::NORMAL_ESTIMATE, NormalKernel);
        device.register_kernel(kernels::ISOSURFACE_EXTRACT, IsosurfaceKernel);
        device.register_kernel(kernels::COPY_MESH_BUFFERS, CopyMeshKernel);
        device
    }

    /// Register (or replace) the software kernel run for an entry point name.
    /// Affects kernels compiled afterwards.
    pub fn register_kernel<K: SoftwareKernel + 'static>(&mut self, name: &str, kernel: K) {
        self.registry.insert(name.to_string(), Arc::new(kernel));
    }

    /// Polls an async transfer needs before its data is available
    pub fn set_transfer_latency(&mut self, polls: u32) {
        self.transfer_latency = polls;
    }

    /// Simulated device memory; allocations beyond it fail with OutOfMemory
    pub fn set_memory_budget(&mut self, budget: Option<u64>) {
        self.memory_budget = budget;
    }

    pub fn set_limits(&mut self, limits: DeviceLimits) {
        self.limits = limits;
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_volume_count(&self) -> usize {
        self.volumes.len()
    }

    pub fn pending_transfer_count(&self) -> usize {
        self.transfers.len()
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatch_count
    }

    pub fn memory_used(&self) -> u64 {
        self.memory_used
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn reserve(&mut self, resource: &str, bytes: u64) -> TerrainResult<()> {
        if let Some(budget) = self.memory_budget {
            if self.memory_used + bytes > budget {
                return Err(TerrainError::OutOfMemory {
                    resource: resource.to_string(),
                    bytes,
                });
            }
        }
        self.memory_used += bytes;
        Ok(())
    }

    fn buffer(&self, id: BufferId) -> TerrainResult<&CpuBuffer> {
        self.buffers.get(&id).ok_or(TerrainError::UnknownResource {
            kind: BufferId::KIND,
            id: id.0,
        })
    }

    fn buffer_mut(&mut self, id: BufferId) -> TerrainResult<&mut CpuBuffer> {
        self.buffers.get_mut(&id).ok_or(TerrainError::UnknownResource {
            kind: BufferId::KIND,
            id: id.0,
        })
    }

    fn kernel_mut(&mut self, handle: KernelHandle) -> TerrainResult<&mut CpuKernel> {
        self.kernels.get_mut(&handle).ok_or(TerrainError::UnknownResource {
            kind: KernelHandle::KIND,
            id: handle.0,
        })
    }

    fn take_resources(&mut self, kernel: &CpuKernel) -> TerrainResult<KernelInvocation> {
        let mut invocation = KernelInvocation {
            kernel: kernel.name.clone(),
            uniforms: kernel.uniforms.unwrap_or_default(),
            grid: DispatchGrid {
                groups: [0; 3],
                group_size: kernel.group_size,
            },
            buffers: Vec::new(),
            buffer_slots: Vec::new(),
            counter_slots: Vec::new(),
            volumes: Vec::new(),
            volume_slots: Vec::new(),
        };

        let buffer_bindings = kernel
            .buffer_slots
            .iter()
            .map(|(s, id)| (s, *id, false))
            .chain(kernel.counter_slots.iter().map(|(s, id)| (s, *id, true)));
        for (slot, id, is_counter) in buffer_bindings {
            let index = match invocation.buffers.iter().position(|(b, _)| *b == id) {
                Some(index) => index,
                None => match self.buffers.remove(&id) {
                    Some(buffer) => {
                        invocation.buffers.push((id, buffer));
                        invocation.buffers.len() - 1
                    }
                    None => {
                        self.return_resources(invocation);
                        return Err(TerrainError::UnknownResource {
                            kind: BufferId::KIND,
                            id: id.0,
                        });
                    }
                },
            };
            if is_counter {
                invocation.counter_slots.push((slot.clone(), index));
            } else {
                invocation.buffer_slots.push((slot.clone(), index));
            }
        }

        for (slot, id) in &kernel.volume_slots {
            let index = match invocation.volumes.iter().position(|(v, _)| v == id) {
                Some(index) => index,
                None => match self.volumes.remove(id) {
                    Some(volume) => {
                        invocation.volumes.push((*id, volume));
                        invocation.volumes.len() - 1
                    }
                    None => {
                        self.return_resources(invocation);
                        return Err(TerrainError::UnknownResource {
                            kind: VolumeId::KIND,
                            id: id.0,
                        });
                    }
                },
            };
            invocation.volume_slots.push((slot.clone(), index));
        }

        Ok(invocation)
    }

    fn return_resources(&mut self, invocation: KernelInvocation) {
        for (id, buffer) in invocation.buffers {
            self.buffers.insert(id, buffer);
        }
        for (id, volume) in invocation.volumes {
            self.volumes.insert(id, volume);
        }
    }
}

impl ComputeDevice for CpuDevice {
    fn backend_name(&self) -> &'static str {
        "software"
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
        let size = desc.size.div_ceil(4) * 4;
        self.reserve(desc.label, size)?;
        let id = BufferId(self.next_id());
        self.buffers.insert(
            id,
            CpuBuffer {
                label: desc.label.to_string(),
                kind: desc.kind,
                words: vec![0; (size / 4) as usize],
                counter: 0,
            },
        );
        log::debug!("[CpuDevice] Created buffer '{}' ({} bytes)", desc.label, size);
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
        let texel_count = (desc.extent as usize).pow(3);
        let volume = CpuVolume {
            extent: desc.extent,
            format: desc.format,
            texels: vec![[0.0; 4]; texel_count],
        };
        self.reserve(desc.label, volume.bytes())?;
        let id = VolumeId(self.next_id());
        self.volumes.insert(id, volume);
        log::debug!("[CpuDevice] Created volume '{}' ({}^3)", desc.label, desc.extent);
        Ok(id)
    }

    fn destroy_buffer(&mut self, id: BufferId) {
        if let Some(buffer) = self.buffers.remove(&id) {
            self.memory_used = self.memory_used.saturating_sub(buffer.size());
        }
    }

    fn destroy_volume(&mut self, id: VolumeId) {
        if let Some(volume) = self.volumes.remove(&id) {
            self.memory_used = self.memory_used.saturating_sub(volume.bytes());
        }
    }

    fn buffer_size(&self, id: BufferId) -> TerrainResult<u64> {
        Ok(self.buffer(id)?.size())
    }

    fn buffer_kind(&self, id: BufferId) -> TerrainResult<BufferKind> {
        Ok(self.buffer(id)?.kind)
    }

    fn compile_kernel(
        &mut self,
        program: &ComputeProgram,
        entry: &EntryPoint,
    ) -> TerrainResult<KernelHandle> {
        let function = self
            .registry
            .get(&entry.name)
            .cloned()
            .ok_or_else(|| TerrainError::KernelCompilation {
                kernel: entry.name.clone(),
                error: format!("no software kernel registered for '{}'", entry.name),
            })?;
        let handle = KernelHandle(self.next_id());
        self.kernels.insert(
            handle,
            CpuKernel {
                name: entry.name.clone(),
                group_size: entry.workgroup_size,
                bindings: program.bindings.clone(),
                function,
                uniforms: None,
                buffer_slots: Vec::new(),
                counter_slots: Vec::new(),
                volume_slots: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn set_uniforms(&mut self, kernel: KernelHandle, uniforms: &ChunkUniforms) -> TerrainResult<()> {
        let kernel = self.kernel_mut(kernel)?;
        let binding = kernel.binding(crate::constants::params::UNIFORM_BLOCK)?;
        if binding.kind != BindingKind::Uniform {
            return Err(TerrainError::InvalidDispatch {
                kernel: kernel.name.clone(),
                reason: format!("slot '{}' is not a uniform block", binding.name),
            });
        }
        kernel.uniforms = Some(*uniforms);
        Ok(())
    }

    fn bind_buffer(&mut self, kernel: KernelHandle, slot: &str, buffer: BufferId) -> TerrainResult<()> {
        let kind = self.buffer(buffer)?.kind;
        let kernel = self.kernel_mut(kernel)?;
        let binding = kernel.binding(slot)?;
        if !matches!(binding.kind, BindingKind::StorageBuffer { .. }) {
            return Err(TerrainError::InvalidDispatch {
                kernel: kernel.name.clone(),
                reason: format!("slot '{}' is not a storage buffer", slot),
            });
        }
        set_slot(&mut kernel.buffer_slots, slot, buffer);

        let counter_slot = format!("{}{}", slot, slots::COUNTER_SUFFIX);
        if matches!(kind, BufferKind::Append { .. }) && kernel.binding(&counter_slot).is_ok() {
            set_slot(&mut kernel.counter_slots, &counter_slot, buffer);
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
        set_slot(&mut kernel.volume_slots, slot, volume);
        Ok(())
    }

    fn reset_counter(&mut self, buffer: BufferId) -> TerrainResult<()> {
        let buffer = self.buffer_mut(buffer)?;
        if !matches!(buffer.kind, BufferKind::Append { .. }) {
            return Err(TerrainError::TransferFailed {
                reason: format!("buffer '{}' has no counter", buffer.label),
            });
        }
        buffer.counter = 0;
        Ok(())
    }

    fn dispatch(&mut self, handle: KernelHandle, groups: [u32; 3]) -> TerrainResult<()> {
        let max = self.limits.max_workgroups_per_dimension;
        let kernel = self.kernels.get(&handle).ok_or(TerrainError::UnknownResource {
            kind: KernelHandle::KIND,
            id: handle.0,
        })?;
        if groups.iter().any(|g| *g > max) {
            return Err(TerrainError::InvalidDispatch {
                kernel: kernel.name.clone(),
                reason: format!("workgroup count {:?} exceeds device limit {}", groups, max),
            });
        }
        if let Some(unbound) = kernel.bindings.iter().find(|b| !kernel.is_bound(b)) {
            return Err(TerrainError::UnboundSlot {
                kernel: kernel.name.clone(),
                slot: unbound.name.clone(),
            });
        }

        let function = Arc::clone(&kernel.function);
        let name = kernel.name.clone();
        // Resources are lent out for the duration of the dispatch
        let kernel = match self.kernels.remove(&handle) {
            Some(kernel) => kernel,
            None => return Ok(()),
        };
        let taken = self.take_resources(&kernel);
        self.kernels.insert(handle, kernel);
        let mut invocation = taken?;
        invocation.grid.groups = groups;

        let result = function.dispatch(&mut invocation);
        self.return_resources(invocation);
        self.dispatch_count += 1;

        log::debug!("[CpuDevice] Dispatched '{}' with {:?} groups", name, groups);
        result
    }

    fn copy_counter(&mut self, source: BufferId, dest: BufferId) -> TerrainResult<()> {
        let src = self.buffer(source)?;
        if !matches!(src.kind, BufferKind::Append { .. }) {
            return Err(TerrainError::TransferFailed {
                reason: format!("buffer '{}' has no counter", src.label),
            });
        }
        let counter = src.counter;
        let dst = self.buffer_mut(dest)?;
        match dst.words.first_mut() {
            Some(word) => *word = counter,
            None => {
                return Err(TerrainError::TransferFailed {
                    reason: format!("counter destination '{}' is empty", dst.label),
                })
            }
        }
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
        let data = self.buffer(source)?.bytes(source_offset, size)?;
        self.write_buffer(dest, dest_offset, &data)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> TerrainResult<()> {
        let buffer = self.buffer_mut(buffer)?;
        check_range(&buffer.label, offset, data.len() as u64, buffer.size())?;
        let start = (offset / 4) as usize;
        for (i, word) in data.chunks_exact(4).enumerate() {
            buffer.words[start + i] = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        }
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferId, offset: u64, size: u64) -> TerrainResult<Vec<u8>> {
        self.buffer(buffer)?.bytes(offset, size)
    }

    fn begin_transfer(&mut self, buffer: BufferId, offset: u64, size: u64) -> TerrainResult<TransferId> {
        let data = self.buffer(buffer)?.bytes(offset, size)?;
        let id = TransferId(self.next_id());
        self.transfers.insert(
            id,
            PendingTransfer {
                data,
                remaining_polls: self.transfer_latency,
            },
        );
        Ok(id)
    }

    fn poll_transfer(&mut self, id: TransferId) -> TerrainResult<bool> {
        let transfer = self.transfers.get_mut(&id).ok_or(TerrainError::UnknownResource {
            kind: TransferId::KIND,
            id: id.0,
        })?;
        if transfer.remaining_polls == 0 {
            return Ok(true);
        }
        transfer.remaining_polls -= 1;
        Ok(transfer.remaining_polls == 0)
    }

    fn take_transfer(&mut self, id: TransferId) -> TerrainResult<Vec<u8>> {
        match self.transfers.get(&id) {
            Some(transfer) if transfer.remaining_polls == 0 => {}
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
        self.transfers
            .remove(&id)
            .map(|t| t.data)
            .ok_or(TerrainError::UnknownResource {
                kind: TransferId::KIND,
                id: id.0,
            })
    }

    fn cancel_transfer(&mut self, id: TransferId) {
        self.transfers.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::KernelBinder;

    const FILL: &str = r#"
@group(0) @binding(0) var<storage, read_write> values: array<u32>;
@group(0) @binding(1) var<storage, read_write> valuesCounter: atomic<u32>;

@compute @workgroup_size(4)
fn fill(@builtin(global_invocation_id) id: vec3<u32>) {
}
"#;

    fn fill_kernel(ctx: &mut KernelInvocation, id: UVec3) -> TerrainResult<()> {
        ctx.write_element("values", id.x as u64, &[id.x * 2])?;
        ctx.atomic_add("valuesCounter", 1)?;
        Ok(())
    }

    fn setup() -> (CpuDevice, crate::gpu::Kernel, BufferId) {
        let mut device = CpuDevice::new();
        device.register_kernel("fill", fill_kernel);
        let program = ComputeProgram::parse("fill", FILL).unwrap();
        let kernel = KernelBinder::resolve(&mut device, &program, "fill").unwrap();
        let buffer = device
            .create_buffer(&BufferDescriptor {
                label: "values",
                size: 64,
                kind: BufferKind::Append {
                    unit: crate::gpu::CounterUnit::Vertices,
                },
            })
            .unwrap();
        (device, kernel, buffer)
    }

    #[test]
    fn test_dispatch_runs_every_invocation() {
        let (mut device, kernel, buffer) = setup();
        device.bind_buffer(kernel.handle, "values", buffer).unwrap();
        device.dispatch(kernel.handle, [2, 1, 1]).unwrap();

        let bytes = device.read_buffer(buffer, 0, 32).unwrap();
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        assert_eq!(words, vec![0, 2, 4, 6, 8, 10, 12, 14]);

        let readback = device
            .create_buffer(&BufferDescriptor {
                label: "count",
                size: 4,
                kind: BufferKind::Readback,
            })
            .unwrap();
        device.copy_counter(buffer, readback).unwrap();
        assert_eq!(device.read_buffer(readback, 0, 4).unwrap(), 8u32.to_le_bytes());

        device.reset_counter(buffer).unwrap();
        device.copy_counter(buffer, readback).unwrap();
        assert_eq!(device.read_buffer(readback, 0, 4).unwrap(), 0u32.to_le_bytes());
    }

    #[test]
    fn test_unbound_and_unknown_slots() {
        let (mut device, kernel, buffer) = setup();
        assert!(matches!(
            device.dispatch(kernel.handle, [1, 1, 1]),
            Err(TerrainError::UnboundSlot { .. })
        ));
        assert!(matches!(
            device.bind_buffer(kernel.handle, "normals", buffer),
            Err(TerrainError::UnknownSlot { .. })
        ));
    }

    #[test]
    fn test_out_of_range_writes_are_dropped() {
        let (mut device, kernel, buffer) = setup();
        device.bind_buffer(kernel.handle, "values", buffer).unwrap();
        // 32 invocations into a 16 element buffer
        device.dispatch(kernel.handle, [8, 1, 1]).unwrap();
        let bytes = device.read_buffer(buffer, 60, 4).unwrap();
        assert_eq!(bytes, 30u32.to_le_bytes());
    }

    #[test]
    fn test_transfer_latency() {
        let (mut device, _, buffer) = setup();
        device.set_transfer_latency(2);
        device.write_buffer(buffer, 0, &7u32.to_le_bytes()).unwrap();

        let id = device.begin_transfer(buffer, 0, 4).unwrap();
        // Later writes do not affect an issued transfer
        device.write_buffer(buffer, 0, &9u32.to_le_bytes()).unwrap();

        assert!(device.take_transfer(id).is_err());
        assert!(!device.poll_transfer(id).unwrap());
        assert!(device.poll_transfer(id).unwrap());
        assert_eq!(device.take_transfer(id).unwrap(), 7u32.to_le_bytes());
        assert_eq!(device.pending_transfer_count(), 0);
    }

    #[test]
    fn test_missing_software_kernel_fails_compilation() {
        let mut device = CpuDevice::new();
        let program = ComputeProgram::parse("fill", FILL).unwrap();
        assert!(matches!(
            KernelBinder::resolve(&mut device, &program, "fill"),
            Err(TerrainError::KernelCompilation { .. })
        ));
    }
}
