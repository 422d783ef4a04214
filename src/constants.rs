// Isoterrain Constants - SINGLE SOURCE OF TRUTH
//
// Every sizing rule, kernel name and shader slot name used by the pipeline lives here.
// The WGSL programs under src/shaders/ use exactly these names.

/// Worst-case marching cubes output, used to size buffers before any kernel runs
pub mod marching_cubes {
    /// A single cell emits at most 5 triangles
    pub const MAX_TRIANGLES_PER_VOXEL: u64 = 5;
    /// 5 triangles, 3 vertices each
    pub const MAX_VERTICES_PER_VOXEL: u64 = MAX_TRIANGLES_PER_VOXEL * 3;
    /// Iso level separating inside from outside
    pub const ISO_LEVEL: f32 = 0.0;
}

/// Chunk defaults
pub mod chunk {
    /// Voxels per axis, excluding the +1 padding
    pub const DEFAULT_CHUNK_SIZE: u32 = 63;
    /// Extra sample on every axis so normals have neighbours at the chunk boundary
    pub const VOLUME_PADDING: u32 = 1;
    pub const DEFAULT_LOAD_RADIUS: u32 = 1;
    pub const DEFAULT_RESOLUTION_PER_VOXEL: u32 = 1;
    pub const DEFAULT_MAX_DEBUG_POINTS: u32 = 1;
    /// Upper bound accepted by config validation
    pub const MAX_CHUNK_SIZE: u32 = 255;
    pub const MAX_RESOLUTION_PER_VOXEL: u32 = 8;
    pub const MAX_OCTAVES: i32 = 16;
    /// A pass visits (2r + 1)^2 chunks
    pub const MAX_LOAD_RADIUS: u32 = 64;
}

/// Noise shaping shared by the WGSL kernel and the software kernel
pub mod noise_shape {
    /// Voxels covered by one noise period at frequency 1 and scale 1
    pub const FEATURE_SIZE: f32 = 16.0;
    /// Vertical distance over which the ground plane term adds one unit of density
    pub const HEIGHT_FALLOFF: f32 = 64.0;
}

/// Compute kernel entry points
pub mod kernels {
    pub const NOISE_3D: &str = "noise3D";
    pub const NORMAL_ESTIMATE: &str = "normalEstimate";
    pub const ISOSURFACE_EXTRACT: &str = "isosurfaceExtract";
    pub const COPY_MESH_BUFFERS: &str = "copyMeshBuffers";
}

/// Named parameters consumed by the kernels (contract with the WGSL code)
pub mod params {
    pub const SEED: &str = "seed";
    pub const LACUNARITY: &str = "lacunarity";
    pub const SCALE: &str = "scale";
    pub const GAIN: &str = "gain";
    pub const FREQUENCY: &str = "frequency";
    pub const OCTAVES: &str = "octaves";
    pub const RESOLUTION_PER_VOXEL: &str = "resolutionPerVoxel";
    pub const CHUNK_POSITION: &str = "chunkPosition";
    pub const CHUNK_SIZE: &str = "chunkSize";
    pub const WORLD_POSITION: &str = "worldPosition";

    /// Name of the uniform block holding all scalar and vector parameters
    pub const UNIFORM_BLOCK: &str = "params";
}

/// Named resource slots
pub mod slots {
    pub const NOISE_TEXTURE: &str = "noiseTexture";
    pub const NORMAL_TEXTURE: &str = "normalTexture";
    pub const VERTICES: &str = "vertices";
    pub const NORMALS: &str = "normals";
    pub const TRIANGLES: &str = "triangles";
    pub const DEBUG_POINTS: &str = "debugPoints";

    /// Suffix of the slot an append buffer's counter is bound to
    pub const COUNTER_SUFFIX: &str = "Counter";
}

/// Element layouts of the GPU buffers, in bytes
pub mod layout {
    /// Vertex positions and normals are vec4<f32> (w unused)
    pub const VERTEX_STRIDE: u64 = 16;
    /// Triangle index triplets are vec4<u32> (w unused)
    pub const TRIANGLE_STRIDE: u64 = 16;
    /// DebugPoint { position: vec4, direction: vec4 }
    pub const DEBUG_POINT_STRIDE: u64 = 32;
    pub const COUNTER_STRIDE: u64 = 4;
    /// Four u32 words: vertex count, instance count, first vertex, first instance
    pub const INDIRECT_ARGS_SIZE: u64 = 16;
}

/// Dispatch limits
pub mod gpu_limits {
    /// Group size the shipped volume kernels are written for
    pub const MIN_DISPATCH_SIZE: u32 = 8;
    /// WebGPU default for maxComputeWorkgroupsPerDimension
    pub const MAX_WORKGROUPS_PER_DIMENSION: u32 = 65535;
}
