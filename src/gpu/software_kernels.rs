//! Default kernels of the software backend
//!
//! Same contract as the WGSL programs (slot names, dispatch extents, counter
//! semantics). The noise itself comes from the `noise` crate, so results are not
//! bit-identical to the GPU.

use glam::{UVec3, Vec3};
use noise::{NoiseFn, Perlin};

use crate::constants::layout::{DEBUG_POINT_STRIDE, TRIANGLE_STRIDE, VERTEX_STRIDE};
use crate::constants::marching_cubes::ISO_LEVEL;
use crate::constants::noise_shape::{FEATURE_SIZE, HEIGHT_FALLOFF};
use crate::constants::slots::*;
use crate::error::TerrainResult;
use crate::gpu::cpu_device::{KernelInvocation, SoftwareKernel};
use crate::gpu::tables::{CUBE_CORNERS, EDGE_CORNERS, EDGE_TABLE, TRIANGLE_TABLE};
use crate::gpu::ChunkUniforms;

fn counter_slot(slot: &str) -> String {
    format!("{}{}", slot, COUNTER_SUFFIX)
}

/// Fractal Perlin density with a vertical ground term; negative is inside
pub struct DensityField {
    perlin: Perlin,
    frequency: f64,
    lacunarity: f64,
    gain: f64,
    octaves: i32,
}

impl DensityField {
    pub fn new(uniforms: &ChunkUniforms) -> Self {
        Self {
            perlin: Perlin::new((uniforms.seed as i64) as u32),
            frequency: (uniforms.frequency / (uniforms.scale * FEATURE_SIZE)) as f64,
            lacunarity: uniforms.lacunarity as f64,
            gain: uniforms.gain as f64,
            octaves: uniforms.octaves,
        }
    }

    pub fn sample(&self, p: Vec3) -> f32 {
        let base = p.as_dvec3() * self.frequency;
        let mut value = 0.0;
        let mut amplitude = 1.0;
        let mut frequency = 1.0;

        for _ in 0..self.octaves {
            value += self.perlin.get([base.x * frequency, base.y * frequency, base.z * frequency])
                * amplitude;
            frequency *= self.lacunarity;
            amplitude *= self.gain;
        }

        value as f32 + p.y / HEIGHT_FALLOFF
    }
}

/// `noise3D`: fills the density volume over the padded extent
pub struct DensityKernel;

impl SoftwareKernel for DensityKernel {
    fn dispatch(&self, ctx: &mut KernelInvocation) -> TerrainResult<()> {
        let uniforms = *ctx.uniforms();
        let field = DensityField::new(&uniforms);
        let origin = uniforms.chunk_origin();
        let extent = ctx.volume_extent(NOISE_TEXTURE)?;

        for id in ctx.grid().ids() {
            if id.cmpge(UVec3::splat(extent)).any() {
                continue;
            }
            let density = field.sample(origin + id.as_vec3());
            ctx.store_texel(NOISE_TEXTURE, id.to_array(), [density, 0.0, 0.0, 0.0])?;
        }
        Ok(())
    }
}

/// `normalEstimate`: normalized central-difference gradient of the density volume
pub struct NormalKernel;

impl SoftwareKernel for NormalKernel {
    fn dispatch(&self, ctx: &mut KernelInvocation) -> TerrainResult<()> {
        let extent = ctx.volume_extent(NORMAL_TEXTURE)?;

        for id in ctx.grid().ids() {
            if id.cmpge(UVec3::splat(extent)).any() {
                continue;
            }
            let p = id.as_ivec3();
            let sample = |dx: i32, dy: i32, dz: i32| -> TerrainResult<f32> {
                Ok(ctx.load_texel(NOISE_TEXTURE, [p.x + dx, p.y + dy, p.z + dz])?[0])
            };
            let gradient = Vec3::new(
                sample(1, 0, 0)? - sample(-1, 0, 0)?,
                sample(0, 1, 0)? - sample(0, -1, 0)?,
                sample(0, 0, 1)? - sample(0, 0, -1)?,
            );
            let normal = gradient.normalize_or_zero();
            ctx.store_texel(NORMAL_TEXTURE, id.to_array(), normal.extend(0.0).to_array())?;
        }
        Ok(())
    }
}

/// Trilinear read of a volume at a fractional sample position
fn sample_volume(ctx: &KernelInvocation, slot: &str, pos: Vec3) -> TerrainResult<[f32; 4]> {
    let base = pos.floor();
    let t = pos - base;
    let b = base.as_ivec3();

    let mut out = [0.0f32; 4];
    for corner in CUBE_CORNERS {
        let weight = (if corner[0] == 1 { t.x } else { 1.0 - t.x })
            * (if corner[1] == 1 { t.y } else { 1.0 - t.y })
            * (if corner[2] == 1 { t.z } else { 1.0 - t.z });
        if weight == 0.0 {
            continue;
        }
        let texel = ctx.load_texel(
            slot,
            [
                b.x + corner[0] as i32,
                b.y + corner[1] as i32,
                b.z + corner[2] as i32,
            ],
        )?;
        for (o, v) in out.iter_mut().zip(texel) {
            *o += v * weight;
        }
    }
    Ok(out)
}

/// Position of the iso crossing along an edge, as a fraction from the first corner
fn interpolate_edge(v1: f32, v2: f32) -> f32 {
    if (ISO_LEVEL - v1).abs() < 0.00001 || (v1 - v2).abs() < 0.00001 {
        return 0.0;
    }
    if (ISO_LEVEL - v2).abs() < 0.00001 {
        return 1.0;
    }
    (ISO_LEVEL - v1) / (v2 - v1)
}

/// `isosurfaceExtract`: marching cubes over chunk_size * resolution cells per axis
///
/// Each triangle reserves three vertex slots with one `atomicAdd` on the triangle
/// counter. Triangles past the buffer end are counted but not written.
pub struct IsosurfaceKernel;

impl SoftwareKernel for IsosurfaceKernel {
    fn dispatch(&self, ctx: &mut KernelInvocation) -> TerrainResult<()> {
        let uniforms = *ctx.uniforms();
        let resolution = uniforms.resolution_per_voxel.max(1) as u32;
        let cells = uniforms.logical_size() * resolution;
        let step = 1.0 / resolution as f32;
        let origin = uniforms.chunk_origin();

        let vertices_counter = counter_slot(VERTICES);
        let debug_counter = counter_slot(DEBUG_POINTS);
        let emit_debug = ctx.has_slot(DEBUG_POINTS) && ctx.has_slot(&debug_counter);
        let triangle_slots = ctx.element_count(VERTICES, VERTEX_STRIDE)? / 3;
        let normal_slots = ctx.element_count(NORMALS, VERTEX_STRIDE)? / 3;
        let debug_slots = if emit_debug {
            ctx.element_count(DEBUG_POINTS, DEBUG_POINT_STRIDE)?
        } else {
            0
        };

        for id in ctx.grid().ids() {
            if id.cmpge(UVec3::splat(cells)).any() {
                continue;
            }

            let mut corner_pos = [Vec3::ZERO; 8];
            let mut corner_value = [0.0f32; 8];
            let mut case = 0usize;
            for (i, corner) in CUBE_CORNERS.iter().enumerate() {
                let pos = (id + UVec3::from_array(*corner)).as_vec3() * step;
                corner_pos[i] = pos;
                corner_value[i] = sample_volume(ctx, NOISE_TEXTURE, pos)?[0];
                if corner_value[i] < ISO_LEVEL {
                    case |= 1 << i;
                }
            }

            let edges = EDGE_TABLE[case];
            if edges == 0 {
                continue;
            }

            let mut edge_vertex = [Vec3::ZERO; 12];
            let mut edge_normal = [Vec3::ZERO; 12];
            for (e, [a, b]) in EDGE_CORNERS.iter().enumerate() {
                if edges & (1 << e) == 0 {
                    continue;
                }
                let mu = interpolate_edge(corner_value[*a], corner_value[*b]);
                edge_vertex[e] = corner_pos[*a].lerp(corner_pos[*b], mu);
                let n = sample_volume(ctx, NORMAL_TEXTURE, edge_vertex[e])?;
                edge_normal[e] = Vec3::new(n[0], n[1], n[2]).normalize_or_zero();
            }

            let row = &TRIANGLE_TABLE[case * 16..case * 16 + 16];
            for tri_edges in row.chunks_exact(3).take_while(|t| t[0] >= 0) {
                let tri = ctx.atomic_add(&vertices_counter, 1)? as u64;

                if tri < triangle_slots && tri < normal_slots {
                    for (k, edge) in tri_edges.iter().enumerate() {
                        let e = *edge as usize;
                        let slot = tri * 3 + k as u64;
                        ctx.write_vec4(VERTICES, slot, edge_vertex[e].extend(1.0).to_array())?;
                        ctx.write_vec4(NORMALS, slot, edge_normal[e].extend(0.0).to_array())?;
                    }
                }

                if emit_debug {
                    let point = ctx.atomic_add(&debug_counter, 1)? as u64;
                    if point < debug_slots {
                        let e = tri_edges[0] as usize;
                        let world = origin + edge_vertex[e];
                        let mut words = [0u32; 8];
                        words[..4].copy_from_slice(&world.extend(1.0).to_array().map(f32::to_bits));
                        words[4..].copy_from_slice(&edge_normal[e].extend(0.0).to_array().map(f32::to_bits));
                        ctx.write_element(DEBUG_POINTS, point, &words)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// `copyMeshBuffers`: sequential index triplets for every written triangle
pub struct CopyMeshKernel;

impl SoftwareKernel for CopyMeshKernel {
    fn dispatch(&self, ctx: &mut KernelInvocation) -> TerrainResult<()> {
        let vertices_counter = counter_slot(VERTICES);
        let written = (ctx.load_counter(&vertices_counter)? as u64)
            .min(ctx.element_count(VERTICES, VERTEX_STRIDE)? / 3)
            .min(ctx.element_count(TRIANGLES, TRIANGLE_STRIDE)?);

        for id in ctx.grid().ids() {
            let tri = id.x as u64;
            if tri >= written {
                continue;
            }
            let first = (tri * 3) as u32;
            ctx.write_element(TRIANGLES, tri, &[first, first + 1, first + 2, 0])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_density_is_deterministic() {
        let uniforms = ChunkUniforms {
            seed: 7.0,
            ..ChunkUniforms::default()
        };
        let a = DensityField::new(&uniforms);
        let b = DensityField::new(&uniforms);
        let p = Vec3::new(3.5, -12.0, 40.25);
        assert_eq!(a.sample(p), b.sample(p));
    }

    #[test]
    fn test_density_ground_term() {
        // Far above the ground the height term dominates the bounded noise
        let uniforms = ChunkUniforms::default();
        let field = DensityField::new(&uniforms);
        assert!(field.sample(Vec3::new(0.3, 10_000.0, 0.7)) > 0.0);
        assert!(field.sample(Vec3::new(0.3, -10_000.0, 0.7)) < 0.0);
    }

    #[test]
    fn test_interpolate_edge_midpoint() {
        let mu = interpolate_edge(-1.0, 1.0);
        assert!((mu - 0.5).abs() < 1e-6);
        assert_eq!(interpolate_edge(1.0, 1.0), 0.0);
        assert!((interpolate_edge(-3.0, 1.0) - 0.75).abs() < 1e-6);
    }
}
