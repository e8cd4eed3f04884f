//! Boundary-clamped neighborhood caching.
//!
//! Before every kernel evaluation the owning worker refreshes a thread-
//! private `(2r+1)^3 x val_len` cache from the current halves of the shared
//! buffer. Indices past the domain edge clamp to the edge voxel (replicate
//! policy). Kernels read the cache and nothing else, so the shared buffer is
//! never aliased during a kernel call.
//!
//! Three fill strategies exist: a generic path for any `(radius, val_len)`
//! and two specialized paths for the common radius-1 cases with 1 and 7
//! components. All three produce identical caches; the specializations only
//! hoist the per-axis clamping out of the inner loops.

use crate::buffer::VolumeBuffer;
use crate::float_trait::DiffusionFloat;
use crate::method::TENSOR_COMPONENTS;

/// Neighborhood fill strategy, selected per worker task at pool start.
pub(crate) type FillFn<F> = fn(&mut [F], &VolumeBuffer<F>, usize, usize, usize, usize);

/// Pick the best fill implementation for a `(radius, val_len)` pair.
pub(crate) fn select_fill<F: DiffusionFloat>(radius: usize, val_len: usize) -> FillFn<F> {
    match (radius, val_len) {
        (1, 1) => fill_r1_scalar,
        (1, TENSOR_COMPONENTS) => fill_r1_tensor,
        _ => fill_generic,
    }
}

/// Cache length for a `(radius, val_len)` pair.
pub(crate) fn cache_len(radius: usize, val_len: usize) -> usize {
    let diameter = 2 * radius + 1;
    diameter * diameter * diameter * val_len
}

#[inline(always)]
fn clamp_axis(coord: isize, extent: usize) -> usize {
    coord.clamp(0, extent as isize - 1) as usize
}

/// Generic fill for any radius and component count.
pub(crate) fn fill_generic<F: DiffusionFloat>(
    cache: &mut [F],
    buf: &VolumeBuffer<F>,
    radius: usize,
    x: usize,
    y: usize,
    z: usize,
) {
    let dims = buf.dims();
    let vl = buf.val_len();
    let diameter = 2 * radius + 1;
    let r = radius as isize;
    let mut w = 0;
    for dz in 0..diameter {
        let zz = clamp_axis(z as isize - r + dz as isize, dims.sz);
        for dy in 0..diameter {
            let yy = clamp_axis(y as isize - r + dy as isize, dims.sy);
            for dx in 0..diameter {
                let xx = clamp_axis(x as isize - r + dx as isize, dims.sx);
                let base = buf.voxel_base(xx, yy, zz);
                for c in 0..vl {
                    // SAFETY: current halves are read-only during filtering.
                    cache[w + c] = unsafe { buf.read(base + c) };
                }
                w += vl;
            }
        }
    }
}

#[inline(always)]
fn clamped_r1(coord: usize, extent: usize) -> [usize; 3] {
    [
        coord.saturating_sub(1),
        coord,
        if coord + 1 < extent { coord + 1 } else { extent - 1 },
    ]
}

/// Radius-1 fill for single-component voxels.
pub(crate) fn fill_r1_scalar<F: DiffusionFloat>(
    cache: &mut [F],
    buf: &VolumeBuffer<F>,
    _radius: usize,
    x: usize,
    y: usize,
    z: usize,
) {
    let dims = buf.dims();
    let xs = clamped_r1(x, dims.sx);
    let ys = clamped_r1(y, dims.sy);
    let zs = clamped_r1(z, dims.sz);
    let mut w = 0;
    for &zz in &zs {
        for &yy in &ys {
            for &xx in &xs {
                // SAFETY: current halves are read-only during filtering.
                cache[w] = unsafe { buf.read(buf.voxel_base(xx, yy, zz)) };
                w += 1;
            }
        }
    }
}

/// Radius-1 fill for 7-component tensor voxels.
pub(crate) fn fill_r1_tensor<F: DiffusionFloat>(
    cache: &mut [F],
    buf: &VolumeBuffer<F>,
    _radius: usize,
    x: usize,
    y: usize,
    z: usize,
) {
    let dims = buf.dims();
    let xs = clamped_r1(x, dims.sx);
    let ys = clamped_r1(y, dims.sy);
    let zs = clamped_r1(z, dims.sz);
    let mut w = 0;
    for &zz in &zs {
        for &yy in &ys {
            for &xx in &xs {
                let base = buf.voxel_base(xx, yy, zz);
                for c in 0..TENSOR_COMPONENTS {
                    // SAFETY: current halves are read-only during filtering.
                    cache[w + c] = unsafe { buf.read(base + c) };
                }
                w += TENSOR_COMPONENTS;
            }
        }
    }
}

// =============================================================================
// Kernel-facing views
// =============================================================================

/// Read-only view of a filled cache with signed-offset indexing.
///
/// Offsets run in `[-radius, radius]` per axis; `(0, 0, 0)` is the target
/// voxel. The kernels in this crate only ever reach offsets in `[-1, 1]`.
pub(crate) struct Neighborhood<'a, F> {
    values: &'a [F],
    radius: isize,
    diameter: usize,
    val_len: usize,
}

impl<'a, F: DiffusionFloat> Neighborhood<'a, F> {
    pub fn new(values: &'a [F], radius: usize, val_len: usize) -> Self {
        let diameter = 2 * radius + 1;
        debug_assert_eq!(values.len(), diameter * diameter * diameter * val_len);
        Self {
            values,
            radius: radius as isize,
            diameter,
            val_len,
        }
    }

    #[inline(always)]
    fn idx(&self, dx: isize, dy: isize, dz: isize) -> usize {
        let d = self.diameter;
        let x = (dx + self.radius) as usize;
        let y = (dy + self.radius) as usize;
        let z = (dz + self.radius) as usize;
        ((z * d + y) * d + x) * self.val_len
    }

    /// Component 0 at an offset (the whole value for scalar data).
    #[inline(always)]
    pub fn value(&self, dx: isize, dy: isize, dz: isize) -> F {
        self.values[self.idx(dx, dy, dz)]
    }

    /// Component `c` at an offset.
    #[inline(always)]
    pub fn component(&self, dx: isize, dy: isize, dz: isize, c: usize) -> F {
        self.values[self.idx(dx, dy, dz) + c]
    }
}

/// Reciprocal spacing factors shared by all stencil evaluations.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StencilScales<F> {
    /// 1/h per axis, for one-sided differences.
    pub inv_h: [F; 3],
    /// 1/(2h) per axis, for central differences.
    pub inv_2h: [F; 3],
    /// 1/h^2 per axis, for second differences.
    pub inv_h2: [F; 3],
}

impl<F: DiffusionFloat> StencilScales<F> {
    pub fn from_spacing(spacing: [f64; 3]) -> Self {
        let mut inv_h = [F::zero(); 3];
        let mut inv_2h = [F::zero(); 3];
        let mut inv_h2 = [F::zero(); 3];
        for axis in 0..3 {
            let h = spacing[axis];
            inv_h[axis] = F::from_f64_c(1.0 / h);
            inv_2h[axis] = F::from_f64_c(1.0 / (2.0 * h));
            inv_h2[axis] = F::from_f64_c(1.0 / (h * h));
        }
        Self {
            inv_h,
            inv_2h,
            inv_h2,
        }
    }
}
