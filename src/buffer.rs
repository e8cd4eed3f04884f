//! Double-buffered voxel storage shared across the worker pool.
//!
//! The buffer interleaves two halves per voxel: `val_len` "current"
//! components followed by `val_len` "delta" components. During the filter
//! phase every thread reads current halves freely and writes only the delta
//! halves of voxels in slices it has claimed; during the update phase each
//! thread touches both halves of its claimed slices only. Slice ownership is
//! exclusive (see the claim protocol in `engine`), which is what makes the
//! unsafe accessors below sound: concurrently produced references never
//! overlap.

use std::cell::UnsafeCell;

use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use rayon::prelude::*;

use crate::error::ResourceError;
use crate::float_trait::DiffusionFloat;
use crate::method::Kind;
use crate::volume::Volume;

/// Minimum voxel count before copy-in/copy-out fan out over rayon.
/// Below this the per-thread overhead outweighs the memory bandwidth win.
const PARALLEL_COPY_THRESHOLD: usize = 1 << 16;

/// Spatial extents of the volume grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GridDims {
    pub sx: usize,
    pub sy: usize,
    pub sz: usize,
}

impl GridDims {
    pub fn num_voxels(&self) -> usize {
        self.sx * self.sy * self.sz
    }

    /// Linear voxel index, x fastest.
    #[inline(always)]
    pub fn voxel_index(&self, x: usize, y: usize, z: usize) -> usize {
        x + self.sx * (y + self.sy * z)
    }
}

/// Interleaved current/delta storage for one volume.
pub(crate) struct VolumeBuffer<F> {
    cell: UnsafeCell<Vec<F>>,
    dims: GridDims,
    val_len: usize,
}

// Disjoint-range access is coordinated by the slice-claim protocol; the
// buffer itself is just the storage.
unsafe impl<F: Send> Sync for VolumeBuffer<F> {}

impl<F: DiffusionFloat> VolumeBuffer<F> {
    /// Allocate a zeroed buffer for `dims` voxels of `val_len` components.
    pub fn new(dims: GridDims, val_len: usize) -> Result<Self, ResourceError> {
        let elements = (dims.sx as u128)
            * (dims.sy as u128)
            * (dims.sz as u128)
            * (2 * val_len as u128);
        if elements > isize::MAX as u128 {
            return Err(ResourceError::BufferTooLarge { elements });
        }
        let data = vec![F::zero(); elements as usize];
        Ok(Self {
            cell: UnsafeCell::new(data),
            dims,
            val_len,
        })
    }

    pub fn dims(&self) -> GridDims {
        self.dims
    }

    pub fn val_len(&self) -> usize {
        self.val_len
    }

    /// Components per voxel including both halves.
    #[inline(always)]
    pub fn stride(&self) -> usize {
        2 * self.val_len
    }

    /// Offset of a voxel's current half; the delta half starts `val_len`
    /// components later.
    #[inline(always)]
    pub fn voxel_base(&self, x: usize, y: usize, z: usize) -> usize {
        self.dims.voxel_index(x, y, z) * self.stride()
    }

    /// Read one component.
    ///
    /// # Safety
    /// The location must not be concurrently written. The phase protocol
    /// guarantees this for current halves during filtering and for any
    /// location while the pool is parked.
    #[inline(always)]
    pub unsafe fn read(&self, idx: usize) -> F {
        *(*self.cell.get()).as_ptr().add(idx)
    }

    /// Exclusive view of `len` components starting at `base`.
    ///
    /// # Safety
    /// The caller must hold exclusive ownership of the range, which the
    /// claim protocol provides for voxels inside a claimed slice.
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn range_mut(&self, base: usize, len: usize) -> &mut [F] {
        std::slice::from_raw_parts_mut((*self.cell.get()).as_mut_ptr().add(base), len)
    }

    /// Exclusive access to the whole buffer. Requires `&mut self`, so it is
    /// only reachable while no worker holds a handle.
    pub fn as_mut_slice(&mut self) -> &mut [F] {
        self.cell.get_mut().as_mut_slice()
    }

    // =========================================================================
    // Copy-in / copy-out
    // =========================================================================

    /// Fill the current halves from an input volume; delta halves stay zero.
    pub fn copy_in(&mut self, input: &Volume<F>) {
        let dims = self.dims;
        let vl = self.val_len;
        let stride = self.stride();
        let slice_elems = dims.sx * dims.sy * stride;
        let data = input.data();
        let tensor = input.kind() == Kind::Tensor;

        let fill_slice = |z: usize, chunk: &mut [F]| {
            let mut w = 0;
            for y in 0..dims.sy {
                for x in 0..dims.sx {
                    if tensor {
                        for c in 0..vl {
                            chunk[w + c] = data[IxDyn(&[c, x, y, z])];
                        }
                    } else {
                        chunk[w] = data[IxDyn(&[x, y, z])];
                    }
                    w += stride;
                }
            }
        };

        let buf = self.cell.get_mut();
        if dims.num_voxels() >= PARALLEL_COPY_THRESHOLD {
            buf.par_chunks_mut(slice_elems)
                .enumerate()
                .for_each(|(z, chunk)| fill_slice(z, chunk));
        } else {
            for (z, chunk) in buf.chunks_mut(slice_elems).enumerate() {
                fill_slice(z, chunk);
            }
        }
    }

    /// Extract the current halves into a freshly allocated array shaped like
    /// the original input (component axis leading for tensor data).
    ///
    /// Must only be called while the worker pool is parked or stopped; the
    /// internal reads assume no concurrent writer.
    pub fn copy_out(&self) -> ArrayD<F> {
        let dims = self.dims;
        let vl = self.val_len;
        let stride = self.stride();
        let src: &[F] = unsafe { &*self.cell.get() };
        let slice_elems_in = dims.sx * dims.sy * stride;
        let slice_elems_out = dims.sx * dims.sy * vl;

        let mut out = vec![F::zero(); dims.num_voxels() * vl];
        let drain_slice = |z: usize, chunk: &mut [F]| {
            let base = z * slice_elems_in;
            let mut r = 0;
            let mut w = 0;
            while w < chunk.len() {
                chunk[w..w + vl].copy_from_slice(&src[base + r..base + r + vl]);
                r += stride;
                w += vl;
            }
        };
        if dims.num_voxels() >= PARALLEL_COPY_THRESHOLD {
            out.par_chunks_mut(slice_elems_out)
                .enumerate()
                .for_each(|(z, chunk)| drain_slice(z, chunk));
        } else {
            for (z, chunk) in out.chunks_mut(slice_elems_out).enumerate() {
                drain_slice(z, chunk);
            }
        }

        // Component-then-x-fastest ordering is exactly column-major over the
        // output shape, for scalar and tensor layouts alike.
        let shape: Vec<usize> = if vl == 1 {
            vec![dims.sx, dims.sy, dims.sz]
        } else {
            vec![vl, dims.sx, dims.sy, dims.sz]
        };
        ArrayD::from_shape_vec(IxDyn(&shape).f(), out)
            .expect("buffer length matches volume shape")
    }
}
