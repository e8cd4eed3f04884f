//! Value kinds, numerical methods, and the kernel dispatch registry.
//!
//! A [`Kind`] describes the per-voxel value layout (scalar or symmetric
//! tensor), a [`Method`] identifies a numerical scheme together with its
//! declared parameter count. The registry functions at the bottom map a
//! `(Kind, Method)` pair to the filter kernel and update rule that implement
//! it. Dispatch is resolved once at configuration time and stored in the
//! context, so the per-voxel hot path pays a plain function-pointer call.

use std::fmt;

use crate::float_trait::DiffusionFloat;
use crate::neighborhood::{Neighborhood, StencilScales};
use crate::{scalar, tensor};

/// Number of parameter slots carried by a context.
///
/// Methods declare how many of these they consume; unused slots stay zero.
pub const MAX_PARAMETERS: usize = 5;

/// Number of components in a tensor voxel: 1 confidence slot followed by the
/// 6 independent entries of a symmetric 3x3 tensor (xx, xy, xz, yy, yz, zz).
pub const TENSOR_COMPONENTS: usize = 7;

/// Filter kernel: reads the neighborhood cache, writes the delta slice.
///
/// Kernels never touch the shared volume directly; the cache is their only
/// input and the delta half of the target voxel their only output.
pub(crate) type KernelFn<F> =
    fn(&Neighborhood<'_, F>, &StencilScales<F>, &[F; MAX_PARAMETERS], &mut [F]);

/// Update rule: folds the delta half into the current half of one voxel.
pub(crate) type UpdateFn<F> = fn(&mut [F], &[F]);

/// Per-voxel value layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Kind {
    /// One component per voxel.
    #[default]
    Scalar,
    /// Seven components per voxel: confidence + 6 symmetric tensor entries.
    Tensor,
}

impl Kind {
    /// Number of value components per voxel.
    pub fn val_len(&self) -> usize {
        match self {
            Kind::Scalar => 1,
            Kind::Tensor => TENSOR_COMPONENTS,
        }
    }

    /// Number of input axes expected for this kind: 3 spatial axes, plus a
    /// leading component axis when voxels carry more than one component.
    pub fn num_axes(&self) -> usize {
        match self {
            Kind::Scalar => 3,
            Kind::Tensor => 4,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Scalar => "scalar",
            Kind::Tensor => "tensor",
        };
        f.write_str(name)
    }
}

/// Numerical diffusion/filtering scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    /// No-op kernel (delta = 0), used for pipeline validation.
    #[default]
    Testing,
    /// Isotropic diffusion: scaled discrete Laplacian.
    Homogeneous,
    /// Edge-preserving diffusion with exponential conductivity.
    PeronaMalik,
    /// Blend of Laplacian and gradient-normalized flux divergence.
    ModifiedCurvature,
    /// Pure gradient-normalized flux divergence (mean-curvature motion).
    CurvatureFlow,
    /// Tensor diffusion along the principal eigenvector direction.
    TensorSelf,
    /// Tensor diffusion gated by invariant-gradient conductivities.
    TensorFinish,
}

impl Method {
    /// How many of the parameter slots this method consumes.
    ///
    /// Configuration requires exactly this many parameters to be supplied.
    pub fn num_parameters(&self) -> usize {
        match self {
            Method::Testing => 0,
            Method::Homogeneous => 1,
            Method::PeronaMalik => 2,
            Method::ModifiedCurvature => 3,
            Method::CurvatureFlow => 1,
            Method::TensorSelf => 1,
            Method::TensorFinish => 4,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Testing => "testing",
            Method::Homogeneous => "homogeneous",
            Method::PeronaMalik => "perona-malik",
            Method::ModifiedCurvature => "modified-curvature",
            Method::CurvatureFlow => "curvature-flow",
            Method::TensorSelf => "self",
            Method::TensorFinish => "finish",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// No-op kernel shared by both kinds: every delta component is zero.
fn filter_testing<F: DiffusionFloat>(
    _neigh: &Neighborhood<'_, F>,
    _scales: &StencilScales<F>,
    _parms: &[F; MAX_PARAMETERS],
    delta: &mut [F],
) {
    for d in delta.iter_mut() {
        *d = F::zero();
    }
}

/// Look up the filter kernel implementing `method` on `kind`.
///
/// Returns `None` for combinations with no implementation; configuration
/// turns that into an `UnsupportedMethod` error.
pub(crate) fn kernel_for<F: DiffusionFloat>(kind: Kind, method: Method) -> Option<KernelFn<F>> {
    match (kind, method) {
        (_, Method::Testing) => Some(filter_testing),
        (Kind::Scalar, Method::Homogeneous) => Some(scalar::filter_homogeneous),
        (Kind::Scalar, Method::PeronaMalik) => Some(scalar::filter_perona_malik),
        (Kind::Scalar, Method::ModifiedCurvature) => Some(scalar::filter_modified_curvature),
        (Kind::Scalar, Method::CurvatureFlow) => Some(scalar::filter_curvature_flow),
        (Kind::Tensor, Method::Homogeneous) => Some(tensor::filter_homogeneous),
        (Kind::Tensor, Method::TensorSelf) => Some(tensor::filter_self),
        (Kind::Tensor, Method::TensorFinish) => Some(tensor::filter_finish),
        _ => None,
    }
}

/// Update rule adding the delta half into the current half component-wise.
fn update_add<F: DiffusionFloat>(current: &mut [F], delta: &[F]) {
    for (c, d) in current.iter_mut().zip(delta.iter()) {
        *c += *d;
    }
}

/// Look up the update rule for `kind`.
///
/// Scalar voxels add their single delta; tensor voxels add all 7 components
/// independently. No implemented tensor kernel ever writes a nonzero
/// confidence delta, so the confidence slot stays constant in practice.
pub(crate) fn update_for<F: DiffusionFloat>(_kind: Kind) -> UpdateFn<F> {
    update_add
}
