//! Filter kernels for symmetric-tensor volumes.
//!
//! Tensor voxels carry 7 components: confidence first, then the 6 tensor
//! entries (xx, xy, xz, yy, yz, zz). Kernels diffuse the 6 tensor entries;
//! the confidence delta is always written as zero, so that component never
//! changes under any implemented method.

use crate::float_trait::DiffusionFloat;
use crate::method::{MAX_PARAMETERS, TENSOR_COMPONENTS};
use crate::neighborhood::{Neighborhood, StencilScales};
use crate::scalar::conductivity;
use crate::tensor_math::{
    eigensolve, invariant_gradients, principal_outer, rotation_tangents, sym_dot, Sym3,
};

/// Guard against vanishing eigenvalue spread in the linear-anisotropy
/// coefficient.
const ANISOTROPY_EPSILON: f64 = 1e-10;

#[inline(always)]
fn axis_offset(axis: usize, step: isize) -> [isize; 3] {
    let mut o = [0; 3];
    o[axis] = step;
    o
}

#[inline(always)]
fn comp_at<F: DiffusionFloat>(n: &Neighborhood<'_, F>, o: [isize; 3], c: usize) -> F {
    n.component(o[0], o[1], o[2], c)
}

/// The 6 tensor entries of the target voxel.
#[inline]
fn center_tensor<F: DiffusionFloat>(n: &Neighborhood<'_, F>) -> Sym3<F> {
    [
        n.component(0, 0, 0, 1),
        n.component(0, 0, 0, 2),
        n.component(0, 0, 0, 3),
        n.component(0, 0, 0, 4),
        n.component(0, 0, 0, 5),
        n.component(0, 0, 0, 6),
    ]
}

/// Discrete Laplacian of one voxel component.
#[inline]
fn component_laplacian<F: DiffusionFloat>(
    n: &Neighborhood<'_, F>,
    scales: &StencilScales<F>,
    c: usize,
) -> F {
    let two = F::from_f64_c(2.0);
    let center = n.component(0, 0, 0, c);
    let mut sum = F::zero();
    for axis in 0..3 {
        let plus = comp_at(n, axis_offset(axis, 1), c);
        let minus = comp_at(n, axis_offset(axis, -1), c);
        sum += (plus - two * center + minus) * scales.inv_h2[axis];
    }
    sum
}

/// Central-difference derivative of the tensor field along one spatial axis.
#[inline]
fn tensor_derivative<F: DiffusionFloat>(
    n: &Neighborhood<'_, F>,
    scales: &StencilScales<F>,
    axis: usize,
) -> Sym3<F> {
    let plus = axis_offset(axis, 1);
    let minus = axis_offset(axis, -1);
    let scale = scales.inv_2h[axis];
    let mut out = [F::zero(); 6];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = (comp_at(n, plus, i + 1) - comp_at(n, minus, i + 1)) * scale;
    }
    out
}

/// Discrete spatial Hessian of one voxel component: second differences on
/// the diagonal, symmetric cross differences off it.
#[inline]
fn component_hessian<F: DiffusionFloat>(
    n: &Neighborhood<'_, F>,
    scales: &StencilScales<F>,
    c: usize,
) -> Sym3<F> {
    let two = F::from_f64_c(2.0);
    let center = n.component(0, 0, 0, c);

    let second = |axis: usize| {
        let plus = comp_at(n, axis_offset(axis, 1), c);
        let minus = comp_at(n, axis_offset(axis, -1), c);
        (plus - two * center + minus) * scales.inv_h2[axis]
    };
    let cross = |a: usize, b: usize| {
        let pa = axis_offset(a, 1);
        let ma = axis_offset(a, -1);
        let pb = axis_offset(b, 1);
        let mb = axis_offset(b, -1);
        let pp = [pa[0] + pb[0], pa[1] + pb[1], pa[2] + pb[2]];
        let pm = [pa[0] + mb[0], pa[1] + mb[1], pa[2] + mb[2]];
        let mp = [ma[0] + pb[0], ma[1] + pb[1], ma[2] + pb[2]];
        let mm = [ma[0] + mb[0], ma[1] + mb[1], ma[2] + mb[2]];
        (comp_at(n, pp, c) - comp_at(n, pm, c) - comp_at(n, mp, c) + comp_at(n, mm, c))
            * scales.inv_2h[a]
            * scales.inv_2h[b]
    };

    [
        second(0),
        cross(0, 1),
        cross(0, 2),
        second(1),
        cross(1, 2),
        second(2),
    ]
}

// =============================================================================
// Kernels
// =============================================================================

/// Isotropic diffusion: per-component Laplacian scaled by parm[0].
pub(crate) fn filter_homogeneous<F: DiffusionFloat>(
    n: &Neighborhood<'_, F>,
    scales: &StencilScales<F>,
    parms: &[F; MAX_PARAMETERS],
    delta: &mut [F],
) {
    delta[0] = F::zero();
    for c in 1..TENSOR_COMPONENTS {
        delta[c] = parms[0] * component_laplacian(n, scales, c);
    }
}

/// "Self" diffusion: smooths each tensor component along the tensor's own
/// principal eigenvector direction, weighted by linear anisotropy and the
/// voxel's confidence. parm[0] scales the step.
pub(crate) fn filter_self<F: DiffusionFloat>(
    n: &Neighborhood<'_, F>,
    scales: &StencilScales<F>,
    parms: &[F; MAX_PARAMETERS],
    delta: &mut [F],
) {
    let eps = F::from_f64_c(ANISOTROPY_EPSILON);
    let confidence = n.component(0, 0, 0, 0);
    let t = center_tensor(n);
    let eig = eigensolve(&t);
    let [l0, l1, l2] = eig.values;
    let lin = (l0 - l1) / (l0 - l2 + eps);
    let along = principal_outer(&eig.vectors[0]);

    let weight = lin * parms[0] * confidence;
    delta[0] = F::zero();
    for c in 1..TENSOR_COMPONENTS {
        let hessian = component_hessian(n, scales, c);
        delta[c] = weight * sym_dot(&along, &hessian);
    }
}

/// "Finish" filter: per-component Laplacian gated by the product of three
/// conductivities, one per invariant. parm[0] scales the step; parm[1..=3]
/// are the conductivity K values for the mean, variance, and skew terms.
pub(crate) fn filter_finish<F: DiffusionFloat>(
    n: &Neighborhood<'_, F>,
    scales: &StencilScales<F>,
    parms: &[F; MAX_PARAMETERS],
    delta: &mut [F],
) {
    let t = center_tensor(n);
    let grads = invariant_gradients(&t);
    let eig = eigensolve(&t);
    let tangents = rotation_tangents(&eig.vectors);

    // Squared spatial gradients of the invariants: project the tensor-field
    // derivative along each axis onto the invariant directions. The skew
    // term also picks up the rotation-tangent directions.
    let mut g_mean = F::zero();
    let mut g_variance = F::zero();
    let mut g_skew = F::zero();
    for axis in 0..3 {
        let d = tensor_derivative(n, scales, axis);
        let pm = sym_dot(&d, &grads.mean);
        let pv = sym_dot(&d, &grads.variance);
        let ps = sym_dot(&d, &grads.skew);
        g_mean += pm * pm;
        g_variance += pv * pv;
        let mut rot = ps * ps;
        for phi in &tangents {
            let pr = sym_dot(&d, phi);
            rot += pr * pr;
        }
        g_skew += rot;
    }

    let cond = conductivity(g_mean, parms[1])
        * conductivity(g_variance, parms[2])
        * conductivity(g_skew, parms[3]);

    delta[0] = F::zero();
    for c in 1..TENSOR_COMPONENTS {
        delta[c] = parms[0] * cond * component_laplacian(n, scales, c);
    }
}
