//! Filter kernels for scalar volumes.
//!
//! Every kernel maps a boundary-clamped 3x3x3 neighborhood to a single delta
//! value. Kernels never see the shared volume; the cache is their whole
//! world, which is what keeps the explicit update scheme deterministic under
//! any slice-to-thread assignment.
//!
//! Directional fluxes are evaluated at the six half-point positions around
//! the target voxel. The axial gradient component at a half-point is the
//! one-sided difference across it; the two transverse components average the
//! central differences of the two voxels flanking it.

use crate::float_trait::DiffusionFloat;
use crate::method::MAX_PARAMETERS;
use crate::neighborhood::{Neighborhood, StencilScales};

/// Guard against division by vanishing gradient magnitude in the
/// curvature-based kernels.
const GRADIENT_EPSILON: f64 = 1e-10;

#[inline(always)]
fn axis_offset(axis: usize, step: isize) -> [isize; 3] {
    let mut o = [0; 3];
    o[axis] = step;
    o
}

#[inline(always)]
fn at<F: DiffusionFloat>(n: &Neighborhood<'_, F>, o: [isize; 3]) -> F {
    n.value(o[0], o[1], o[2])
}

/// Standard 6-point discrete Laplacian.
#[inline]
pub(crate) fn laplacian<F: DiffusionFloat>(
    n: &Neighborhood<'_, F>,
    scales: &StencilScales<F>,
) -> F {
    let two = F::from_f64_c(2.0);
    let center = n.value(0, 0, 0);
    let mut sum = F::zero();
    for axis in 0..3 {
        let plus = at(n, axis_offset(axis, 1));
        let minus = at(n, axis_offset(axis, -1));
        sum += (plus - two * center + minus) * scales.inv_h2[axis];
    }
    sum
}

/// Squared gradient magnitude at the half-point on `axis`, `side` = +/-1.
#[inline]
fn half_gradient_sq<F: DiffusionFloat>(
    n: &Neighborhood<'_, F>,
    scales: &StencilScales<F>,
    axis: usize,
    side: isize,
) -> F {
    let half = F::from_f64_c(0.5);
    let side_f = F::from_f64_c(side as f64);
    let e = axis_offset(axis, side);
    let center = n.value(0, 0, 0);

    let axial = (at(n, e) - center) * scales.inv_h[axis] * side_f;
    let mut sum = axial * axial;

    for t in 0..3 {
        if t == axis {
            continue;
        }
        let tp = axis_offset(t, 1);
        let tm = axis_offset(t, -1);
        let near = (at(n, tp) - at(n, tm)) * scales.inv_2h[t];
        let far_p = [tp[0] + e[0], tp[1] + e[1], tp[2] + e[2]];
        let far_m = [tm[0] + e[0], tm[1] + e[1], tm[2] + e[2]];
        let far = (at(n, far_p) - at(n, far_m)) * scales.inv_2h[t];
        let transverse = half * (near + far);
        sum += transverse * transverse;
    }
    sum
}

/// Exponential conductivity falloff: exp(-0.5 g^2 / K^2).
#[inline]
pub(crate) fn conductivity<F: DiffusionFloat>(grad_sq: F, k: F) -> F {
    let half = F::from_f64_c(0.5);
    (-(half * grad_sq) / (k * k)).exp()
}

/// One-sided differences across the two half-points on `axis`.
#[inline]
fn one_sided_diffs<F: DiffusionFloat>(
    n: &Neighborhood<'_, F>,
    scales: &StencilScales<F>,
    axis: usize,
) -> (F, F) {
    let center = n.value(0, 0, 0);
    let forward = (at(n, axis_offset(axis, 1)) - center) * scales.inv_h[axis];
    let backward = (center - at(n, axis_offset(axis, -1))) * scales.inv_h[axis];
    (forward, backward)
}

// =============================================================================
// Kernels
// =============================================================================

/// Isotropic diffusion: delta = parm[0] * Laplacian.
pub(crate) fn filter_homogeneous<F: DiffusionFloat>(
    n: &Neighborhood<'_, F>,
    scales: &StencilScales<F>,
    parms: &[F; MAX_PARAMETERS],
    delta: &mut [F],
) {
    delta[0] = parms[0] * laplacian(n, scales);
}

/// Perona-Malik diffusion: edge-suppressing flux divergence.
///
/// parm[0] scales the step, parm[1] is the conductivity K.
pub(crate) fn filter_perona_malik<F: DiffusionFloat>(
    n: &Neighborhood<'_, F>,
    scales: &StencilScales<F>,
    parms: &[F; MAX_PARAMETERS],
    delta: &mut [F],
) {
    let k = parms[1];
    let mut div = F::zero();
    for axis in 0..3 {
        let (forward, backward) = one_sided_diffs(n, scales, axis);
        let flux_p = conductivity(half_gradient_sq(n, scales, axis, 1), k) * forward;
        let flux_m = conductivity(half_gradient_sq(n, scales, axis, -1), k) * backward;
        div += (flux_p - flux_m) * scales.inv_h[axis];
    }
    delta[0] = parms[0] * div;
}

/// Shared core of the curvature kernels: flux divergence with each flux
/// normalized by the gradient magnitude at its half-point. `k` of `None`
/// skips the conductivity factor entirely.
#[inline]
fn normalized_flux_divergence<F: DiffusionFloat>(
    n: &Neighborhood<'_, F>,
    scales: &StencilScales<F>,
    k: Option<F>,
) -> F {
    let eps = F::from_f64_c(GRADIENT_EPSILON);
    let mut div = F::zero();
    for axis in 0..3 {
        let (forward, backward) = one_sided_diffs(n, scales, axis);
        let gp2 = half_gradient_sq(n, scales, axis, 1);
        let gm2 = half_gradient_sq(n, scales, axis, -1);
        let (cp, cm) = match k {
            Some(k) => (conductivity(gp2, k), conductivity(gm2, k)),
            None => (F::one(), F::one()),
        };
        let flux_p = cp * forward / (eps + gp2.sqrt());
        let flux_m = cm * backward / (eps + gm2.sqrt());
        div += (flux_p - flux_m) * scales.inv_h[axis];
    }
    div
}

/// Modified curvature diffusion.
///
/// parm[0] scales the step, parm[1] is the conductivity K, parm[2] blends
/// between the gradient-normalized flux divergence (0) and the plain
/// Laplacian (1).
pub(crate) fn filter_modified_curvature<F: DiffusionFloat>(
    n: &Neighborhood<'_, F>,
    scales: &StencilScales<F>,
    parms: &[F; MAX_PARAMETERS],
    delta: &mut [F],
) {
    let lerp = parms[2];
    let curvature = normalized_flux_divergence(n, scales, Some(parms[1]));
    let lap = laplacian(n, scales);
    delta[0] = parms[0] * (lerp * lap + (F::one() - lerp) * curvature);
}

/// Curvature flow: the pure gradient-normalized flux divergence, with no
/// conductivity gating. parm[0] scales the step.
pub(crate) fn filter_curvature_flow<F: DiffusionFloat>(
    n: &Neighborhood<'_, F>,
    scales: &StencilScales<F>,
    parms: &[F; MAX_PARAMETERS],
    delta: &mut [F],
) {
    delta[0] = parms[0] * normalized_flux_divergence(n, scales, None);
}
