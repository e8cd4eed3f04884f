//! Symmetric 3x3 tensor primitives for the tensor filter kernels.
//!
//! A tensor is carried as its 6 independent components in the order
//! (xx, xy, xz, yy, yz, zz). This module supplies the eigen-decomposition,
//! the gradients of the three eigenvalue invariants (mean, variance, skew),
//! and the rotation tangents, which is the entire linear-algebra surface the
//! kernels consume.
//!
//! The eigensolver is the closed-form trigonometric solve for symmetric 3x3
//! matrices; eigenvectors come from cross products of the rows of `T - λI`,
//! with orthonormal-complement fallbacks in the degenerate cases.

use crate::float_trait::DiffusionFloat;

/// Six independent components of a symmetric 3x3 tensor.
pub(crate) type Sym3<F> = [F; 6];

const XX: usize = 0;
const XY: usize = 1;
const XZ: usize = 2;
const YY: usize = 3;
const YZ: usize = 4;
const ZZ: usize = 5;

/// Relative tolerance for eigenvalue coincidence checks.
const DEGENERACY_TOLERANCE: f64 = 1e-6;

/// Absolute guard for vanishing deviatoric norms.
const TINY: f64 = 1e-30;

// =============================================================================
// Component algebra
// =============================================================================

/// Frobenius inner product; off-diagonal entries count twice.
#[inline]
pub(crate) fn sym_dot<F: DiffusionFloat>(a: &Sym3<F>, b: &Sym3<F>) -> F {
    let two = F::from_f64_c(2.0);
    a[XX] * b[XX]
        + a[YY] * b[YY]
        + a[ZZ] * b[ZZ]
        + two * (a[XY] * b[XY] + a[XZ] * b[XZ] + a[YZ] * b[YZ])
}

#[inline]
pub(crate) fn sym_norm<F: DiffusionFloat>(a: &Sym3<F>) -> F {
    sym_dot(a, a).sqrt()
}

#[inline]
fn sym_scale<F: DiffusionFloat>(a: &Sym3<F>, s: F) -> Sym3<F> {
    [
        a[0] * s,
        a[1] * s,
        a[2] * s,
        a[3] * s,
        a[4] * s,
        a[5] * s,
    ]
}

#[inline]
fn sym_identity<F: DiffusionFloat>() -> Sym3<F> {
    let o = F::one();
    let z = F::zero();
    [o, z, z, o, z, o]
}

#[inline]
fn trace<F: DiffusionFloat>(a: &Sym3<F>) -> F {
    a[XX] + a[YY] + a[ZZ]
}

/// a - s * I
#[inline]
fn sym_shift<F: DiffusionFloat>(a: &Sym3<F>, s: F) -> Sym3<F> {
    let mut out = *a;
    out[XX] -= s;
    out[YY] -= s;
    out[ZZ] -= s;
    out
}

/// Symmetric product a * a.
#[inline]
fn sym_square<F: DiffusionFloat>(a: &Sym3<F>) -> Sym3<F> {
    [
        a[XX] * a[XX] + a[XY] * a[XY] + a[XZ] * a[XZ],
        a[XX] * a[XY] + a[XY] * a[YY] + a[XZ] * a[YZ],
        a[XX] * a[XZ] + a[XY] * a[YZ] + a[XZ] * a[ZZ],
        a[XY] * a[XY] + a[YY] * a[YY] + a[YZ] * a[YZ],
        a[XY] * a[XZ] + a[YY] * a[YZ] + a[YZ] * a[ZZ],
        a[XZ] * a[XZ] + a[YZ] * a[YZ] + a[ZZ] * a[ZZ],
    ]
}

#[inline]
fn sym_det<F: DiffusionFloat>(a: &Sym3<F>) -> F {
    a[XX] * (a[YY] * a[ZZ] - a[YZ] * a[YZ]) - a[XY] * (a[XY] * a[ZZ] - a[YZ] * a[XZ])
        + a[XZ] * (a[XY] * a[YZ] - a[YY] * a[XZ])
}

/// Scale to unit Frobenius norm, or all zeros if the norm vanishes.
#[inline]
fn sym_normalized<F: DiffusionFloat>(a: &Sym3<F>) -> Sym3<F> {
    let norm = sym_norm(a);
    if norm < F::from_f64_c(TINY) {
        [F::zero(); 6]
    } else {
        sym_scale(a, F::one() / norm)
    }
}

// =============================================================================
// Vector helpers
// =============================================================================

#[inline]
fn cross<F: DiffusionFloat>(a: &[F; 3], b: &[F; 3]) -> [F; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[inline]
fn vec_dot<F: DiffusionFloat>(a: &[F; 3], b: &[F; 3]) -> F {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
fn vec_norm<F: DiffusionFloat>(a: &[F; 3]) -> F {
    vec_dot(a, a).sqrt()
}

#[inline]
fn vec_normalized<F: DiffusionFloat>(a: &[F; 3]) -> [F; 3] {
    let n = vec_norm(a);
    if n < F::from_f64_c(TINY) {
        [F::one(), F::zero(), F::zero()]
    } else {
        [a[0] / n, a[1] / n, a[2] / n]
    }
}

/// Any unit vector orthogonal to unit `v`, plus the third of the triad.
fn orthonormal_complement<F: DiffusionFloat>(v: &[F; 3]) -> ([F; 3], [F; 3]) {
    // Cross against the axis v is least aligned with.
    let ax = v[0].abs();
    let ay = v[1].abs();
    let az = v[2].abs();
    let seed = if ax <= ay && ax <= az {
        [F::one(), F::zero(), F::zero()]
    } else if ay <= az {
        [F::zero(), F::one(), F::zero()]
    } else {
        [F::zero(), F::zero(), F::one()]
    };
    let u = vec_normalized(&cross(v, &seed));
    let w = cross(v, &u);
    (u, w)
}

// =============================================================================
// Eigen-decomposition
// =============================================================================

/// Eigenvalues (descending) and matching orthonormal eigenvectors.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Eigensystem<F> {
    pub values: [F; 3],
    pub vectors: [[F; 3]; 3],
}

/// Eigenvector for a simple eigenvalue, via the largest cross product of
/// rows of `T - λI`.
fn simple_eigenvector<F: DiffusionFloat>(t: &Sym3<F>, lambda: F) -> [F; 3] {
    let a = sym_shift(t, lambda);
    let r0 = [a[XX], a[XY], a[XZ]];
    let r1 = [a[XY], a[YY], a[YZ]];
    let r2 = [a[XZ], a[YZ], a[ZZ]];
    let c01 = cross(&r0, &r1);
    let c02 = cross(&r0, &r2);
    let c12 = cross(&r1, &r2);
    let n01 = vec_dot(&c01, &c01);
    let n02 = vec_dot(&c02, &c02);
    let n12 = vec_dot(&c12, &c12);
    let best = if n01 >= n02 && n01 >= n12 {
        c01
    } else if n02 >= n12 {
        c02
    } else {
        c12
    };
    vec_normalized(&best)
}

/// Closed-form symmetric 3x3 eigen-decomposition.
pub(crate) fn eigensolve<F: DiffusionFloat>(t: &Sym3<F>) -> Eigensystem<F> {
    let third = F::from_f64_c(1.0 / 3.0);
    let two = F::from_f64_c(2.0);
    let mean = trace(t) * third;
    let dev = sym_shift(t, mean);
    let p = (sym_dot(&dev, &dev) / F::from_f64_c(6.0)).sqrt();

    if p < F::from_f64_c(TINY) {
        // Isotropic tensor: every direction is an eigenvector.
        return Eigensystem {
            values: [mean; 3],
            vectors: [
                [F::one(), F::zero(), F::zero()],
                [F::zero(), F::one(), F::zero()],
                [F::zero(), F::zero(), F::one()],
            ],
        };
    }

    let b = sym_scale(&dev, F::one() / p);
    let half_det = sym_det(&b) / two;
    let r = half_det.max(-F::one()).min(F::one());
    let phi = r.acos() * third;
    let two_thirds_pi = F::from_f64_c(2.0 * std::f64::consts::PI / 3.0);

    let l0 = mean + two * p * phi.cos();
    let l2 = mean + two * p * (phi + two_thirds_pi).cos();
    let l1 = trace(t) - l0 - l2;
    let values = [l0, l1, l2];

    let spread = l0 - l2;
    let tol = F::from_f64_c(DEGENERACY_TOLERANCE) * spread;
    let vectors = if l0 - l1 <= tol {
        // Top pair coincides; only the minor eigenvector is determined.
        let e2 = simple_eigenvector(t, l2);
        let (e0, e1) = orthonormal_complement(&e2);
        [e0, e1, e2]
    } else if l1 - l2 <= tol {
        let e0 = simple_eigenvector(t, l0);
        let (e1, e2) = orthonormal_complement(&e0);
        [e0, e1, e2]
    } else {
        let e0 = simple_eigenvector(t, l0);
        let e2 = simple_eigenvector(t, l2);
        let e1 = vec_normalized(&cross(&e2, &e0));
        [e0, e1, e2]
    };

    Eigensystem { values, vectors }
}

// =============================================================================
// Invariants
// =============================================================================

/// Unit-norm gradients of the three eigenvalue invariants with respect to
/// the tensor. Gradients of undefined invariants (vanishing deviator) are
/// all-zero tensors, which drop the corresponding conductivity term.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InvariantGradients<F> {
    /// Gradient of the eigenvalue mean (trace / 3).
    pub mean: Sym3<F>,
    /// Gradient of the eigenvalue variance.
    pub variance: Sym3<F>,
    /// Gradient of the eigenvalue skewness.
    pub skew: Sym3<F>,
}

pub(crate) fn invariant_gradients<F: DiffusionFloat>(t: &Sym3<F>) -> InvariantGradients<F> {
    let third = F::from_f64_c(1.0 / 3.0);
    let mean = trace(t) * third;
    let dev = sym_shift(t, mean);
    let dev_sq_norm = sym_dot(&dev, &dev);
    let mu2 = dev_sq_norm * third;

    let grad_mean = sym_normalized(&sym_identity::<F>());
    let grad_variance = sym_normalized(&dev);

    let grad_skew = if mu2 < F::from_f64_c(TINY) {
        [F::zero(); 6]
    } else {
        // skew = mu3 / mu2^(3/2), mu3 = tr(dev^3) / 3.
        let dev2 = sym_square(&dev);
        let mu3 = sym_dot(&dev2, &dev) * third;
        let grad_mu2 = sym_scale(&dev, F::from_f64_c(2.0) * third);
        let grad_mu3 = sym_shift(&dev2, dev_sq_norm * third);
        let pow32 = mu2 * mu2.sqrt();
        let mut g = sym_scale(&grad_mu3, F::one() / pow32);
        let coeff = F::from_f64_c(1.5) * mu3 / (pow32 * mu2);
        for i in 0..6 {
            g[i] -= coeff * grad_mu2[i];
        }
        sym_normalized(&g)
    };

    InvariantGradients {
        mean: grad_mean,
        variance: grad_variance,
        skew: grad_skew,
    }
}

/// Unit-norm tangents of infinitesimal rotations, one per eigenvector axis.
pub(crate) fn rotation_tangents<F: DiffusionFloat>(vectors: &[[F; 3]; 3]) -> [Sym3<F>; 3] {
    let [e0, e1, e2] = vectors;
    [
        sym_outer_pair(e1, e2),
        sym_outer_pair(e0, e2),
        sym_outer_pair(e0, e1),
    ]
}

/// (a ⊗ b + b ⊗ a) / sqrt(2), unit-norm for orthonormal a, b.
fn sym_outer_pair<F: DiffusionFloat>(a: &[F; 3], b: &[F; 3]) -> Sym3<F> {
    let inv_sqrt2 = F::from_f64_c(std::f64::consts::FRAC_1_SQRT_2);
    [
        (a[0] * b[0] + b[0] * a[0]) * inv_sqrt2,
        (a[0] * b[1] + b[0] * a[1]) * inv_sqrt2,
        (a[0] * b[2] + b[0] * a[2]) * inv_sqrt2,
        (a[1] * b[1] + b[1] * a[1]) * inv_sqrt2,
        (a[1] * b[2] + b[1] * a[2]) * inv_sqrt2,
        (a[2] * b[2] + b[2] * a[2]) * inv_sqrt2,
    ]
}

/// Rank-1 outer product e ⊗ e of a (unit) vector with itself.
pub(crate) fn principal_outer<F: DiffusionFloat>(e: &[F; 3]) -> Sym3<F> {
    [
        e[0] * e[0],
        e[0] * e[1],
        e[0] * e[2],
        e[1] * e[1],
        e[1] * e[2],
        e[2] * e[2],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64, eps: f64) -> bool {
        (a - b).abs() < eps
    }

    fn sym(xx: f64, xy: f64, xz: f64, yy: f64, yz: f64, zz: f64) -> Sym3<f64> {
        [xx, xy, xz, yy, yz, zz]
    }

    /// Reconstruct T v for a symmetric tensor.
    fn apply(t: &Sym3<f64>, v: &[f64; 3]) -> [f64; 3] {
        [
            t[XX] * v[0] + t[XY] * v[1] + t[XZ] * v[2],
            t[XY] * v[0] + t[YY] * v[1] + t[YZ] * v[2],
            t[XZ] * v[0] + t[YZ] * v[1] + t[ZZ] * v[2],
        ]
    }

    fn assert_eigenpair(t: &Sym3<f64>, lambda: f64, v: &[f64; 3]) {
        let tv = apply(t, v);
        for i in 0..3 {
            assert!(
                approx(tv[i], lambda * v[i], 1e-9),
                "T v != lambda v: {tv:?} vs {lambda} * {v:?}"
            );
        }
    }

    // ==================== Eigensolver ====================

    #[test]
    fn test_eigensolve_diagonal() {
        let t = sym(3.0, 0.0, 0.0, 1.0, 0.0, -2.0);
        let eig = eigensolve(&t);
        assert!(approx(eig.values[0], 3.0, 1e-12));
        assert!(approx(eig.values[1], 1.0, 1e-12));
        assert!(approx(eig.values[2], -2.0, 1e-12));
        for i in 0..3 {
            assert_eigenpair(&t, eig.values[i], &eig.vectors[i]);
        }
    }

    #[test]
    fn test_eigensolve_full_tensor() {
        let t = sym(2.0, 1.0, 0.5, 3.0, -0.5, 1.5);
        let eig = eigensolve(&t);
        // Descending order.
        assert!(eig.values[0] >= eig.values[1]);
        assert!(eig.values[1] >= eig.values[2]);
        // Trace preserved.
        assert!(approx(eig.values.iter().sum::<f64>(), 6.5, 1e-9));
        for i in 0..3 {
            assert_eigenpair(&t, eig.values[i], &eig.vectors[i]);
        }
    }

    #[test]
    fn test_eigensolve_isotropic() {
        let t = sym(2.0, 0.0, 0.0, 2.0, 0.0, 2.0);
        let eig = eigensolve(&t);
        for v in eig.values {
            assert!(approx(v, 2.0, 1e-12));
        }
    }

    #[test]
    fn test_eigensolve_degenerate_pair() {
        // λ = {5, 5, 1}, minor axis along z.
        let t = sym(5.0, 0.0, 0.0, 5.0, 0.0, 1.0);
        let eig = eigensolve(&t);
        assert!(approx(eig.values[0], 5.0, 1e-9));
        assert!(approx(eig.values[1], 5.0, 1e-9));
        assert!(approx(eig.values[2], 1.0, 1e-9));
        assert_eigenpair(&t, 1.0, &eig.vectors[2]);
    }

    #[test]
    fn test_eigenvectors_orthonormal() {
        let t = sym(1.0, 0.3, -0.2, 2.0, 0.4, 0.5);
        let eig = eigensolve(&t);
        for i in 0..3 {
            assert!(approx(vec_norm(&eig.vectors[i]), 1.0, 1e-9));
            for j in (i + 1)..3 {
                assert!(approx(vec_dot(&eig.vectors[i], &eig.vectors[j]), 0.0, 1e-9));
            }
        }
    }

    // ==================== Invariant gradients ====================

    #[test]
    fn test_gradient_norms() {
        let t = sym(2.0, 1.0, 0.5, 3.0, -0.5, 1.5);
        let g = invariant_gradients(&t);
        assert!(approx(sym_norm(&g.mean), 1.0, 1e-12));
        assert!(approx(sym_norm(&g.variance), 1.0, 1e-12));
        assert!(approx(sym_norm(&g.skew), 1.0, 1e-9));
    }

    #[test]
    fn test_gradients_mutually_orthogonal() {
        // The deviator is trace-free, so both higher gradients are
        // orthogonal to the mean gradient; skew is scale-free, so its
        // gradient is orthogonal to the variance direction.
        let t = sym(2.0, 1.0, 0.5, 3.0, -0.5, 1.5);
        let g = invariant_gradients(&t);
        assert!(approx(sym_dot(&g.mean, &g.variance), 0.0, 1e-9));
        assert!(approx(sym_dot(&g.mean, &g.skew), 0.0, 1e-9));
        assert!(approx(sym_dot(&g.variance, &g.skew), 0.0, 1e-9));
    }

    #[test]
    fn test_gradient_directional_derivative() {
        // <grad, dT> must match the finite-difference change of the
        // (unnormalized) invariants along dT.
        let t = sym(2.0, 1.0, 0.5, 3.0, -0.5, 1.5);
        let dt = sym(0.3, -0.1, 0.2, 0.1, 0.4, -0.2);
        let eps = 1e-6;

        let mu2 = |t: &Sym3<f64>| {
            let m = trace(t) / 3.0;
            let dev = sym_shift(t, m);
            sym_dot(&dev, &dev) / 3.0
        };

        let mut t2 = t;
        for i in 0..6 {
            t2[i] += eps * dt[i];
        }
        let numeric = (mu2(&t2) - mu2(&t)) / eps;

        let m = trace(&t) / 3.0;
        let dev = sym_shift(&t, m);
        let grad_mu2 = sym_scale(&dev, 2.0 / 3.0);
        let analytic = sym_dot(&grad_mu2, &dt);
        assert!(
            approx(numeric, analytic, 1e-4),
            "numeric {numeric} vs analytic {analytic}"
        );
    }

    #[test]
    fn test_isotropic_tensor_degenerate_gradients() {
        let t = sym(2.0, 0.0, 0.0, 2.0, 0.0, 2.0);
        let g = invariant_gradients(&t);
        assert!(approx(sym_norm(&g.mean), 1.0, 1e-12));
        assert_eq!(g.variance, [0.0; 6]);
        assert_eq!(g.skew, [0.0; 6]);
    }

    // ==================== Rotation tangents ====================

    #[test]
    fn test_rotation_tangents_unit_norm() {
        let t = sym(2.0, 1.0, 0.5, 3.0, -0.5, 1.5);
        let eig = eigensolve(&t);
        for phi in rotation_tangents(&eig.vectors) {
            assert!(approx(sym_norm(&phi), 1.0, 1e-9));
        }
    }

    #[test]
    fn test_rotation_tangents_orthogonal_to_invariant_gradients() {
        // Rotations leave eigenvalues fixed, so tangents are orthogonal to
        // every invariant gradient.
        let t = sym(2.0, 1.0, 0.5, 3.0, -0.5, 1.5);
        let eig = eigensolve(&t);
        let g = invariant_gradients(&t);
        for phi in rotation_tangents(&eig.vectors) {
            assert!(approx(sym_dot(&phi, &g.mean), 0.0, 1e-8));
            assert!(approx(sym_dot(&phi, &g.variance), 0.0, 1e-8));
            assert!(approx(sym_dot(&phi, &g.skew), 0.0, 1e-8));
        }
    }

    // ==================== Outer products ====================

    #[test]
    fn test_principal_outer_projects() {
        let e = [0.6, 0.8, 0.0];
        let r = principal_outer(&e);
        // R v = (e . v) e
        let v = [1.0, 2.0, 3.0];
        let rv = apply(&r, &v);
        let d = vec_dot(&e, &v);
        for i in 0..3 {
            assert!(approx(rv[i], d * e[i], 1e-12));
        }
    }
}
