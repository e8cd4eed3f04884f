//! Voxel volumes: ndarray storage plus per-axis spacing metadata.
//!
//! A [`Volume`] is the engine's external data surface. Scalar volumes have
//! shape `[sx, sy, sz]`; tensor volumes carry a leading component axis,
//! `[7, sx, sy, sz]`, with component 0 the confidence slot and components
//! 1..=6 the symmetric tensor entries (xx, xy, xz, yy, yz, zz). The spatial
//! axes are ordered (x, y, z) throughout.

use ndarray::ArrayD;

use crate::error::ConfigError;
use crate::float_trait::DiffusionFloat;
use crate::method::{Kind, TENSOR_COMPONENTS};

/// A scalar or tensor voxel field with optional per-axis spacing.
#[derive(Debug, Clone)]
pub struct Volume<F> {
    data: ArrayD<F>,
    spacing: [Option<f64>; 3],
}

impl<F: DiffusionFloat> Volume<F> {
    /// Wrap an array as a volume with no spacing metadata.
    ///
    /// The array must have 3 axes (scalar data) or 4 axes with a leading
    /// extent of 7 (tensor data), and no spatial axis may be empty.
    pub fn new(data: ArrayD<F>) -> Result<Self, ConfigError> {
        Self::with_spacing(data, [None; 3])
    }

    /// Wrap an array as a volume, attaching spacing to the spatial axes.
    pub fn with_spacing(data: ArrayD<F>, spacing: [Option<f64>; 3]) -> Result<Self, ConfigError> {
        let shape = data.shape();
        let spatial = match shape.len() {
            3 => &shape[..],
            4 => {
                if shape[0] != TENSOR_COMPONENTS {
                    return Err(ConfigError::ComponentExtent {
                        expected: TENSOR_COMPONENTS,
                        actual: shape[0],
                    });
                }
                &shape[1..]
            }
            n => {
                // Neither layout fits; report against the scalar expectation.
                return Err(ConfigError::AxisCount {
                    kind: if n > 3 { Kind::Tensor } else { Kind::Scalar },
                    expected: if n > 3 { 4 } else { 3 },
                    actual: n,
                });
            }
        };
        for (axis, &extent) in spatial.iter().enumerate() {
            if extent == 0 {
                return Err(ConfigError::EmptyAxis {
                    axis: axis + shape.len() - 3,
                });
            }
        }
        Ok(Self { data, spacing })
    }

    /// The value layout implied by the axis count.
    pub fn kind(&self) -> Kind {
        if self.data.ndim() == 4 {
            Kind::Tensor
        } else {
            Kind::Scalar
        }
    }

    /// Components per voxel (1 or 7).
    pub fn val_len(&self) -> usize {
        self.kind().val_len()
    }

    /// Spatial extents as (sx, sy, sz).
    pub fn spatial_shape(&self) -> [usize; 3] {
        let shape = self.data.shape();
        let s = &shape[shape.len() - 3..];
        [s[0], s[1], s[2]]
    }

    /// Full shape including the component axis if present.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Raw array storage.
    pub fn data(&self) -> &ArrayD<F> {
        &self.data
    }

    /// Per-spatial-axis spacing metadata.
    pub fn spacing(&self) -> [Option<f64>; 3] {
        self.spacing
    }

    /// Resolve the spacing metadata into concrete per-axis step sizes.
    ///
    /// All-or-nothing: spacing on some but not all axes is an error. Absent
    /// spacing resolves to unit steps; the `assumed_unit` flag tells the
    /// caller to record the capability warning.
    pub(crate) fn derive_spacing(&self) -> Result<([f64; 3], bool), ConfigError> {
        let present = self.spacing.iter().filter(|s| s.is_some()).count();
        match present {
            0 => Ok(([1.0; 3], true)),
            3 => {
                let mut out = [0.0; 3];
                for (axis, slot) in self.spacing.iter().enumerate() {
                    let value = slot.unwrap_or(1.0);
                    if !value.is_finite() || value == 0.0 {
                        return Err(ConfigError::InvalidSpacing { axis, value });
                    }
                    out[axis] = value;
                }
                Ok((out, false))
            }
            _ => Err(ConfigError::PartialSpacing { present }),
        }
    }
}
