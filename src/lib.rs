//! Anisotropic-Diffusion Volume Filtering
//!
//! Pure Rust implementation of explicit (Jacobi-style) PDE-based filtering
//! for 3D scalar and symmetric-tensor voxel fields. A fixed pool of OS
//! threads runs a two-phase filter/update cycle per iteration, synchronized
//! by barriers and fed by dynamic per-slice work distribution; deltas are
//! double-buffered so results are identical for any thread count.
//!
//! ## Example
//!
//! ```
//! use anisodiff::{diffuse, DiffusionConfig, Method, Volume};
//! use ndarray::{ArrayD, IxDyn};
//!
//! let data = ArrayD::<f32>::zeros(IxDyn(&[8, 8, 8]));
//! let input = Volume::new(data).unwrap();
//! let config = DiffusionConfig {
//!     method: Method::Homogeneous,
//!     parameters: vec![0.1],
//!     ..DiffusionConfig::default()
//! };
//! let filtered = diffuse(&input, &config, 4).unwrap();
//! assert_eq!(filtered.shape(), input.shape());
//! ```

mod buffer;
mod engine;
mod error;
mod float_trait;
mod method;
mod neighborhood;
mod scalar;
mod tensor;
mod tensor_math;
mod volume;

// Re-export the public surface at the crate root
pub use engine::{diffuse, DiffusionConfig, DiffusionContext};
pub use error::{CapabilityWarning, ConfigError, DiffusionError, ResourceError};
pub use float_trait::DiffusionFloat;
pub use method::{Kind, Method, MAX_PARAMETERS, TENSOR_COMPONENTS};
pub use volume::Volume;
