//! Debug and validation utilities
//!
//! Tools for checking the implementation against the Python reference:
//! - NPY golden data loading
//! - Output comparison with tolerance
//! - Parameter statistics and NaN/Inf sweeps

mod diagnostics;
mod npy_loader;
mod validator;

pub use diagnostics::{tensor_stats, TensorStats};
pub use npy_loader::{read_npy, read_npy_f32, read_npy_i64, NpyArray};
pub use validator::{CheckReport, ReferenceChecker, Tolerance};
