//! Golden-data validation
//!
//! Compares model outputs against reference arrays exported by the Python
//! implementation. Comparisons use combined absolute/relative tolerance,
//! the same criterion as numpy's allclose.

use anyhow::{Context, Result};
use candle_core::Tensor;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::npy_loader::read_npy_f32;

/// Comparison tolerances
#[derive(Debug, Clone, Copy)]
pub struct Tolerance {
    /// Absolute tolerance
    pub atol: f32,
    /// Relative tolerance
    pub rtol: f32,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            atol: 1e-4,
            rtol: 1e-3,
        }
    }
}

impl Tolerance {
    /// True when `actual` is close enough to `expected`
    pub fn accepts(&self, expected: f32, actual: f32) -> bool {
        (expected - actual).abs() <= self.atol + self.rtol * expected.abs()
    }
}

/// Outcome of a single golden comparison
#[derive(Debug, Clone)]
pub struct CheckReport {
    /// Name of the compared quantity
    pub name: String,
    /// Whether the comparison passed
    pub passed: bool,
    /// Largest absolute difference seen
    pub max_abs_diff: f32,
    /// Number of elements outside tolerance
    pub mismatches: usize,
    /// Total elements compared
    pub total: usize,
    /// Failure detail, if any
    pub detail: Option<String>,
}

impl CheckReport {
    fn failed(name: &str, detail: String) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            max_abs_diff: f32::NAN,
            mismatches: 0,
            total: 0,
            detail: Some(detail),
        }
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        if self.passed {
            format!(
                "[PASS] {} ({} elems, max_abs_diff={:.2e})",
                self.name, self.total, self.max_abs_diff
            )
        } else if let Some(detail) = &self.detail {
            format!("[FAIL] {}: {}", self.name, detail)
        } else {
            format!(
                "[FAIL] {}: {}/{} elements out of tolerance (max_abs_diff={:.2e})",
                self.name, self.mismatches, self.total, self.max_abs_diff
            )
        }
    }
}

/// Checks model outputs against a directory of golden .npy files
///
/// Each named check loads `<golden_dir>/<name>.npy` and compares
/// elementwise. Reports accumulate so a run can finish before failing.
pub struct ReferenceChecker {
    golden_dir: PathBuf,
    tolerance: Tolerance,
    reports: Vec<CheckReport>,
}

impl ReferenceChecker {
    /// Checker over a golden data directory with default tolerances
    pub fn new<P: AsRef<Path>>(golden_dir: P) -> Self {
        Self::with_tolerance(golden_dir, Tolerance::default())
    }

    /// Checker with explicit tolerances
    pub fn with_tolerance<P: AsRef<Path>>(golden_dir: P, tolerance: Tolerance) -> Self {
        Self {
            golden_dir: golden_dir.as_ref().to_path_buf(),
            tolerance,
            reports: Vec::new(),
        }
    }

    fn compare(&self, name: &str, expected: &[f32], actual: &[f32]) -> CheckReport {
        let mut max_abs_diff = 0.0f32;
        let mut mismatches = 0;
        for (&e, &a) in expected.iter().zip(actual.iter()) {
            max_abs_diff = max_abs_diff.max((e - a).abs());
            if !self.tolerance.accepts(e, a) {
                mismatches += 1;
            }
        }
        CheckReport {
            name: name.to_string(),
            passed: mismatches == 0,
            max_abs_diff,
            mismatches,
            total: expected.len(),
            detail: None,
        }
    }

    /// Compare a tensor against `<name>.npy`
    pub fn check_tensor(&mut self, name: &str, actual: &Tensor) -> Result<&CheckReport> {
        let path = self.golden_dir.join(format!("{name}.npy"));
        let report = match read_npy_f32(&path)
            .with_context(|| format!("Failed to load golden data for {name}"))
        {
            Err(err) => CheckReport::failed(name, format!("{err:#}")),
            Ok((expected, shape)) => {
                if shape != actual.dims() {
                    CheckReport::failed(
                        name,
                        format!("shape mismatch: golden {:?}, actual {:?}", shape, actual.dims()),
                    )
                } else {
                    let values: Vec<f32> = actual.flatten_all()?.to_vec1()?;
                    self.compare(name, &expected, &values)
                }
            }
        };
        self.reports.push(report);
        Ok(self.reports.last().unwrap())
    }

    /// Compare a scalar against a single-element `<name>.npy`
    pub fn check_scalar(&mut self, name: &str, actual: f32) -> Result<&CheckReport> {
        let path = self.golden_dir.join(format!("{name}.npy"));
        let report = match read_npy_f32(&path)
            .with_context(|| format!("Failed to load golden data for {name}"))
        {
            Err(err) => CheckReport::failed(name, format!("{err:#}")),
            Ok((expected, _)) if expected.len() != 1 => {
                CheckReport::failed(name, format!("expected a scalar, got {} values", expected.len()))
            }
            Ok((expected, _)) => self.compare(name, &expected, &[actual]),
        };
        self.reports.push(report);
        Ok(self.reports.last().unwrap())
    }

    /// All reports so far
    pub fn reports(&self) -> &[CheckReport] {
        &self.reports
    }

    /// True when every check passed
    pub fn all_passed(&self) -> bool {
        self.reports.iter().all(|r| r.passed)
    }

    /// Log every report and return whether the run passed
    pub fn log_summary(&self) -> bool {
        let passed = self.reports.iter().filter(|r| r.passed).count();
        for report in &self.reports {
            if report.passed {
                info!("{}", report.summary());
            } else {
                warn!("{}", report.summary());
            }
        }
        info!("{}/{} golden checks passed", passed, self.reports.len());
        passed == self.reports.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::fs::File;
    use std::io::Write;

    fn write_npy_f32(path: &Path, shape: &[usize], values: &[f32]) {
        let shape_text = match shape.len() {
            1 => format!("({},)", shape[0]),
            _ => format!(
                "({})",
                shape
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };
        let mut header =
            format!("{{'descr': '<f4', 'fortran_order': False, 'shape': {shape_text}, }}");
        while (10 + header.len() + 1) % 64 != 0 {
            header.push(' ');
        }
        header.push('\n');
        let mut file = File::create(path).unwrap();
        file.write_all(b"\x93NUMPY\x01\x00").unwrap();
        file.write_all(&(header.len() as u16).to_le_bytes()).unwrap();
        file.write_all(header.as_bytes()).unwrap();
        for v in values {
            file.write_all(&v.to_le_bytes()).unwrap();
        }
    }

    #[test]
    fn test_tolerance_combined_criterion() {
        let tol = Tolerance::default();
        assert!(tol.accepts(100.0, 100.05));
        assert!(!tol.accepts(100.0, 101.0));
        assert!(tol.accepts(0.0, 5e-5));
        assert!(!tol.accepts(0.0, 5e-4));
    }

    #[test]
    fn test_check_tensor_passes_on_match() {
        let dir = tempfile::tempdir().unwrap();
        write_npy_f32(&dir.path().join("logits.npy"), &[2, 2], &[1.0, 2.0, 3.0, 4.0]);

        let mut checker = ReferenceChecker::new(dir.path());
        let actual = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.00001]], &Device::Cpu).unwrap();
        let report = checker.check_tensor("logits", &actual).unwrap();
        assert!(report.passed, "{}", report.summary());
        assert!(checker.all_passed());
    }

    #[test]
    fn test_check_tensor_flags_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        write_npy_f32(&dir.path().join("logits.npy"), &[4], &[1.0, 2.0, 3.0, 4.0]);

        let mut checker = ReferenceChecker::new(dir.path());
        let actual = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        let report = checker.check_tensor("logits", &actual).unwrap();
        assert!(!report.passed);
        assert!(report.detail.as_ref().unwrap().contains("shape mismatch"));
    }

    #[test]
    fn test_check_scalar_out_of_tolerance() {
        let dir = tempfile::tempdir().unwrap();
        write_npy_f32(&dir.path().join("loss.npy"), &[1], &[2.0]);

        let mut checker = ReferenceChecker::new(dir.path());
        assert!(checker.check_scalar("loss", 2.00001).unwrap().passed);
        assert!(!checker.check_scalar("loss", 2.5).unwrap().passed);
        assert!(!checker.all_passed());
    }

    #[test]
    fn test_missing_golden_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut checker = ReferenceChecker::new(dir.path());
        let report = checker.check_scalar("absent", 1.0).unwrap();
        assert!(!report.passed);
    }
}
