//! Cross-configuration correctness check of the forward kernel

use tracing::debug;

use crate::backends::{EmbeddingBackend, OutputTensor};
use crate::config::Precision;
use crate::error::{BenchError, Result};
use crate::sweep::{KernelConfig, Operation};

/// Mixed tolerance `|actual - expected| <= atol + rtol * |expected|`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    /// Relative tolerance
    pub rtol: f32,
    /// Absolute tolerance
    pub atol: f32,
}

impl Tolerance {
    /// Tolerance for outputs computed from weights of `precision`
    #[must_use]
    pub const fn for_precision(precision: Precision) -> Self {
        match precision {
            Precision::Fp32 => Self {
                rtol: 1.0e-4,
                atol: 1.0e-4,
            },
            Precision::Fp16 => Self {
                rtol: 1.0e-2,
                atol: 1.0e-2,
            },
        }
    }

    /// Whether `actual` is close to `expected`; NaN is never close
    #[must_use]
    pub fn is_close(&self, expected: f32, actual: f32) -> bool {
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }

    /// First element of `actual` not close to `expected`
    #[must_use]
    pub fn first_mismatch(&self, expected: &[f32], actual: &[f32]) -> Option<usize> {
        expected
            .iter()
            .zip(actual)
            .position(|(&e, &a)| !self.is_close(e, a))
    }
}

/// Compare the forward output of every configuration in `grid` with the
/// baseline configuration `(1, false)`
///
/// Returns the baseline output.
///
/// # Errors
///
/// `OutputShapeMismatch` or `CorrectnessViolation` for the first offending
/// configuration, or any backend error.
pub fn verify_forward<B, I>(
    backend: &B,
    collection: &B::Collection,
    batch: &B::Batch,
    bag_size: usize,
    grid: I,
    tolerance: Tolerance,
) -> Result<B::Output>
where
    B: EmbeddingBackend,
    I: IntoIterator<Item = KernelConfig>,
{
    let baseline = KernelConfig::baseline();
    let y0 = backend.forward(
        collection,
        batch,
        bag_size,
        baseline.block_size,
        baseline.shared_memory(),
    )?;
    let expected = backend.to_host(&y0)?;

    for config in grid {
        let y = backend.forward(
            collection,
            batch,
            bag_size,
            config.block_size,
            config.shared_memory(),
        )?;
        let actual = backend.to_host(&y)?;
        check_output(config, &expected, &actual, tolerance)?;
        debug!("forward {config} matches baseline");
    }
    Ok(y0)
}

fn check_output(
    config: KernelConfig,
    expected: &OutputTensor,
    actual: &OutputTensor,
    tolerance: Tolerance,
) -> Result<()> {
    if expected.shape() != actual.shape() {
        return Err(BenchError::OutputShapeMismatch {
            config,
            expected: expected.shape(),
            actual: actual.shape(),
        });
    }
    match tolerance.first_mismatch(expected.data(), actual.data()) {
        Some(index) => Err(BenchError::CorrectnessViolation {
            operation: Operation::Forward,
            config,
            index,
            expected: expected.data()[index],
            actual: actual.data()[index],
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerance_values() {
        let fp32 = Tolerance::for_precision(Precision::Fp32);
        assert_eq!(fp32.atol, 1e-4);
        assert_eq!(fp32.rtol, 1e-4);
        let fp16 = Tolerance::for_precision(Precision::Fp16);
        assert_eq!(fp16.atol, 1e-2);
        assert_eq!(fp16.rtol, 1e-2);
    }

    #[test]
    fn test_is_close_mixed_bound() {
        let tol = Tolerance::for_precision(Precision::Fp32);
        assert!(tol.is_close(0.0, 5e-5));
        assert!(!tol.is_close(0.0, 2e-4));
        // Relative part dominates for large values
        assert!(tol.is_close(1000.0, 1000.05));
        assert!(!tol.is_close(1000.0, 1000.2));
    }

    #[test]
    fn test_nan_never_matches() {
        let tol = Tolerance::for_precision(Precision::Fp16);
        assert!(!tol.is_close(1.0, f32::NAN));
        assert!(!tol.is_close(f32::NAN, 1.0));
        assert!(!tol.is_close(f32::NAN, f32::NAN));
    }

    #[test]
    fn test_first_mismatch() {
        let tol = Tolerance::for_precision(Precision::Fp32);
        assert_eq!(tol.first_mismatch(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]), None);
        assert_eq!(tol.first_mismatch(&[1.0, 2.0, 3.0], &[1.0, 2.5, 3.5]), Some(1));
    }

    #[test]
    fn test_check_output_shape_mismatch() {
        let config = KernelConfig::new(4, true);
        let expected = OutputTensor::zeros([4, 2, 8]);
        let actual = OutputTensor::zeros([4, 2, 4]);
        let err = check_output(
            config,
            &expected,
            &actual,
            Tolerance::for_precision(Precision::Fp32),
        )
        .unwrap_err();
        assert_eq!(
            err,
            BenchError::OutputShapeMismatch {
                config,
                expected: [4, 2, 8],
                actual: [4, 2, 4],
            }
        );
    }

    #[test]
    fn test_check_output_reports_first_element() {
        let config = KernelConfig::new(2, false);
        let expected = OutputTensor::new([1, 1, 4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let actual = OutputTensor::new([1, 1, 4], vec![1.0, 2.0, 9.0, 8.0]).unwrap();
        let err = check_output(
            config,
            &expected,
            &actual,
            Tolerance::for_precision(Precision::Fp32),
        )
        .unwrap_err();
        assert_eq!(
            err,
            BenchError::CorrectnessViolation {
                operation: Operation::Forward,
                config,
                index: 2,
                expected: 3.0,
                actual: 9.0,
            }
        );
    }
}
