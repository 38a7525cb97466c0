//! Device-event timing of a repeated operation

use tracing::debug;

use crate::backends::Stream;
use crate::error::{BenchError, Result};

/// Mean wall time per call of `op`, measured with stream events
///
/// One untimed warm-up call, then `iters` calls bracketed by two events with
/// no synchronization in between. The stream is synchronized before the
/// events are read.
///
/// # Errors
///
/// - `InvalidArgument` if `iters == 0`
/// - `DeviceExecution` if any enqueued work faulted
/// - `InvalidTiming` if the events report a non-positive interval
pub fn benchmark_fn<S, F>(stream: &S, iters: usize, mut op: F) -> Result<f64>
where
    S: Stream,
    F: FnMut() -> Result<()>,
{
    if iters == 0 {
        return Err(BenchError::InvalidArgument(
            "iters must be >= 1".to_string(),
        ));
    }

    op()?;
    stream.synchronize()?;

    let start = stream.record_event()?;
    for _ in 0..iters {
        op()?;
    }
    let end = stream.record_event()?;
    stream.synchronize()?;

    let elapsed = stream.elapsed(&start, &end)?;
    if elapsed.is_zero() {
        return Err(BenchError::InvalidTiming {
            elapsed_ns: elapsed.as_nanos(),
            iters,
        });
    }

    let per_iter = elapsed.as_secs_f64() / iters as f64;
    debug!(iters, per_iter_s = per_iter, "timed");
    Ok(per_iter)
}
