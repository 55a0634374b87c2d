//! Bulk load of every dataset into the write channel.

use tracing::info;

use crate::dataset::LocationDataset;
use crate::point::build_points;
use crate::writer::{WriteError, WriteHandle};

/// Submit the points of every dataset, in dataset order and then
/// observation order.
///
/// Submission never waits for the store; write outcomes are tracked by the
/// writer. Returns the number of points submitted.
///
/// # Errors
///
/// Returns `WriteError::Closed` if the writer was closed before loading
/// finished.
pub fn load_all(datasets: &[LocationDataset], writer: &WriteHandle) -> Result<usize, WriteError> {
    let mut total = 0;

    for dataset in datasets {
        let points = build_points(dataset);
        let count = points.len();

        for point in points {
            writer.submit(point)?;
        }

        info!(location = %dataset.site, points = count, "Submitted dataset");
        total += count;
    }

    info!(datasets = datasets.len(), points = total, "Finished submitting tide points");
    Ok(total)
}
