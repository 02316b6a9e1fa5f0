//! Sliding window statistics.
//!
//! [`LeapArray`] is the generic time-bucketed ring; [`MetricArray`] specialises
//! it for request counters and is what the nodes are built from.

mod bucket;
mod leap_array;
mod metric;

pub use bucket::MetricBucket;
pub use bucket::MetricEvent;
pub use bucket::MetricSnapshot;
pub use leap_array::BucketValue;
pub use leap_array::LeapArray;
pub use leap_array::Window;
pub use metric::MetricArray;
