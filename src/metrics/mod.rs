//! Lock-free metrics: rolling counts, latency histograms and the recorder
//! that lets writers and snapshot readers share them.

pub mod counts;
pub mod histogram;
pub mod latency;
pub mod recorder;
pub mod rolling;

pub use counts::{CountAccumulator, RollingCounts, TotalCounts};
pub use histogram::AtomicHistogram;
pub use latency::{IntervalLatency, LatencyCapture, LatencySnapshot, RollingLatency};
pub use recorder::{Recorder, Resettable};
pub use rolling::{RollingConfig, RollingWindow, WindowInterval};
