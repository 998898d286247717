pub mod reconciler;
pub mod tracker;

pub use reconciler::StuckJobReconciler;
pub use tracker::JobProgressTracker;
