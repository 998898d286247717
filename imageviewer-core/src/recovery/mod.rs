pub mod dlq;

pub use dlq::{DlqRecovery, RecoveryStats};
