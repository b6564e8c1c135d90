//! # Conveyor: speculative pipeline evaluation over a keyspace
//!
//! An ordered pipeline of key-indexed transforms is applied to an in-memory
//! map with optimistic parallelism: later stages run speculatively on the
//! current best-guess value for each key, and a generation-vector protocol
//! discards speculative results that an earlier stage invalidates.
//!
//! ## Quick Start
//!
//! ```rust
//! use conveyor::{MapOutcome, MapTransform, Run};
//!
//! fn main() -> Result<(), conveyor::PipelineError> {
//!     let mut run = Run::new();
//!     run.add_step(MapTransform::new(|_key: &String, value: &String| {
//!         MapOutcome::Value(value.to_uppercase())
//!     }))?;
//!     run.add_step(MapTransform::new(|_key: &String, value: &String| {
//!         MapOutcome::Value(format!("{value}!"))
//!     }))?;
//!
//!     let results = run.run_to_completion(
//!         [("greeting".to_string(), "hello".to_string())].into(),
//!     )?;
//!     assert_eq!(results["greeting"].value.as_deref(), Some("HELLO!"));
//!     Ok(())
//! }
//! ```
//!
//! Keys and values are opaque to the core: any `Eq + Hash + Clone` key and
//! any `PartialEq + Clone` value will do. Ordering between stages is decided
//! entirely by generation vectors ([`Gens`]), compared as tuples; the final
//! map is deterministic for deterministic transforms regardless of worker
//! count or scheduling order.

// Module declarations
pub mod config;
mod coordinator;
pub mod error;
pub mod generation;
pub mod metrics;
pub mod notify;
pub mod run;
mod stage;
pub mod transform;
mod worker;

// Re-exports for convenience
pub use config::{RunConfig, RunConfigBuilder};
pub use error::{PipelineError, Result};
pub use generation::Gens;
pub use metrics::{MetricsSnapshot, RunMetrics};
pub use notify::{Key, Notification, State, Value};
pub use run::{CancelHandle, Run};
pub use transform::{BatchOutput, MapOutcome, MapTransform, NullTransform, Transform};
