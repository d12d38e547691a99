//! Tick ingestion: normalization, statistical pre-screen and the batching
//! buffer that feeds the analysis cycle.

pub mod buffer;
pub mod normalize;
pub mod prescreen;

pub use buffer::{BatchBuffer, BufferConfig, BufferEvent, FlushReason};
pub use normalize::{normalize_all, normalize_tick};
pub use prescreen::{pre_screen, Classification, PreScreenConfig, ScoredTick};
