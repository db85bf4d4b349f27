//! Stream consumption: the cancellable packet FIFO, the per-turn fold and
//! the minimum-display smoothing for transient states

pub mod fifo;
pub mod processor;
pub mod timing;

pub use fifo::{FifoItem, PacketFifo};
pub use processor::{FoldEffects, ProcessResult, TurnProcessor};
pub use timing::{defer_transition, DisplayHold};
