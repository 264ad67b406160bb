pub mod processor;
pub mod scheduler;
pub mod window;

pub use processor::{OrderIntent, OrderProcessor, PositionCache};
pub use scheduler::PositionScheduler;
pub use window::{classify, CloseReason, PnlWindow, WindowDecision};
