mod cancel;
mod latch;
mod timeout;

pub use cancel::{Canceller, CancellerDropper, Waiter};
pub use latch::ReadyGate;
pub use timeout::{Timeout, TimeoutError, TimeoutService};
