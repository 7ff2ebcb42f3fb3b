pub mod controller;
pub mod memory;
pub mod result_set;
pub mod traits;
pub mod watermark;

pub use controller::{BackfillOutcome, ControllerConfig, SyncController};
pub use memory::{MemorySink, MemorySource};
pub use result_set::{BackfillSource, ResultSetKey, ResultSetStore};
pub use traits::{Sink, Source, Subscription};
pub use watermark::{Watermark, WatermarkKind};
