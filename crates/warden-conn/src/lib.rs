mod instrument;
mod pool;
mod shaping;
mod stats;

pub use instrument::InstrumentedStream;
pub use pool::{BufferPool, PooledBuffer, COPY_BUFFER_SIZE};
pub use shaping::{force_close_error, is_force_close, ForceCloseError};
pub use stats::{NoopTracker, StatsEntry, Tracker, VecTracker};
