pub mod atomic;
pub mod hash;
pub mod lock;
pub mod retry;

pub use atomic::AtomicWriter;
pub use hash::{bytes_md5, file_md5, sanitize_file_id};
pub use lock::LockFile;
pub use retry::{retry_with_backoff, BreakerState, CircuitBreaker, RetryConfig};
