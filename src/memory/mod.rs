//! Tensor memory hierarchy: buffer pool, RAM/disk swap, persistent weight
//! store, and scoped release.

pub mod format;
pub mod pool;
pub mod scope;
pub mod store;
pub mod swap;
pub mod watchdog;

pub use pool::{PooledTensor, Release, TensorPool};
pub use scope::Scope;
pub use store::PersistentStore;
pub use swap::{SwapStore, SwapTier};
pub use watchdog::MemoryWatchdog;

/// Directory (under the work dir) holding persistent weight sessions.
pub const TENSOR_CACHE_DIR: &str = "TensorCache";
/// Directory (under the work dir) holding disk-tier swap sessions.
pub const SWAP_DIR: &str = "Swap";
/// Directory (under the work dir) holding serialized batch sessions.
pub const BATCH_DIR: &str = "Batches";

/// Makes a label safe to embed in a file name.
pub fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "tensor".to_string()
    } else {
        cleaned
    }
}

/// Session ids sort by creation time and carry a random suffix.
pub fn new_session_id() -> String {
    format!(
        "{}_{:08x}",
        chrono::Utc::now().format("%Y%m%d%H%M%S"),
        rand::random::<u32>()
    )
}
