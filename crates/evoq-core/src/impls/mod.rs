//! Impls - concrete ports.
//!
//! - **LocalQueue**: in-process queue and result store (tests, offline runs)
//! - **RedisQueue**: Redis Streams queue and result hash (production)
//! - **FileResultStore**: one JSON file per result
//! - **InProcessLauncher** / **ProcessLauncher**: how the spawner starts workers

pub mod file_store;
pub mod in_process_launcher;
pub mod local_queue;
pub mod process_launcher;
pub mod redis_queue;

pub use self::file_store::FileResultStore;
pub use self::in_process_launcher::InProcessLauncher;
pub use self::local_queue::LocalQueue;
pub use self::process_launcher::ProcessLauncher;
pub use self::redis_queue::{RedisQueue, RedisQueueConfig};
