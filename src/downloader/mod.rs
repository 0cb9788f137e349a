pub mod admission;
pub mod listener;
pub mod progress;
pub mod queue;
pub mod recovery;
pub mod resolver;
pub mod worker;

pub use admission::{AdmissionController, MAX_CONCURRENT_KEY};
pub use listener::{is_qualifying, ChannelListener};
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use queue::{download_queue, MessageRef, QueueReceiver, QueueSender};
pub use recovery::RecoveryManager;
pub use resolver::{ChannelResolver, Resolution, DOWNLOAD_DIR_KEY};
pub use worker::DownloadWorker;
