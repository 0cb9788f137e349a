//! 持久化模块
//!
//! 账号、频道、设置与下载任务记录统一保存在一个 SQLite 数据库中。
//! 这是各账号之间唯一共享的可变状态：全局并发计数、任务状态都通过它协调。
//!
//! ## 使用示例
//!
//! ```ignore
//! use crate::persistence::{NewTask, TaskStore};
//!
//! let store = TaskStore::open(Path::new("data/tg_download.db"))?;
//! let task_id = store.add_task(&new_task)?;
//! store.mark_downloading(task_id, now)?;
//! store.mark_completed(task_id, file_size, now)?;
//! ```

pub mod store;
pub mod types;

pub use store::TaskStore;
pub use types::{
    Account, Channel, ChannelWithAccount, NewTask, NotificationChannel, Task, TaskStatus,
};
