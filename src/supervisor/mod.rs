//! 账号生命周期监管

pub mod account;
pub mod manager;
pub mod status;

pub use account::{AccountSupervisor, SupervisorContext, SEND_CHANNEL_LOGIN_MSG_KEY};
pub use manager::{AccountSnapshot, SharedSupervisorManager, SupervisorManager};
pub use status::{AccountStatus, ConnectError, StatusHandle, SupervisorState};
