pub mod codec;
pub mod frame;
pub mod health;
pub mod heartbeat;
pub mod reconnect;
pub mod topic;
pub mod types;
pub mod window;

pub use codec::*;
pub use frame::*;
pub use health::*;
pub use heartbeat::*;
pub use reconnect::*;
pub use topic::*;
pub use types::*;
pub use window::*;
