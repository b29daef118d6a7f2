mod election;
mod event;
mod follower;
mod leader;
mod types;

pub use election::*;
pub(crate) use event::*;
pub use follower::*;
pub use leader::*;
pub use types::*;
