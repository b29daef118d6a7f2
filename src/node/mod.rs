mod builder;
mod handle;
mod peer;
mod peer_status;

pub use builder::*;
pub use handle::*;
pub use peer::*;
pub use peer_status::*;
