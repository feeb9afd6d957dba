mod connection;
mod dispatch;
mod reply;

pub use connection::{run_session, ConnContext, ConnShared, Phase, ShutdownCb, ShutdownHandle};
pub use dispatch::{CommandFrame, DispatchState, Frame, McFrame, PubFrame, QUEUE_SOFT_CAP};
pub use reply::ReplyBuilder;
