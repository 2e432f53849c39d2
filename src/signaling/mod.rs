mod handler;
mod registry;
mod server;

pub use handler::SignalingHandler;
pub use registry::{
    CloseReason, ClosedRoom, CreateDisposition, CreateOutcome, DisconnectInfo, JoinOutcome,
    LeaveOutcome, Room, RoomPolicy, RoomRegistry, RoomStats, Route,
};
pub use server::{Outbound, SignalingServer};
