pub mod messages;
pub mod rooms;
pub mod scorer;
pub mod server;

pub use messages::{SignalEnvelope, SignalKind};
pub use rooms::RoomRegistry;
pub use scorer::PeerScorer;
pub use server::RelayServer;
