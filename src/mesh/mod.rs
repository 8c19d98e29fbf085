pub mod coordinator;
pub mod memory;
pub mod protocol;
pub mod transport;
pub mod webrtc;

pub use coordinator::{MeshConfig, MeshCoordinator, MeshEvent};
pub use protocol::{ChunkMeta, PeerMessage};
pub use transport::{LinkEvent, PeerState, TransportFactory, TransportLink};
pub use webrtc::WebRtcFactory;
