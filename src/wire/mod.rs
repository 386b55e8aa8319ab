pub mod codec;
pub mod packet_kind;
pub mod peer_id;
pub mod peer_kind;
