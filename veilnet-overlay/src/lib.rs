//! The overlay router (component E): 256-bit XOR-distance node
//! identifiers, k-buckets, iterative `FIND_NODE`, and background peer
//! health checks.

pub mod bucket;
pub mod error;
pub mod health;
pub mod kademlia;
pub mod node_id;
pub mod record;
pub mod table;

pub use bucket::{Bucket, Observation, K};
pub use error::OverlayError;
pub use health::{spawn_health_task, sweep_once};
pub use kademlia::{iterative_find_node, FindNodeRpc, ALPHA};
pub use node_id::{bucket_index, highest_set_bit, xor_distance, NodeId};
pub use record::PeerRecord;
pub use table::{LivenessCheck, RoutingTable};
