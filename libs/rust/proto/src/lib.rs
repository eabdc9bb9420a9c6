// Generated protobuf modules via tonic's include_proto! macro.
// Usage:
//   use fedlink_proto::federation::federation_server::FederationServer;
//   use fedlink_proto::federation::{JoinRequest, ModelUpdate};

pub mod federation { tonic::include_proto!("fedlink.federation"); }

/// SHA-256 over every `.proto` file, computed at build time.
pub const SCHEMA_VERSION: &str = env!("PROTO_SCHEMA_VERSION");

pub use federation::*;
