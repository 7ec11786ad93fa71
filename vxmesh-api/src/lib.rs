//! Generated protobuf types for the vxmesh control plane.
//!
//! The schema lives in `proto/vxmesh.proto`; both the server and client
//! halves are generated so that `vxmeshd` can serve the control plane and
//! dial its peers with the same types.

/// Control plane service (`vxmesh.v1`).
pub mod proto {
    tonic::include_proto!("vxmesh.v1");
}

// Re-export tonic so integration tests link against matching versions.
pub use tonic;
