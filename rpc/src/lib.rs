//! Generated bindings for the Container Storage Interface (CSI) v1 gRPC
//! services. Only the Identity, Controller and Node services are compiled.

#[allow(clippy::large_enum_variant)]
#[allow(clippy::enum_variant_names)]
#[allow(clippy::derive_partial_eq_without_eq)]
pub mod csi {
    tonic::include_proto!("csi.v1");
}
