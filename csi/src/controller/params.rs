//! StorageClass parameters, topology and capability checks.

use std::collections::HashMap;

use tonic::{Code, Status};
use upcloud::StorageTier;

use crate::{
    csi::{
        volume_capability::{self, access_mode::Mode},
        TopologyRequirement,
        VolumeCapability,
    },
    SUPPORTED_ACCESS_MODE,
    TOPOLOGY_REGION_KEY,
};

pub const PARAMETER_TIER: &str = "tier";
pub const PARAMETER_ENCRYPTION: &str = "encryption";
pub const ENCRYPTION_AT_REST: &str = "data-at-rest";

/// Storage tier requested by the parameters, `None` for the API default.
pub fn tier(
    parameters: &HashMap<String, String>,
) -> Result<Option<StorageTier>, Status> {
    match parameters.get(PARAMETER_TIER).map(String::as_str) {
        None | Some("") => Ok(None),
        Some("maxiops") => Ok(Some(StorageTier::Maxiops)),
        Some("hdd") => Ok(Some(StorageTier::Hdd)),
        Some(other) => Err(failure!(
            Code::InvalidArgument,
            "Storage tier {} is not supported",
            other
        )),
    }
}

pub fn encrypted(parameters: &HashMap<String, String>) -> bool {
    parameters.get(PARAMETER_ENCRYPTION).map(String::as_str)
        == Some(ENCRYPTION_AT_REST)
}

/// Reject requisite topologies naming a region other than `zone`.
pub fn check_topology(
    requirement: Option<&TopologyRequirement>,
    zone: &str,
) -> Result<(), Status> {
    let requirement = match requirement {
        Some(requirement) => requirement,
        None => return Ok(()),
    };
    for topology in &requirement.requisite {
        if let Some(region) = topology.segments.get(TOPOLOGY_REGION_KEY) {
            if region != zone {
                return Err(failure!(
                    Code::ResourceExhausted,
                    "Volume can not be provisioned in region {}, only {} is available",
                    region,
                    zone
                ));
            }
        }
    }
    Ok(())
}

/// Check every capability, reporting all problems at once.
pub fn check_volume_capabilities(
    capabilities: &[VolumeCapability],
) -> Result<(), Status> {
    if capabilities.is_empty() {
        return Err(failure!(
            Code::InvalidArgument,
            "Volume capabilities must be provided"
        ));
    }
    let violations = capability_violations(capabilities);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(failure!(
            Code::InvalidArgument,
            "Unsupported volume capabilities: {}",
            violations.join("; ")
        ))
    }
}

pub fn capability_violations(capabilities: &[VolumeCapability]) -> Vec<String> {
    let mut violations = Vec::new();
    for (i, capability) in capabilities.iter().enumerate() {
        match capability.access_mode.as_ref().map(|m| m.mode) {
            None => violations
                .push(format!("capability {}: access mode is missing", i)),
            Some(mode) if mode != SUPPORTED_ACCESS_MODE as i32 => {
                let name = Mode::from_i32(mode)
                    .map(|m| format!("{:?}", m))
                    .unwrap_or_else(|| mode.to_string());
                violations.push(format!(
                    "capability {}: access mode {} is not supported",
                    i, name
                ));
            }
            Some(_) => {}
        }
        if capability.access_type.is_none() {
            violations
                .push(format!("capability {}: access type is missing", i));
        }
    }
    violations
}

pub fn is_block(capability: Option<&VolumeCapability>) -> bool {
    matches!(
        capability.and_then(|c| c.access_type.as_ref()),
        Some(volume_capability::AccessType::Block(_))
    )
}
