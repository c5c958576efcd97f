use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tonic::{Code, Request, Response, Status};

use crate::{
    context::traced,
    csi::{
        plugin_capability::{self, service, volume_expansion},
        GetPluginCapabilitiesRequest,
        GetPluginCapabilitiesResponse,
        GetPluginInfoRequest,
        GetPluginInfoResponse,
        PluginCapability,
        ProbeRequest,
        ProbeResponse,
    },
};

/// Readiness of the plugin, set once startup has completed and cleared on
/// shutdown.
#[derive(Clone, Debug, Default)]
pub struct Readiness(Arc<Mutex<bool>>);

impl Readiness {
    pub fn set_ready(&self, ready: bool) {
        *self.0.lock() = ready;
    }

    pub fn is_ready(&self) -> bool {
        *self.0.lock()
    }
}

#[derive(Debug, Clone)]
pub struct Identity {
    name: String,
    version: String,
    readiness: Readiness,
}

impl Identity {
    pub fn new(name: &str, readiness: Readiness) -> Self {
        Self {
            name: name.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            readiness,
        }
    }
}

fn service_capability(kind: service::Type) -> PluginCapability {
    PluginCapability {
        r#type: Some(plugin_capability::Type::Service(
            plugin_capability::Service {
                r#type: kind as i32,
            },
        )),
    }
}

#[tonic::async_trait]
impl rpc::csi::identity_server::Identity for Identity {
    async fn get_plugin_info(
        &self,
        request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        traced("GetPluginInfo", request, |_, _| async move {
            if self.name.is_empty() {
                return Err(failure!(
                    Code::Unavailable,
                    "Driver name is not configured"
                ));
            }
            Ok(GetPluginInfoResponse {
                name: self.name.clone(),
                vendor_version: self.version.clone(),
                manifest: HashMap::new(),
            })
        })
        .await
    }

    async fn get_plugin_capabilities(
        &self,
        request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        traced("GetPluginCapabilities", request, |_, _| async move {
            Ok(GetPluginCapabilitiesResponse {
                capabilities: vec![
                    service_capability(service::Type::ControllerService),
                    service_capability(
                        service::Type::VolumeAccessibilityConstraints,
                    ),
                    PluginCapability {
                        r#type: Some(plugin_capability::Type::VolumeExpansion(
                            plugin_capability::VolumeExpansion {
                                r#type: volume_expansion::Type::Offline as i32,
                            },
                        )),
                    },
                ],
            })
        })
        .await
    }

    async fn probe(
        &self,
        request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        traced("Probe", request, |_, _| async move {
            Ok(ProbeResponse {
                ready: Some(self.readiness.is_ready()),
            })
        })
        .await
    }
}
