//! Bonjour/mDNS advertisement. Publishes a `_porby._tcp` record bound to
//! the ready listener so viewers on the local network can discover the SDK
//! without knowing the port.

use mdns_sd::{ServiceDaemon, ServiceInfo};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::TransportConfig;
use crate::event::{AppInfo, DeviceInfo, SDK_VERSION};

pub const SERVICE_TYPE: &str = "_porby._tcp.local.";

#[derive(Debug, Error)]
pub enum AdvertiserError {
  #[error("mdns advertise failed: {0}")]
  Mdns(#[from] mdns_sd::Error),
}

pub struct BonjourAdvertiser {
  daemon: ServiceDaemon,
  fullname: String,
}

impl BonjourAdvertiser {
  /// Publishes the service record for the listener bound on `port`.
  pub fn start(
    transport: &TransportConfig,
    device: &DeviceInfo,
    app: &AppInfo,
    port: u16,
  ) -> Result<Self, AdvertiserError> {
    let daemon = ServiceDaemon::new()?;

    let instance_name = transport
      .service_name
      .clone()
      .unwrap_or_else(|| device.name.clone());

    let mut txt: Vec<(String, String)> = vec![
      ("device_name".to_string(), device.name.clone()),
      ("sdk_version".to_string(), SDK_VERSION.to_string()),
      ("protocol".to_string(), "1".to_string()),
      (
        "pairing_required".to_string(),
        transport.requires_pairing.to_string(),
      ),
    ];
    if transport.advertise_app_name {
      txt.push(("app_name".to_string(), app.name.clone()));
      txt.push(("app_version".to_string(), app.version.clone()));
    }
    let txt: Vec<(&str, &str)> = txt.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

    let host = format!("{}.local.", device.name.replace(' ', "-"));
    let service = ServiceInfo::new(SERVICE_TYPE, &instance_name, &host, "", port, &txt[..])?
      .enable_addr_auto();
    let fullname = service.get_fullname().to_string();
    daemon.register(service)?;

    info!(name = %instance_name, port, "advertising service");
    Ok(Self { daemon, fullname })
  }

  /// Withdraws the record and shuts the responder down.
  pub fn stop(self) {
    if let Err(err) = self.daemon.unregister(&self.fullname) {
      warn!(error = %err, "failed to unregister service record");
    }
    let _ = self.daemon.shutdown();
  }
}
