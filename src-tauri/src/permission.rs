use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// Asked once per recording attempt. No retries: a denial is final until the
/// user changes it in the OS.
pub trait MicrophoneAccess: Send + Sync {
    fn request(&self) -> PermissionStatus;
}

#[cfg(feature = "desktop")]
pub use cpal_gate::CpalMicrophone;

#[cfg(feature = "desktop")]
mod cpal_gate {
    use cpal::traits::{DeviceTrait, HostTrait};

    use super::{MicrophoneAccess, PermissionStatus};

    /// Desktop hosts surface a blocked microphone as a missing device or an
    /// unreadable configuration, so both count as a denial.
    pub struct CpalMicrophone;

    impl MicrophoneAccess for CpalMicrophone {
        fn request(&self) -> PermissionStatus {
            let host = cpal::default_host();
            let Some(device) = host.default_input_device() else {
                tracing::warn!("No default input device; treating microphone as denied");
                return PermissionStatus::Denied;
            };

            match device.default_input_config() {
                Ok(config) => {
                    tracing::debug!(
                        device = %device.name().unwrap_or_default(),
                        sample_rate = config.sample_rate().0,
                        channels = config.channels(),
                        "Microphone available"
                    );
                    PermissionStatus::Granted
                }
                Err(e) => {
                    tracing::warn!("Microphone config unavailable: {}", e);
                    PermissionStatus::Denied
                }
            }
        }
    }
}
