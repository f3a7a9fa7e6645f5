//! Audio device enumeration.

use serde::{Deserialize, Serialize};

/// Metadata about an audio input or output device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default device for its direction.
    pub is_default: bool,
    /// Heuristic flag for inputs that capture the system output. Looping one
    /// of these with input monitoring on feeds the mix back into itself.
    pub is_loopback_like: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "virtual output",
    "monitor of",
    "mixage stereo",
    "mezcla estereo",
    "mix stereo",
];

/// Best-effort heuristic for loopback/system-output capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Which side of the duplex stream a device list is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// List all available audio input devices on the system, default first.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
pub fn list_input_devices() -> Vec<DeviceInfo> {
    list_devices(Direction::Input)
}

/// List all available audio output devices on the system, default first.
pub fn list_output_devices() -> Vec<DeviceInfo> {
    list_devices(Direction::Output)
}

#[cfg(feature = "audio-cpal")]
fn list_devices(direction: Direction) -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let (default_device, devices) = match direction {
        Direction::Input => (host.default_input_device(), host.input_devices()),
        Direction::Output => (host.default_output_device(), host.output_devices()),
    };
    let default_name = default_device.as_ref().and_then(|d| d.name().ok());

    match devices {
        Ok(devices) => {
            let names = devices.enumerate().map(|(idx, device)| {
                device
                    .name()
                    .unwrap_or_else(|_| format!("{direction:?} Device {}", idx + 1))
            });
            describe(names, default_name.as_deref(), direction)
        }
        Err(e) => {
            tracing::warn!("failed to enumerate {direction:?} devices: {e}");
            default_name
                .map(|name| describe([name.clone()], Some(&name), direction))
                .unwrap_or_default()
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
fn list_devices(_direction: Direction) -> Vec<DeviceInfo> {
    vec![]
}

fn describe(
    names: impl IntoIterator<Item = String>,
    default_name: Option<&str>,
    direction: Direction,
) -> Vec<DeviceInfo> {
    let mut list = names
        .into_iter()
        .map(|name| DeviceInfo {
            is_default: default_name == Some(name.as_str()),
            is_loopback_like: direction == Direction::Input && is_loopback_like_name(&name),
            name,
        })
        .collect::<Vec<_>>();
    list.sort_by_key(|d| (!d.is_default, d.is_loopback_like, d.name.to_ascii_lowercase()));
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("What U Hear (Sound Blaster)"));
        assert!(is_loopback_like_name("Monitor of Built-in Audio Analog Stereo"));
        assert!(!is_loopback_like_name("Scarlett 2i2 USB"));
    }

    #[test]
    fn default_device_sorts_first_and_outputs_are_never_loopback() {
        let names = ["Stereo Mix", "Zoom H4n", "Built-in Microphone"].map(String::from);
        let inputs = describe(names.clone(), Some("Built-in Microphone"), Direction::Input);
        assert_eq!(inputs[0].name, "Built-in Microphone");
        assert!(inputs[0].is_default);
        assert_eq!(inputs[2].name, "Stereo Mix");
        assert!(inputs[2].is_loopback_like);

        let outputs = describe(names, None, Direction::Output);
        assert!(outputs.iter().all(|d| !d.is_loopback_like && !d.is_default));
    }
}
