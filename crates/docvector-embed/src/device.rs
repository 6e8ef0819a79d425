use candle_core::Device;
use tracing::{info, warn};

/// Maps the configured device hint to a candle device. Unsupported or
/// unavailable accelerators fall back to the CPU.
pub fn select_device(hint: &str) -> Device {
    match hint.to_ascii_lowercase().as_str() {
        "cpu" => {}
        "metal" | "mps" | "gpu" => {
            #[cfg(feature = "metal")]
            {
                if let Ok(dev) = Device::new_metal(0) {
                    info!("embedding device: metal");
                    return dev;
                }
            }
            warn!(hint, "accelerator unavailable, using cpu");
        }
        other => warn!(hint = other, "unknown device hint, using cpu"),
    }
    info!("embedding device: cpu");
    Device::Cpu
}
