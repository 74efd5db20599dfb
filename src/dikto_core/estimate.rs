use std::path::Path;

use crate::dikto_core::media::DurationProber;
use crate::dikto_core::settings::Device;

/// Fallback processing-time estimate when the media probe fails. The queue
/// view still shows a best-effort position with this.
pub const PROBE_FAILURE_ESTIMATE_SECS: f64 = 60.0;

/// Zip bundles are not probed up front; they get a nominal estimate until the
/// worker has extracted and measured the individual tracks.
pub const ZIP_NOMINAL_ESTIMATE_SECS: f64 = 1.0;

/// Linear factor mapping media duration to expected processing time.
/// Throughput differs between deployment mode and accelerator; these ratios
/// come from observed runs.
pub fn processing_ratio(online: bool, device: Device) -> f64 {
    match (online, device) {
        (true, Device::Mps) => 5.0,
        (true, _) => 10.0,
        (false, Device::Mps) => 3.0,
        (false, _) => 6.0,
    }
}

pub fn estimate_from_duration(duration_secs: f64, online: bool, device: Device) -> f64 {
    duration_secs / processing_ratio(online, device)
}

pub fn is_zip(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

/// Frontend-side estimate for one inbox file. Probe failures degrade to the
/// default estimate rather than failing the whole queue view.
pub async fn estimate_for_file(
    prober: &dyn DurationProber,
    path: &Path,
    online: bool,
    device: Device,
) -> f64 {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if is_zip(&name) {
        return ZIP_NOMINAL_ESTIMATE_SECS;
    }
    match prober.duration_secs(path).await {
        Ok(duration) => estimate_from_duration(duration, online, device),
        Err(err) => {
            tracing::warn!("duration probe failed for {}: {err:#}", path.display());
            PROBE_FAILURE_ESTIMATE_SECS
        }
    }
}
