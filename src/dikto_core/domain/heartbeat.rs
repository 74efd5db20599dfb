/// Progress beacon the worker leaves under `worker/<user>/` while a job runs.
///
/// The file is empty; everything lives in its name:
/// `<estimate_seconds>_<start_unix_seconds>_<original_filename>`. Underscores
/// inside the original filename are preserved, so parsing splits on `_` and
/// re-joins everything from the third field onward.
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub estimate_secs: f64,
    pub started_at_secs: u64,
    pub file_name: String,
}

impl Heartbeat {
    pub fn new(estimate_secs: f64, started_at_secs: u64, file_name: impl Into<String>) -> Self {
        Self {
            estimate_secs,
            started_at_secs,
            file_name: file_name.into(),
        }
    }

    /// Encode as the heartbeat filename.
    pub fn encode(&self) -> String {
        let estimate = self.estimate_secs.round().max(1.0) as u64;
        format!("{}_{}_{}", estimate, self.started_at_secs, self.file_name)
    }

    /// Decode a heartbeat filename. Returns `None` for anything malformed;
    /// the listener deletes such files.
    pub fn parse(name: &str) -> Option<Self> {
        let parts: Vec<&str> = name.split('_').collect();
        if parts.len() < 3 {
            return None;
        }
        let estimate_secs: f64 = parts[0].parse().ok()?;
        let started_at_secs = parts[1].parse::<f64>().ok()? as u64;
        let file_name = parts[2..].join("_");
        if file_name.is_empty() {
            return None;
        }
        Some(Self {
            estimate_secs,
            started_at_secs,
            file_name,
        })
    }

    /// Fraction done at `now`, capped below 1.0 so the bar never claims
    /// completion before the artifacts exist.
    pub fn progress_at(&self, now_secs: u64) -> f64 {
        let elapsed = now_secs.saturating_sub(self.started_at_secs) as f64;
        (elapsed / self.estimate_secs.max(1.0)).clamp(0.0, 0.975)
    }

    /// Whole seconds left at `now`, never below 1.
    pub fn remaining_at(&self, now_secs: u64) -> u64 {
        let elapsed = now_secs.saturating_sub(self.started_at_secs) as f64;
        (self.estimate_secs - elapsed).max(1.0).round() as u64
    }
}
