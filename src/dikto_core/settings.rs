use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Accelerator the worker's speech pipeline runs on. Mirrors the `DEVICE`
/// environment variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda,
    Mps,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Mps => "mps",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "mps" => Ok(Self::Mps),
            other => Err(anyhow::anyhow!(
                "unsupported DEVICE '{other}' (expected cpu, cuda or mps)"
            )),
        }
    }
}

fn parse_bool_env(value: Option<&str>, default: bool) -> bool {
    value.map_or(default, |raw| {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        }
    })
}

/// Process configuration, read once at startup from the environment.
///
/// Both binaries share this struct; fields that only one of them needs
/// (`asr_command` for the worker, `storage_secret` for the frontend) stay
/// optional here and are validated by the respective entry point.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Filesystem root. The shared tree lives under `<root>/data/`.
    pub root: PathBuf,
    /// Online deployments use per-browser identities and faster ETA ratios.
    pub online: bool,
    pub device: Device,
    /// Forwarded to the speech pipeline.
    pub batch_size: u32,
    /// HMAC key for the browser session cookie. Required when `online`.
    pub storage_secret: Option<String>,
    pub ssl_certfile: Option<PathBuf>,
    pub ssl_keyfile: Option<PathBuf>,
    pub port: u16,
    /// Age in seconds after which a `.processing` marker counts as stuck.
    pub stuck_secs: u64,
    /// External speech+diarization pipeline executable.
    pub asr_command: Option<PathBuf>,
    /// Diarization model credential, passed through to the pipeline.
    pub hf_auth_token: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let root = match env::var_os("ROOT") {
            Some(raw) if !raw.is_empty() => PathBuf::from(raw),
            _ => {
                let exe = env::current_exe().context("failed to resolve current executable")?;
                exe.parent()
                    .map(PathBuf::from)
                    .context("executable has no parent directory")?
            }
        };

        let online = parse_bool_env(env::var("ONLINE").ok().as_deref(), false);
        let device = Device::parse(&env::var("DEVICE").unwrap_or_default())?;
        let batch_size = match env::var("BATCH_SIZE") {
            Ok(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid BATCH_SIZE '{raw}'"))?,
            Err(_) => 4,
        };
        let stuck_secs = match env::var("STUCK_SECS") {
            Ok(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid STUCK_SECS '{raw}'"))?,
            Err(_) => 600,
        };
        let port = match env::var("PORT") {
            Ok(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid PORT '{raw}'"))?,
            Err(_) => 8080,
        };

        if parse_bool_env(env::var("WINDOWS").ok().as_deref(), false) {
            augment_path_for_bundled_ffmpeg();
        }

        Ok(Self {
            root,
            online,
            device,
            batch_size,
            storage_secret: env::var("STORAGE_SECRET").ok().filter(|s| !s.is_empty()),
            ssl_certfile: env::var_os("SSL_CERTFILE").map(PathBuf::from),
            ssl_keyfile: env::var_os("SSL_KEYFILE").map(PathBuf::from),
            port,
            stuck_secs,
            asr_command: env::var_os("ASR_COMMAND").map(PathBuf::from),
            hf_auth_token: env::var("HF_AUTH_TOKEN").ok().filter(|s| !s.is_empty()),
        })
    }

    /// Frontend-side validation: online deployments must be able to sign
    /// session cookies.
    pub fn validate_frontend(&self) -> Result<()> {
        if self.online && self.storage_secret.is_none() {
            return Err(anyhow::anyhow!(
                "STORAGE_SECRET must be set when ONLINE=True"
            ));
        }
        Ok(())
    }

    /// Worker-side validation: the speech pipeline and its diarization
    /// credential are hard requirements, checked before entering the loop so
    /// operators see a clear startup failure instead of per-job errors.
    pub fn validate_worker(&self) -> Result<()> {
        let command = self
            .asr_command
            .as_ref()
            .context("ASR_COMMAND must point at the speech pipeline executable")?;
        if self.hf_auth_token.is_none() {
            return Err(anyhow::anyhow!(
                "HF_AUTH_TOKEN is missing; the diarization model cannot be loaded without it"
            ));
        }
        if command.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("ASR_COMMAND is empty"));
        }
        Ok(())
    }
}

// Deployments on Windows ship ffmpeg next to the executable instead of
// relying on a system-wide install.
fn augment_path_for_bundled_ffmpeg() {
    let mut path = env::var_os("PATH").unwrap_or_default();
    for extra in ["ffmpeg/bin", "ffmpeg"] {
        let mut joined = std::mem::take(&mut path);
        joined.push(if cfg!(windows) { ";" } else { ":" });
        joined.push(extra);
        path = joined;
    }
    // SAFETY: called once during single-threaded startup, before the runtime
    // or any worker threads exist.
    unsafe { env::set_var("PATH", &path) };
}
