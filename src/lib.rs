//! dikto: a self-hosted, multi-user transcription service.
//!
//! Two long-lived processes share nothing but a directory tree: the frontend
//! (`dikto-web`) accepts uploads and streams queue positions and progress to
//! browsers, while the worker (`dikto-worker`) drains the global inbox in
//! modification-time order, drives the speech pipeline and writes subtitle
//! and interactive-editor artifacts. The directory layout is the schema; the
//! filename conventions are the wire format.

pub mod dikto_core;
pub mod server;

pub use dikto_core::media::{DurationProber, Ffmpeg, Ffprobe, MediaTools};
pub use dikto_core::settings::{Device, Settings};
pub use dikto_core::speech::{CommandPipeline, SpeechPipeline, TranscribeRequest};
pub use dikto_core::store::StoreRoot;
pub use dikto_core::worker::{JobOutcome, Worker};
