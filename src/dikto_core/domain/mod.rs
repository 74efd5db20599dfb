mod heartbeat;
mod job;
mod segment;

pub use heartbeat::Heartbeat;
pub use job::{JobPatch, JobRecord, JobState};
pub use segment::{merge_tracks, TranscriptSegment};
