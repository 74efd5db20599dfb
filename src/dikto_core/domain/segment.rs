use serde::{Deserialize, Serialize};

/// One time-aligned utterance as returned by the speech pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptSegment {
    /// Seconds from the start of the media.
    pub start: f64,
    pub end: f64,
    pub text: String,
    /// Diarization label, e.g. `SPEAKER_00`. Absent when diarization did not
    /// produce one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    /// Detected language for this segment, when the pipeline reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Merge per-track transcripts of a zip bundle into one transcript ordered by
/// segment start time. Each input track is already sorted; this is a k-way
/// merge over the heads.
pub fn merge_tracks(mut tracks: Vec<Vec<TranscriptSegment>>) -> Vec<TranscriptSegment> {
    let mut cursors = vec![0usize; tracks.len()];
    let total: usize = tracks.iter().map(Vec::len).sum();
    let mut merged = Vec::with_capacity(total);

    while merged.len() < total {
        let mut earliest: Option<usize> = None;
        for (index, track) in tracks.iter().enumerate() {
            let Some(candidate) = track.get(cursors[index]) else {
                continue;
            };
            match earliest {
                Some(best) if tracks[best][cursors[best]].start <= candidate.start => {}
                _ => earliest = Some(index),
            }
        }
        let Some(index) = earliest else {
            break;
        };
        merged.push(std::mem::take(&mut tracks[index][cursors[index]]));
        cursors[index] += 1;
    }

    merged
}

impl Default for TranscriptSegment {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: 0.0,
            text: String::new(),
            speaker: None,
            language: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            start,
            end: start + 1.0,
            text: text.to_string(),
            speaker: None,
            language: None,
        }
    }

    #[test]
    fn merge_orders_globally_by_start_time() {
        let a = vec![seg(0.0, "a0"), seg(4.0, "a1")];
        let b = vec![seg(1.0, "b0"), seg(2.0, "b1"), seg(9.0, "b2")];
        let merged = merge_tracks(vec![a, b]);
        let texts: Vec<&str> = merged.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["a0", "b0", "b1", "a1", "b2"]);
    }

    #[test]
    fn merge_handles_empty_tracks() {
        let merged = merge_tracks(vec![vec![], vec![seg(0.5, "only")], vec![]]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].text, "only");
    }
}
