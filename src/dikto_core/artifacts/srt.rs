use std::fmt::Write;

use crate::dikto_core::domain::TranscriptSegment;

fn srt_timestamp(secs: f64) -> String {
    let total_millis = (secs.max(0.0) * 1000.0).round() as u64;
    let millis = total_millis % 1000;
    let total_secs = total_millis / 1000;
    format!(
        "{:02}:{:02}:{:02},{:03}",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60,
        millis
    )
}

/// Render transcript segments as a SubRip subtitle file: entries indexed from
/// 1, `HH:MM:SS,mmm` timestamps, speaker label prefixed when diarization
/// produced one.
pub fn render_srt(segments: &[TranscriptSegment]) -> String {
    let mut out = String::new();
    for (index, segment) in segments.iter().enumerate() {
        let _ = writeln!(out, "{}", index + 1);
        let _ = writeln!(
            out,
            "{} --> {}",
            srt_timestamp(segment.start),
            srt_timestamp(segment.end)
        );
        match &segment.speaker {
            Some(speaker) => {
                let _ = writeln!(out, "{speaker}: {}", segment.text.trim());
            }
            None => {
                let _ = writeln!(out, "{}", segment.text.trim());
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_use_subrip_format() {
        assert_eq!(srt_timestamp(0.0), "00:00:00,000");
        assert_eq!(srt_timestamp(3661.5), "01:01:01,500");
        assert_eq!(srt_timestamp(59.9994), "00:00:59,999");
    }

    #[test]
    fn renders_indexed_entries_with_speakers() {
        let segments = vec![
            TranscriptSegment {
                start: 0.0,
                end: 1.5,
                text: "hello there".to_string(),
                speaker: Some("SPEAKER_00".to_string()),
                language: None,
            },
            TranscriptSegment {
                start: 2.0,
                end: 3.0,
                text: "no label".to_string(),
                speaker: None,
                language: None,
            },
        ];
        let srt = render_srt(&segments);
        let expected = "1\n00:00:00,000 --> 00:00:01,500\nSPEAKER_00: hello there\n\n2\n00:00:02,000 --> 00:00:03,000\nno label\n\n";
        assert_eq!(srt, expected);
    }
}
