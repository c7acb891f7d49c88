//! Split decisions from densely sampled frame classifications.
//!
//! Precision mode samples a narrow window every couple of seconds and
//! decides where the cut goes from the classified frame sequence. A
//! "strong" transition is a run of at least `strong_run` frames with a
//! classification followed by at least as many without it. Logo
//! transitions beat credits transitions; single frames are a last resort.

use serde::{Deserialize, Serialize};

use crate::boundary::WindowHit;
use crate::detectors::llm::client::FrameAnalysis;
use crate::detectors::llm::pattern::{DetectionPattern, TypedDetection, match_pattern};

/// Precision mode tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecisionOptions {
    /// Seconds between sampled frames.
    pub sample_interval: f64,
    /// Frames on each side of a strong transition.
    pub strong_run: usize,
    /// Seconds added after the last credits frame.
    pub post_credits_buffer: f64,
    /// Largest gap (seconds) inside one pattern block.
    pub grouping_buffer: f64,
    /// Seconds the window grows on each side for the retry.
    pub expansion: f64,
    /// Seconds between frames of the coarse last-chance scan.
    pub coarse_interval: f64,
    /// Snap to a black-frame midpoint this close to the cut.
    pub black_snap_distance: f64,
    pub full_match_confidence: f64,
    pub partial_match_base: f64,
    pub partial_match_scale: f64,
}

impl Default for PrecisionOptions {
    fn default() -> Self {
        Self {
            sample_interval: 2.0,
            strong_run: 3,
            post_credits_buffer: 15.0,
            grouping_buffer: 10.0,
            expansion: 90.0,
            coarse_interval: 10.0,
            black_snap_distance: 2.0,
            full_match_confidence: 0.9,
            partial_match_base: 0.1,
            partial_match_scale: 0.45,
        }
    }
}

/// A run of positive frames followed by a run of negative ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    /// First frame of the positive run.
    pub run_start: f64,
    /// Last frame of the positive run.
    pub run_end: f64,
    /// First negative frame after the run.
    pub next_time: f64,
    /// Frames in the positive run.
    pub run_len: usize,
}

/// Strong transitions out of frames matching `positive`.
///
/// `analyses` must be in time order.
pub fn strong_transitions<P>(analyses: &[FrameAnalysis], min_run: usize, positive: P) -> Vec<Transition>
where
    P: Fn(&FrameAnalysis) -> bool,
{
    let min_run = min_run.max(1);
    let flags: Vec<bool> = analyses.iter().map(&positive).collect();

    let mut transitions = Vec::new();
    let mut i = 0;
    while i < flags.len() {
        if !flags[i] {
            i += 1;
            continue;
        }
        let start = i;
        while i < flags.len() && flags[i] {
            i += 1;
        }
        let run_len = i - start;
        let negatives = flags[i..].iter().take_while(|&&f| !f).count();
        if run_len >= min_run && negatives >= min_run {
            transitions.push(Transition {
                run_start: analyses[start].timestamp,
                run_end: analyses[i - 1].timestamp,
                next_time: analyses[i].timestamp,
                run_len,
            });
        }
    }
    transitions
}

/// The transition whose cut lands closest to `center`.
fn nearest<S>(transitions: Vec<Transition>, center: f64, split: S) -> Option<Transition>
where
    S: Fn(&Transition) -> f64,
{
    transitions
        .into_iter()
        .min_by(|a, b| (split(a) - center).abs().total_cmp(&(split(b) - center).abs()))
}

fn is_closing(analysis: &FrameAnalysis) -> bool {
    analysis.is_credits || analysis.is_outro
}

/// Pick the cut for one window from its classified frames.
///
/// Returns `None` when no frame carries any usable evidence.
pub fn decide_split(analyses: &[FrameAnalysis], center: f64, options: &PrecisionOptions) -> Option<WindowHit> {
    let logo_split = |t: &Transition| (t.run_end + t.next_time) / 2.0;
    if let Some(t) = nearest(strong_transitions(analyses, options.strong_run, |a| a.is_logo), center, logo_split) {
        let time = logo_split(&t);
        log::debug!("Strong logo transition: {} frames ending {:.1}s", t.run_len, t.run_end);
        return Some(
            WindowHit::new(time, (0.8 + 0.03 * t.run_len as f64).min(0.95))
                .with_meta("source", "llm_logo")
                .with_meta("logo_count", t.run_len)
                .with_meta("logo_start", t.run_start)
                .with_meta("logo_end", t.run_end),
        );
    }

    let buffer = options.post_credits_buffer;
    let credits_split = move |t: &Transition| t.run_end + buffer;
    if let Some(t) = nearest(strong_transitions(analyses, options.strong_run, is_closing), center, credits_split) {
        log::debug!("Strong credits transition: {} frames ending {:.1}s", t.run_len, t.run_end);
        return Some(
            WindowHit::new(credits_split(&t), 0.8)
                .with_meta("source", "llm_credits")
                .with_meta("credits_end", t.run_end)
                .with_meta("post_credits_buffer", buffer),
        );
    }

    if let Some(last_logo) = analyses.iter().rev().find(|a| a.is_logo) {
        return Some(
            WindowHit::new(last_logo.timestamp + options.sample_interval / 2.0, 0.5)
                .with_meta("source", "llm_logo_weak")
                .with_meta("weak", true),
        );
    }
    analyses.iter().rev().find(|a| is_closing(a)).map(|last| {
        WindowHit::new(last.timestamp + buffer, 0.4)
            .with_meta("source", "llm_credits_weak")
            .with_meta("weak", true)
    })
}

/// Typed detections for every relevant flag of every frame.
pub fn typed_detections(analyses: &[FrameAnalysis], pattern: &DetectionPattern) -> Vec<TypedDetection> {
    analyses
        .iter()
        .flat_map(|a| {
            pattern
                .relevant
                .iter()
                .filter(|&&kind| a.has(kind))
                .map(|&kind| TypedDetection { time: a.timestamp, kind })
        })
        .collect()
}

/// Pick the cut by matching the frames against an ignore-pattern.
pub fn decide_with_pattern(
    analyses: &[FrameAnalysis],
    pattern: &DetectionPattern,
    options: &PrecisionOptions,
) -> Option<WindowHit> {
    let detections = typed_detections(analyses, pattern);
    let matched = match_pattern(pattern, &detections, options.grouping_buffer)?;
    let confidence = if matched.is_full() {
        options.full_match_confidence
    } else {
        options.partial_match_base + options.partial_match_scale * matched.score
    };
    log::debug!(
        "Pattern {pattern} matched {} blocks (score {:.2})",
        matched.blocks.len(),
        matched.score
    );
    Some(
        WindowHit::new(matched.split_time, confidence)
            .with_meta("source", "llm_pattern")
            .with_meta("pattern", pattern.to_string())
            .with_meta("pattern_score", matched.score)
            .with_meta("full_match", matched.is_full()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(spec: &str, interval: f64) -> Vec<FrameAnalysis> {
        spec.chars()
            .enumerate()
            .map(|(i, c)| {
                let mut a = FrameAnalysis::parse(i as f64 * interval, "");
                a.is_credits = c == 'c';
                a.is_logo = c == 'l';
                a
            })
            .collect()
    }

    #[test]
    fn strong_run_needs_negatives_after_it() {
        let analyses = frames("cccc...cc..", 2.0);
        let t = strong_transitions(&analyses, 3, |a| a.is_credits);
        assert_eq!(t.len(), 1);
        assert_eq!((t[0].run_start, t[0].run_end, t[0].next_time, t[0].run_len), (0.0, 6.0, 8.0, 4));
        assert!(strong_transitions(&frames("cccc..", 2.0), 3, |a| a.is_credits).is_empty());
    }

    #[test]
    fn logo_beats_credits() {
        let analyses = frames("ccccc...lll....", 2.0);
        let hit = decide_split(&analyses, 20.0, &PrecisionOptions::default()).unwrap();
        assert_eq!(hit.metadata["source"], "llm_logo");
        assert_eq!(hit.time, 21.0);
        assert!((hit.confidence - 0.89).abs() < 1e-9);
    }

    #[test]
    fn credits_split_adds_buffer() {
        let analyses = frames("....cccc....", 2.0);
        let hit = decide_split(&analyses, 20.0, &PrecisionOptions::default()).unwrap();
        assert_eq!(hit.metadata["source"], "llm_credits");
        assert_eq!(hit.time, 14.0 + 15.0);
    }

    #[test]
    fn single_frames_are_weak_evidence() {
        let hit = decide_split(&frames("..l.....", 2.0), 8.0, &PrecisionOptions::default()).unwrap();
        assert_eq!(hit.metadata["source"], "llm_logo_weak");
        assert_eq!(hit.time, 5.0);
        assert!(decide_split(&frames("......", 2.0), 6.0, &PrecisionOptions::default()).is_none());
    }

    #[test]
    fn pattern_confidence_depends_on_match_quality() {
        let options = PrecisionOptions::default();
        let pattern = DetectionPattern::parse("c-s-l").unwrap();

        let full = decide_with_pattern(&frames("ccc.........lll", 2.0), &pattern, &options).unwrap();
        assert_eq!(full.confidence, 0.9);
        assert_eq!(full.time, 14.0);

        let partial = decide_with_pattern(&frames("ccc.........ccc", 2.0), &pattern, &options).unwrap();
        assert!((partial.confidence - (0.1 + 0.45 * 0.5)).abs() < 1e-9);
    }
}
