//! Ignore-pattern parsing and matching.
//!
//! A pattern such as `credits-logo-credits-SPLIT-logo` (or the short form
//! `c-l-c-s-l`) describes the sequence of visual blocks expected around a
//! boundary and where the cut goes. Detections of types the pattern does
//! not mention are ignored; the remaining detections are grouped into
//! blocks and lined up against the tokens.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::EpisplitError;

/// A visual classification the vision model reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionType {
    Credits,
    Logo,
    Outro,
    Intro,
    TitleCard,
    PreviouslyOn,
}

impl DetectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectionType::Credits => "credits",
            DetectionType::Logo => "logo",
            DetectionType::Outro => "outro",
            DetectionType::Intro => "intro",
            DetectionType::TitleCard => "title_card",
            DetectionType::PreviouslyOn => "previously_on",
        }
    }
}

impl fmt::Display for DetectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionType {
    type Err = ();

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token.to_ascii_lowercase().as_str() {
            "c" | "credits" => Ok(DetectionType::Credits),
            "l" | "logo" => Ok(DetectionType::Logo),
            "o" | "outro" => Ok(DetectionType::Outro),
            "i" | "intro" => Ok(DetectionType::Intro),
            "t" | "title" | "title_card" => Ok(DetectionType::TitleCard),
            "p" | "previously" | "previously_on" => Ok(DetectionType::PreviouslyOn),
            _ => Err(()),
        }
    }
}

/// One expected block. `is_split` marks the block the cut follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PatternToken {
    pub kind: DetectionType,
    pub is_split: bool,
}

/// A parsed ignore-pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionPattern {
    pub tokens: Vec<PatternToken>,
    /// Types the pattern mentions; everything else is ignored.
    pub relevant: BTreeSet<DetectionType>,
}

impl DetectionPattern {
    /// Parse a `-`-separated pattern with exactly one `SPLIT` (or `s`)
    /// marker between two blocks.
    ///
    /// ```
    /// use episplit::detectors::llm::DetectionPattern;
    ///
    /// let long = DetectionPattern::parse("credits-logo-credits-SPLIT-logo")?;
    /// let short = DetectionPattern::parse("c-l-c-s-l")?;
    /// assert_eq!(long, short);
    /// assert_eq!(long.split_index(), Some(2));
    /// # Ok::<(), episplit::EpisplitError>(())
    /// ```
    pub fn parse(pattern: &str) -> Result<Self, EpisplitError> {
        let invalid = |reason: &str| EpisplitError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let mut tokens: Vec<PatternToken> = Vec::new();
        let mut splits = 0;
        for raw in pattern.split('-').map(str::trim) {
            if raw.is_empty() {
                return Err(invalid("empty token"));
            }
            if raw.eq_ignore_ascii_case("split") || raw.eq_ignore_ascii_case("s") {
                let Some(last) = tokens.last_mut() else {
                    return Err(invalid("SPLIT cannot start the pattern"));
                };
                if last.is_split {
                    return Err(invalid("consecutive SPLIT markers"));
                }
                last.is_split = true;
                splits += 1;
                continue;
            }
            let kind = raw
                .parse::<DetectionType>()
                .map_err(|()| invalid(&format!("unknown token '{raw}'")))?;
            tokens.push(PatternToken { kind, is_split: false });
        }

        match splits {
            0 => return Err(invalid("missing SPLIT marker")),
            1 => {}
            _ => return Err(invalid("more than one SPLIT marker")),
        }
        if tokens.last().is_some_and(|t| t.is_split) {
            return Err(invalid("SPLIT cannot end the pattern"));
        }

        let relevant = tokens.iter().map(|t| t.kind).collect();
        Ok(Self { tokens, relevant })
    }

    /// Index of the token the cut follows.
    pub fn split_index(&self) -> Option<usize> {
        self.tokens.iter().position(|t| t.is_split)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl fmt::Display for DetectionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self
            .tokens
            .iter()
            .flat_map(|t| {
                let mut part = vec![t.kind.as_str()];
                if t.is_split {
                    part.push("SPLIT");
                }
                part
            })
            .collect();
        f.write_str(&parts.join("-"))
    }
}

/// A positive frame of one relevant type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TypedDetection {
    pub time: f64,
    pub kind: DetectionType,
}

/// A run of detections with no large gap.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionBlock {
    pub start: f64,
    pub end: f64,
    /// Most frequent type in the block; ties go to the earliest.
    pub kind: DetectionType,
    pub count: usize,
}

impl DetectionBlock {
    fn from_run(run: &[TypedDetection]) -> Option<Self> {
        let first = run.first()?;
        let last = run.last()?;
        let mut counts: Vec<(DetectionType, usize)> = Vec::new();
        for d in run {
            match counts.iter_mut().find(|(k, _)| *k == d.kind) {
                Some((_, n)) => *n += 1,
                None => counts.push((d.kind, 1)),
            }
        }
        let kind = counts
            .iter()
            .fold(None, |best: Option<(DetectionType, usize)>, &(k, n)| match best {
                Some((_, m)) if m >= n => best,
                _ => Some((k, n)),
            })
            .map_or(first.kind, |(k, _)| k);
        Some(Self {
            start: first.time,
            end: last.time,
            kind,
            count: run.len(),
        })
    }
}

/// Group time-sorted detections into blocks.
///
/// Without `expected`, blocks break at every gap larger than `max_gap`.
/// With `expected` blocks, the `expected - 1` largest gaps are used, so
/// the result has exactly that many blocks whenever there are enough
/// detections.
pub fn segment_detections(
    detections: &[TypedDetection],
    max_gap: f64,
    expected: Option<usize>,
) -> Vec<DetectionBlock> {
    if detections.is_empty() {
        return Vec::new();
    }
    let gaps: Vec<(usize, f64)> = detections
        .windows(2)
        .enumerate()
        .map(|(i, pair)| (i + 1, pair[1].time - pair[0].time))
        .collect();

    let mut cuts: Vec<usize> = match expected {
        Some(k) if k >= 1 && detections.len() >= k => {
            let mut largest = gaps.clone();
            largest.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
            largest.into_iter().take(k - 1).map(|(i, _)| i).collect()
        }
        _ => gaps.iter().filter(|(_, gap)| *gap > max_gap).map(|&(i, _)| i).collect(),
    };
    cuts.sort_unstable();

    let mut blocks = Vec::with_capacity(cuts.len() + 1);
    let mut from = 0;
    for cut in cuts.into_iter().chain(std::iter::once(detections.len())) {
        if let Some(block) = DetectionBlock::from_run(&detections[from..cut]) {
            blocks.push(block);
        }
        from = cut;
    }
    blocks
}

/// Outcome of lining blocks up against a pattern.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternMatch {
    /// Cut position: the middle of the gap after the split block.
    pub split_time: f64,
    /// Fraction of tokens whose block type matched.
    pub score: f64,
    pub blocks: Vec<DetectionBlock>,
}

impl PatternMatch {
    pub fn is_full(&self) -> bool {
        self.score >= 1.0
    }
}

/// Match detections against `pattern`.
///
/// Natural gap grouping is tried first; if it does not produce one block
/// per token, the detections are forced into that many blocks. Returns
/// `None` when there are too few detections, or when nothing lines up.
pub fn match_pattern(pattern: &DetectionPattern, detections: &[TypedDetection], max_gap: f64) -> Option<PatternMatch> {
    let split = pattern.split_index()?;
    let mut relevant: Vec<TypedDetection> = detections
        .iter()
        .copied()
        .filter(|d| pattern.relevant.contains(&d.kind))
        .collect();
    relevant.sort_by(|a, b| a.time.total_cmp(&b.time));

    let mut blocks = segment_detections(&relevant, max_gap, None);
    if blocks.len() != pattern.len() {
        blocks = segment_detections(&relevant, max_gap, Some(pattern.len()));
    }
    if blocks.len() != pattern.len() {
        return None;
    }

    let matched = blocks
        .iter()
        .zip(&pattern.tokens)
        .filter(|(block, token)| block.kind == token.kind)
        .count();
    if matched == 0 {
        return None;
    }
    let split_time = (blocks[split].end + blocks[split + 1].start) / 2.0;
    Some(PatternMatch {
        split_time,
        score: matched as f64 / pattern.len() as f64,
        blocks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kind: DetectionType, from: f64, to: f64, step: f64) -> Vec<TypedDetection> {
        let mut out = Vec::new();
        let mut t = from;
        while t <= to {
            out.push(TypedDetection { time: t, kind });
            t += step;
        }
        out
    }

    #[test]
    fn parse_rejects_malformed_patterns() {
        for bad in ["", "SPLIT-logo", "credits-logo", "credits-SPLIT", "c-s-s-l", "c-s-l-s-c", "credits-banana-s-l", "c--s-l"] {
            assert!(DetectionPattern::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn parse_collects_relevant_types_and_round_trips() {
        let pattern = DetectionPattern::parse("credits-logo-credits-SPLIT-logo").unwrap();
        assert_eq!(pattern.len(), 4);
        assert_eq!(
            pattern.relevant.iter().copied().collect::<Vec<_>>(),
            vec![DetectionType::Credits, DetectionType::Logo]
        );
        assert_eq!(pattern.to_string(), "credits-logo-credits-SPLIT-logo");
        assert_eq!(DetectionPattern::parse(&pattern.to_string()).unwrap(), pattern);
    }

    #[test]
    fn natural_gaps_make_blocks() {
        let mut detections = run(DetectionType::Credits, 0.0, 10.0, 2.0);
        detections.extend(run(DetectionType::Logo, 40.0, 44.0, 2.0));
        let blocks = segment_detections(&detections, 10.0, None);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].kind, DetectionType::Credits);
        assert_eq!((blocks[1].start, blocks[1].end), (40.0, 44.0));
    }

    #[test]
    fn forced_segmentation_uses_largest_gaps() {
        let mut detections = run(DetectionType::Credits, 0.0, 4.0, 2.0);
        detections.extend(run(DetectionType::Credits, 9.0, 11.0, 2.0));
        detections.extend(run(DetectionType::Logo, 30.0, 32.0, 2.0));
        let blocks = segment_detections(&detections, 10.0, Some(3));
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1].start, 9.0);
    }

    #[test]
    fn full_match_splits_in_the_gap_after_the_marked_block() {
        let pattern = DetectionPattern::parse("c-l-c-s-l").unwrap();
        let mut detections = run(DetectionType::Credits, 100.0, 130.0, 2.0);
        detections.extend(run(DetectionType::Logo, 150.0, 154.0, 2.0));
        detections.extend(run(DetectionType::Credits, 180.0, 200.0, 2.0));
        detections.extend(run(DetectionType::Logo, 230.0, 234.0, 2.0));
        detections.extend(run(DetectionType::Intro, 210.0, 220.0, 2.0));

        let matched = match_pattern(&pattern, &detections, 10.0).unwrap();
        assert!(matched.is_full());
        assert_eq!(matched.split_time, 215.0);
    }

    #[test]
    fn partial_match_reports_score() {
        let pattern = DetectionPattern::parse("c-s-l").unwrap();
        let mut detections = run(DetectionType::Credits, 0.0, 10.0, 2.0);
        detections.extend(run(DetectionType::Credits, 40.0, 44.0, 2.0));
        let matched = match_pattern(&pattern, &detections, 10.0).unwrap();
        assert!(!matched.is_full());
        assert_eq!(matched.score, 0.5);
        assert_eq!(matched.split_time, 25.0);
    }

    #[test]
    fn too_few_detections_do_not_match() {
        let pattern = DetectionPattern::parse("c-l-s-c").unwrap();
        assert!(match_pattern(&pattern, &run(DetectionType::Credits, 0.0, 2.0, 2.0), 10.0).is_none());
    }
}
