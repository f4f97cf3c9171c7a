use std::fmt;

use serde::Serialize;

/// Single labelled score returned by an engine.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Recognition {
    pub id: String,
    pub label: String,
    pub confidence: f32,
}

impl Recognition {
    pub fn new(id: impl Into<String>, label: impl Into<String>, confidence: f32) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            confidence,
        }
    }
}

impl fmt::Display for Recognition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({:.1}%)",
            self.id,
            self.label,
            self.confidence * 100.0
        )
    }
}

/// Recognitions ordered by descending confidence. May be empty.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ClassificationResult {
    recognitions: Vec<Recognition>,
}

impl ClassificationResult {
    /// Sort `recognitions` by confidence and clamp every score into `[0, 1]`.
    pub fn new(mut recognitions: Vec<Recognition>) -> Self {
        for recognition in &mut recognitions {
            recognition.confidence = if recognition.confidence.is_nan() {
                0.0
            } else {
                recognition.confidence.clamp(0.0, 1.0)
            };
        }
        recognitions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Self { recognitions }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a top-`max_results` result from a dense score vector.
    ///
    /// Scores at or below `min_confidence` are skipped. Indices without a label
    /// are reported as `"unknown"`.
    pub fn from_scores(
        labels: &[String],
        scores: &[f32],
        max_results: usize,
        min_confidence: f32,
    ) -> Self {
        let candidates = scores
            .iter()
            .enumerate()
            .filter(|(_, score)| **score > min_confidence)
            .map(|(idx, score)| {
                let label = labels.get(idx).map(String::as_str).unwrap_or("unknown");
                Recognition::new(idx.to_string(), label, *score)
            })
            .collect();
        let mut result = Self::new(candidates);
        result.recognitions.truncate(max_results);
        result
    }

    pub fn top(&self) -> Option<&Recognition> {
        self.recognitions.first()
    }

    pub fn len(&self) -> usize {
        self.recognitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recognitions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Recognition> {
        self.recognitions.iter()
    }

    pub fn as_slice(&self) -> &[Recognition] {
        &self.recognitions
    }
}

impl From<Vec<Recognition>> for ClassificationResult {
    fn from(recognitions: Vec<Recognition>) -> Self {
        Self::new(recognitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_descending_and_clamped() {
        let result = ClassificationResult::new(vec![
            Recognition::new("1", "dog", 0.1),
            Recognition::new("0", "cat", 0.82),
            Recognition::new("2", "noise", f32::NAN),
            Recognition::new("3", "overflow", 1.7),
        ]);
        let labels: Vec<_> = result.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, ["overflow", "cat", "dog", "noise"]);
        assert_eq!(result.top().map(|r| r.confidence), Some(1.0));
        assert_eq!(result.as_slice()[3].confidence, 0.0);
    }

    #[test]
    fn top_k_from_scores() {
        let labels = vec!["cat".to_string(), "dog".to_string()];
        let result = ClassificationResult::from_scores(&labels, &[0.05, 0.6, 0.3, 0.05], 2, 0.1);
        assert_eq!(result.len(), 2);
        assert_eq!(result.as_slice()[0].label, "dog");
        assert_eq!(result.as_slice()[1].label, "unknown");
        assert_eq!(result.as_slice()[1].id, "2");
    }

    #[test]
    fn display_matches_overlay_text() {
        let recognition = Recognition::new("281", "tabby", 0.82);
        assert_eq!(recognition.to_string(), "[281] tabby (82.0%)");
    }
}
