//! Best-effort field extraction from free-text model output.
//!
//! Used only after strict decoding has failed. Finds a category keyword,
//! a priority word, and a confidence from a percentage, a decimal, or a
//! confidence word. Yields nothing unless a category is found.

use regex::Regex;

use crate::error::PipelineError;
use crate::pipeline::types::{Category, Priority};

/// Confidence assumed when the text carries no confidence signal.
const UNSTATED_CONFIDENCE: f32 = 0.5;

/// Fields recovered from free text.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub category: Category,
    pub priority: Priority,
    pub confidence: f32,
    /// Which signals produced each field.
    pub notes: Vec<String>,
}

pub struct HeuristicExtractor {
    categories: Vec<(Category, Regex)>,
    priority: Regex,
    percentage: Regex,
    decimal: Regex,
    /// Checked in order; hedged and negated forms come first.
    confidence_words: Vec<(Regex, f32)>,
}

const CONFIDENCE_WORDS: &[(&str, f32)] = &[
    (r"\b(not|hardly|barely)\s+(very\s+|entirely\s+|that\s+)?(confident|sure|certain|likely|clear)\b", 0.3),
    (r"\b(uncertain|unsure|unclear|unlikely|doubtful)\b", 0.3),
    (r"\b(very|highly)\s+confident\b", 0.9),
    (r"\bcertain(ly)?\b", 0.9),
    (r"\bclearly\b", 0.85),
    (r"\bconfident\b", 0.75),
    (r"\blikely\b", 0.7),
    (r"\bprobably\b", 0.65),
    (r"\bpossibly\b", 0.45),
    (r"\bmaybe\b", 0.4),
];

impl HeuristicExtractor {
    pub fn new() -> Result<Self, PipelineError> {
        let categories = Category::ALL
            .into_iter()
            .map(|c| {
                let words = c.as_str().replace('_', r"[\s_\-]");
                Regex::new(&format!(r"(?i)\b{words}\b")).map(|re| (c, re))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let confidence_words = CONFIDENCE_WORDS
            .iter()
            .map(|(pattern, score)| Regex::new(&format!("(?i){pattern}")).map(|re| (re, *score)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            categories,
            priority: Regex::new(
                r#"(?i)\bpriority\b["']?\s*(?:is|[:=])?\s*["']?(critical|high|normal|medium|low|urgent)\b"#,
            )?,
            percentage: Regex::new(r"(\d{1,3}(?:\.\d+)?)\s*%")?,
            decimal: Regex::new(
                r#"(?i)\bconfidence\b["']?\s*(?:is|of|[:=])?\s*["']?((?:0?\.\d+)|(?:[01](?:\.\d+)?))\b"#,
            )?,
            confidence_words,
        })
    }

    /// Recover fields from `text`. Returns `None` when no category keyword is
    /// present.
    pub fn extract(&self, text: &str) -> Option<Extracted> {
        let mut notes = Vec::new();

        // Earliest mention wins.
        let (category, _) = self
            .categories
            .iter()
            .filter_map(|(c, re)| re.find(text).map(|m| (*c, m.start())))
            .min_by_key(|(_, pos)| *pos)?;
        notes.push(format!("category keyword '{category}'"));

        let priority = self
            .priority
            .captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| Priority::parse(m.as_str()))
            .map(|p| {
                notes.push(format!("priority word '{p}'"));
                p
            })
            .unwrap_or(Priority::Normal);

        let confidence = self
            .confidence_number(text)
            .inspect(|c| notes.push(format!("confidence figure {c:.2}")))
            .or_else(|| {
                self.confidence_word(text).inspect(|c| notes.push(format!("confidence word ≈ {c:.2}")))
            })
            .unwrap_or(UNSTATED_CONFIDENCE);

        Some(Extracted {
            category,
            priority,
            confidence,
            notes,
        })
    }

    fn confidence_number(&self, text: &str) -> Option<f32> {
        if let Some(value) = self
            .decimal
            .captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f32>().ok())
            && (0.0..=1.0).contains(&value)
        {
            return Some(value);
        }
        self.percentage
            .captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f32>().ok())
            .filter(|p| (0.0..=100.0).contains(p))
            .map(|p| p / 100.0)
    }

    fn confidence_word(&self, text: &str) -> Option<f32> {
        self.confidence_words
            .iter()
            .find(|(re, _)| re.is_match(text))
            .map(|(_, score)| *score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> HeuristicExtractor {
        HeuristicExtractor::new().unwrap()
    }

    #[test]
    fn finds_category_priority_and_percentage() {
        let text = "This looks like a lawsuit. Priority: high. I'm about 85% sure.";
        let e = extractor().extract(text).unwrap();
        assert_eq!(e.category, Category::Lawsuit);
        assert_eq!(e.priority, Priority::High);
        assert!((e.confidence - 0.85).abs() < 1e-6);
    }

    #[test]
    fn multiword_categories() {
        let e = extractor()
            .extract("Category is document submission, confidence 0.9")
            .unwrap();
        assert_eq!(e.category, Category::DocumentSubmission);
        assert!((e.confidence - 0.9).abs() < 1e-6);

        let e = extractor().extract("client-communication").unwrap();
        assert_eq!(e.category, Category::ClientCommunication);
    }

    #[test]
    fn earliest_category_wins() {
        let e = extractor()
            .extract("billing question, not an emergency")
            .unwrap();
        assert_eq!(e.category, Category::Billing);
    }

    #[test]
    fn confidence_words() {
        let e = extractor().extract("probably an appointment").unwrap();
        assert!((e.confidence - 0.65).abs() < 1e-6);
        let e = extractor().extract("inquiry, but I'm not confident").unwrap();
        assert!((e.confidence - 0.3).abs() < 1e-6);
    }

    #[test]
    fn hedged_words_are_not_read_as_certainty() {
        for text in [
            "Possibly billing, but I am uncertain.",
            "billing seems unlikely here",
            "billing, though not very likely",
            "Billing? I'm unsure.",
        ] {
            let e = extractor().extract(text).unwrap();
            assert!((e.confidence - 0.3).abs() < 1e-6, "{text} -> {}", e.confidence);
        }
        let e = extractor().extract("billing, almost certainly").unwrap();
        assert!((e.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn unstated_confidence_and_priority() {
        let e = extractor().extract("emergency").unwrap();
        assert_eq!(e.priority, Priority::Normal);
        assert_eq!(e.confidence, UNSTATED_CONFIDENCE);
    }

    #[test]
    fn out_of_range_figures_ignored() {
        let e = extractor().extract("billing, 250% certain").unwrap();
        // 250% is rejected; "certain" still counts.
        assert!((e.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn nothing_usable() {
        assert!(extractor().extract("I cannot help with that.").is_none());
        assert!(extractor().extract("").is_none());
    }
}
