//! Scoring engine
//!
//! Pure functions from (items, answers) to a score report. No I/O.

use std::collections::{BTreeMap, HashMap};

use examprep_shared::ContentKind;
use serde::{Deserialize, Serialize};

use crate::generator::GeneratedItem;

/// Maximum entries in each of strengths and weaknesses
pub const MAX_HIGHLIGHTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionScore {
    pub section: String,
    pub correct: u32,
    pub total: u32,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryScore {
    pub category: String,
    pub correct: u32,
    pub attempted: u32,
    pub total: u32,
    /// `None` when nothing in the category was attempted
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub category: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub overall_score: f64,
    pub section_scores: Vec<SectionScore>,
    pub category_scores: Vec<CategoryScore>,
    pub strengths: Vec<Highlight>,
    pub weaknesses: Vec<Highlight>,
    pub guidance: String,
}

impl ScoreReport {
    /// Every score the report carries, for bounds checks
    pub fn all_scores(&self) -> impl Iterator<Item = f64> + '_ {
        std::iter::once(self.overall_score)
            .chain(self.section_scores.iter().map(|s| s.score))
            .chain(self.category_scores.iter().filter_map(|c| c.score))
            .chain(self.strengths.iter().map(|h| h.score))
            .chain(self.weaknesses.iter().map(|h| h.score))
    }
}

fn is_correct(item: &GeneratedItem, answer: Option<&String>) -> bool {
    answer.is_some_and(|a| a.trim().eq_ignore_ascii_case(item.correct_answer.trim()))
}

fn percentage(correct: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(f64::from(correct) / f64::from(total) * 100.0)
}

fn round2(value: f64) -> f64 {
    ((value * 100.0).round() / 100.0).clamp(0.0, 100.0)
}

/// Insertion-ordered tally keyed by label
#[derive(Default)]
struct Tally {
    order: Vec<String>,
    counts: HashMap<String, (u32, u32, u32)>,
}

impl Tally {
    fn add(&mut self, label: &str, attempted: bool, correct: bool) {
        let entry = self.counts.entry(label.to_string()).or_insert_with(|| {
            self.order.push(label.to_string());
            (0, 0, 0)
        });
        entry.2 += 1;
        if attempted {
            entry.1 += 1;
        }
        if correct {
            entry.0 += 1;
        }
    }

    fn iter(&self) -> impl Iterator<Item = (&String, (u32, u32, u32))> + '_ {
        self.order
            .iter()
            .filter_map(|label| self.counts.get(label).map(|c| (label, *c)))
    }
}

/// Score a submission against the session's items.
///
/// Answers for ids outside `items` are ignored here; the caller rejects them first.
pub fn score(
    kind: ContentKind,
    items: &[GeneratedItem],
    answers: &BTreeMap<String, String>,
) -> ScoreReport {
    let mut sections = Tally::default();
    let mut categories = Tally::default();

    for item in items {
        let answer = answers.get(&item.id);
        let correct = is_correct(item, answer);
        sections.add(&item.section, answer.is_some(), correct);
        categories.add(&item.category, answer.is_some(), correct);
    }

    let section_scores: Vec<SectionScore> = match kind {
        ContentKind::Exam => sections
            .iter()
            .map(|(section, (correct, _, total))| SectionScore {
                section: section.clone(),
                correct,
                total,
                score: percentage(correct, total),
            })
            .collect(),
        ContentKind::Practice => {
            let correct = items.iter().filter(|i| is_correct(i, answers.get(&i.id))).count() as u32;
            let total = items.len() as u32;
            let label = items
                .first()
                .map(|i| i.section.clone())
                .unwrap_or_else(|| "practice".to_string());
            vec![SectionScore {
                section: label,
                correct,
                total,
                score: percentage(correct, total),
            }]
        }
    };

    let overall_score = if section_scores.is_empty() {
        0.0
    } else {
        round2(section_scores.iter().map(|s| s.score).sum::<f64>() / section_scores.len() as f64)
    };

    let category_scores: Vec<CategoryScore> = categories
        .iter()
        .map(|(category, (correct, attempted, total))| CategoryScore {
            category: category.clone(),
            correct,
            attempted,
            total,
            score: (attempted > 0).then(|| percentage(correct, total)),
        })
        .collect();

    let (strengths, weaknesses) = highlights(&category_scores, overall_score);
    let guidance = guidance(overall_score, &strengths, &weaknesses);

    ScoreReport {
        overall_score,
        section_scores,
        category_scores,
        strengths,
        weaknesses,
        guidance,
    }
}

/// Split attempted categories around the overall score.
///
/// Ties keep declaration order because both sorts are stable.
fn highlights(categories: &[CategoryScore], overall: f64) -> (Vec<Highlight>, Vec<Highlight>) {
    let scored: Vec<Highlight> = categories
        .iter()
        .filter_map(|c| {
            c.score.map(|score| Highlight {
                category: c.category.clone(),
                score,
            })
        })
        .collect();

    let mut strengths: Vec<Highlight> = scored.iter().filter(|h| h.score >= overall).cloned().collect();
    strengths.sort_by(|a, b| b.score.total_cmp(&a.score));
    strengths.truncate(MAX_HIGHLIGHTS);

    let mut weaknesses: Vec<Highlight> = scored.into_iter().filter(|h| h.score < overall).collect();
    weaknesses.sort_by(|a, b| a.score.total_cmp(&b.score));
    weaknesses.truncate(MAX_HIGHLIGHTS);

    (strengths, weaknesses)
}

fn guidance(overall: f64, strengths: &[Highlight], weaknesses: &[Highlight]) -> String {
    let mut text = match overall {
        s if s >= 85.0 => "Excellent work. You are performing at a test-ready level.".to_string(),
        s if s >= 70.0 => "Solid result. A little targeted review should push you higher.".to_string(),
        s if s >= 50.0 => "You have a foundation to build on. Focus your next sessions on your weakest areas.".to_string(),
        _ => "Start with the fundamentals and work through short practice sets before the next full exam.".to_string(),
    };

    if !weaknesses.is_empty() {
        let names: Vec<&str> = weaknesses.iter().map(|w| w.category.as_str()).collect();
        text.push_str(&format!(" Review next: {}.", names.join(", ")));
    }
    if let Some(best) = strengths.first() {
        text.push_str(&format!(" Strongest area: {}.", best.category));
    }

    text
}
