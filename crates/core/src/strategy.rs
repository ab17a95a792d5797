//! Learned strategies.
//!
//! A strategy is a short piece of advice distilled from a tool-call sequence
//! that worked. Strategies are only ever tagged after creation, never edited
//! or deleted automatically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub category: String,
    pub text: String,
    #[serde(default)]
    pub helpful: u32,
    #[serde(default)]
    pub harmful: u32,
    pub created_at: DateTime<Utc>,
}

impl Strategy {
    pub fn new(category: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            category: category.into(),
            text: text.into(),
            helpful: 0,
            harmful: 0,
            created_at: Utc::now(),
        }
    }

    /// Net usefulness; higher ranks first.
    pub fn score(&self) -> i64 {
        i64::from(self.helpful) - i64::from(self.harmful)
    }

    fn same_advice(&self, other: &Strategy) -> bool {
        self.category == other.category && self.text == other.text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyTag {
    Helpful,
    Harmful,
}

/// An ordered collection of strategies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyBook {
    strategies: Vec<Strategy>,
}

impl StrategyBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a strategy. When the same advice already exists it is tagged
    /// helpful instead, and the existing id is returned.
    pub fn add(&mut self, strategy: Strategy) -> String {
        if let Some(existing) = self.strategies.iter_mut().find(|s| s.same_advice(&strategy)) {
            existing.helpful += 1;
            return existing.id.clone();
        }
        let id = strategy.id.clone();
        self.strategies.push(strategy);
        id
    }

    /// Tag a strategy. Returns false when the id is unknown.
    pub fn tag(&mut self, id: &str, tag: StrategyTag) -> bool {
        match self.strategies.iter_mut().find(|s| s.id == id) {
            Some(s) => {
                match tag {
                    StrategyTag::Helpful => s.helpful += 1,
                    StrategyTag::Harmful => s.harmful += 1,
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Strategy> {
        self.strategies.iter().find(|s| s.id == id)
    }

    pub fn find(&self, category: &str, text: &str) -> Option<&Strategy> {
        self.strategies
            .iter()
            .find(|s| s.category == category && s.text == text)
    }

    /// The `n` most useful strategies; ties go to the older entry.
    pub fn top(&self, n: usize) -> Vec<&Strategy> {
        let mut ranked: Vec<&Strategy> = self.strategies.iter().collect();
        ranked.sort_by(|a, b| {
            b.score()
                .cmp(&a.score())
                .then(b.helpful.cmp(&a.helpful))
                .then(a.created_at.cmp(&b.created_at))
        });
        ranked.truncate(n);
        ranked
    }

    /// Fold another book in, keeping the higher counts for shared advice.
    pub fn merge(&mut self, other: &StrategyBook) {
        for theirs in &other.strategies {
            match self.strategies.iter_mut().find(|s| s.same_advice(theirs)) {
                Some(ours) => {
                    ours.helpful = ours.helpful.max(theirs.helpful);
                    ours.harmful = ours.harmful.max(theirs.harmful);
                }
                None => self.strategies.push(theirs.clone()),
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Strategy> {
        self.strategies.iter()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}
