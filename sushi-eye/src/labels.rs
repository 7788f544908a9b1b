//! Class label table

use crate::error::VisionError;
use serde::{Deserialize, Serialize};

/// Sushi categories in the model's training-time class order.
///
/// Romanized so overlays and terminal output stay ASCII; the model was
/// trained against the Japanese names in [`SUSHI_LABELS_JA`].
pub const SUSHI_LABELS: &[&str] = &["ikura", "maguro", "ika", "uni", "tamago", "ebi"];

/// Japanese names, position for position with [`SUSHI_LABELS`].
pub const SUSHI_LABELS_JA: &[&str] = &["いくら", "マグロ", "いか", "うに", "たまご", "えび"];

/// Japanese name of a romanized sushi label.
pub fn japanese_name(label: &str) -> Option<&'static str> {
    SUSHI_LABELS
        .iter()
        .position(|l| *l == label)
        .and_then(|i| SUSHI_LABELS_JA.get(i).copied())
}

/// How raw class indices emitted by the model map onto the label table.
///
/// Some exported detection graphs number classes from 1 (0 reserved for
/// background), others from 0. The convention is a property of the model
/// and must be pinned per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClassIndexBase {
    /// `labels[class_index]`
    #[default]
    Zero,
    /// `labels[class_index - 1]`
    One,
}

/// Fixed, ordered list of category names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTable {
    labels: Vec<String>,
    base: ClassIndexBase,
}

impl LabelTable {
    pub fn new(labels: Vec<String>, base: ClassIndexBase) -> Result<Self, VisionError> {
        if labels.is_empty() {
            return Err(VisionError::Config("label table is empty".to_string()));
        }
        for (i, label) in labels.iter().enumerate() {
            if label.trim().is_empty() {
                return Err(VisionError::Config(format!("label {} is blank", i)));
            }
            if labels[..i].contains(label) {
                return Err(VisionError::Config(format!("duplicate label '{}'", label)));
            }
        }
        Ok(Self { labels, base })
    }

    /// The six sushi categories, zero-based.
    pub fn sushi() -> Self {
        Self {
            labels: SUSHI_LABELS.iter().map(|s| s.to_string()).collect(),
            base: ClassIndexBase::Zero,
        }
    }

    pub fn base(&self) -> ClassIndexBase {
        self.base
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    /// Resolve a raw model class index to its label.
    pub fn resolve(&self, class_index: usize) -> Option<&str> {
        let slot = match self.base {
            ClassIndexBase::Zero => Some(class_index),
            ClassIndexBase::One => class_index.checked_sub(1),
        }?;
        self.labels.get(slot).map(String::as_str)
    }

    /// Raw class index the model emits for `labels[position]`.
    pub fn class_index_of(&self, position: usize) -> Option<usize> {
        if position >= self.labels.len() {
            return None;
        }
        Some(match self.base {
            ClassIndexBase::Zero => position,
            ClassIndexBase::One => position + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(base: ClassIndexBase) -> LabelTable {
        LabelTable::new(SUSHI_LABELS.iter().map(|s| s.to_string()).collect(), base).unwrap()
    }

    #[test]
    fn test_japanese_names_line_up() {
        assert_eq!(SUSHI_LABELS.len(), SUSHI_LABELS_JA.len());
        assert_eq!(japanese_name("ikura"), Some("いくら"));
        assert_eq!(japanese_name("maguro"), Some("マグロ"));
        assert_eq!(japanese_name("ebi"), Some("えび"));
        assert_eq!(japanese_name("salmon"), None);
    }

    #[test]
    fn test_zero_based_resolution() {
        let t = table(ClassIndexBase::Zero);
        assert_eq!(t.resolve(0), Some("ikura"));
        assert_eq!(t.resolve(5), Some("ebi"));
        assert_eq!(t.resolve(6), None);
    }

    #[test]
    fn test_one_based_resolution() {
        let t = table(ClassIndexBase::One);
        assert_eq!(t.resolve(0), None);
        assert_eq!(t.resolve(1), Some("ikura"));
        assert_eq!(t.resolve(6), Some("ebi"));
        assert_eq!(t.resolve(7), None);
    }

    #[test]
    fn test_class_index_of_inverts_resolve() {
        for base in [ClassIndexBase::Zero, ClassIndexBase::One] {
            let t = table(base);
            for (pos, label) in SUSHI_LABELS.iter().enumerate() {
                let idx = t.class_index_of(pos).unwrap();
                assert_eq!(t.resolve(idx), Some(*label));
            }
            assert_eq!(t.class_index_of(6), None);
        }
    }

    #[test]
    fn test_rejects_empty_blank_and_duplicate() {
        assert!(LabelTable::new(vec![], ClassIndexBase::Zero).is_err());
        assert!(LabelTable::new(vec!["a".into(), " ".into()], ClassIndexBase::Zero).is_err());
        assert!(LabelTable::new(vec!["a".into(), "a".into()], ClassIndexBase::Zero).is_err());
    }

    #[test]
    fn test_sushi_table_order() {
        let t = LabelTable::sushi();
        assert_eq!(t.len(), 6);
        assert_eq!(t.iter().collect::<Vec<_>>(), SUSHI_LABELS);
    }
}
