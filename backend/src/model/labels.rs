use shared::UNRELATED_CLASS;
use std::collections::HashSet;

/// HAM10000 lesion types in the order of the bundled model's output layer.
const DEFAULT_LABELS: [(&str, &str); 7] = [
    ("nv", "Melanocytic nevi"),
    ("mel", "Melanoma"),
    ("bkl", "Benign keratosis-like lesions"),
    ("bcc", "Basal cell carcinoma"),
    ("akiec", "Actinic keratoses"),
    ("vasc", "Vascular lesions"),
    ("df", "Dermatofibroma"),
];

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum LabelError {
    #[error("label list is empty")]
    Empty,
    #[error("entry {0} is blank")]
    BlankEntry(usize),
    #[error("duplicate label code '{0}'")]
    Duplicate(String),
    #[error("label code '{0}' is reserved for low-confidence results")]
    Reserved(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub code: String,
    pub description: String,
}

/// Ordered class labels; index `i` names output `i` of the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTable {
    labels: Vec<Label>,
}

impl Default for LabelTable {
    fn default() -> Self {
        Self {
            labels: DEFAULT_LABELS
                .iter()
                .map(|(code, description)| Label {
                    code: code.to_string(),
                    description: description.to_string(),
                })
                .collect(),
        }
    }
}

impl LabelTable {
    /// Parses a comma-separated list. Each entry is either `code:Description`
    /// or a bare description that doubles as its code.
    pub fn parse(raw: &str) -> Result<Self, LabelError> {
        if raw.trim().is_empty() {
            return Err(LabelError::Empty);
        }

        let mut seen = HashSet::new();
        let mut labels = Vec::new();
        for (index, entry) in raw.split(',').enumerate() {
            let entry = entry.trim();
            let (code, description) = match entry.split_once(':') {
                Some((code, description)) => (code.trim(), description.trim()),
                None => (entry, entry),
            };
            if code.is_empty() || description.is_empty() {
                return Err(LabelError::BlankEntry(index));
            }
            if code.eq_ignore_ascii_case(UNRELATED_CLASS) {
                return Err(LabelError::Reserved(code.to_string()));
            }
            if !seen.insert(code.to_string()) {
                return Err(LabelError::Duplicate(code.to_string()));
            }
            labels.push(Label {
                code: code.to_string(),
                description: description.to_string(),
            });
        }

        Ok(Self { labels })
    }

    pub(crate) fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn get(&self, index: usize) -> Option<&Label> {
        self.labels.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.labels.iter()
    }
}
