use serde::{Deserialize, Serialize};

/// A named grouping of previously uploaded files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct KnowledgeBase {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub file_ids: Vec<i64>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewKnowledgeBase {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub file_ids: Vec<i64>,
}

impl NewKnowledgeBase {
    pub fn new(name: impl Into<String>, file_ids: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            description: None,
            file_ids,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
