use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub knowledge_base_id: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub file_ids: Vec<i64>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            knowledge_base_id: None,
            file_ids: Vec::new(),
        }
    }

    pub fn with_knowledge_base(mut self, id: i64) -> Self {
        self.knowledge_base_id = Some(id);
        self
    }

    pub fn with_files(mut self, file_ids: Vec<i64>) -> Self {
        self.file_ids = file_ids;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ChatReply {
    #[serde(alias = "answer")]
    pub response: String,
    #[serde(default)]
    pub credits_used: Option<f64>,
}
