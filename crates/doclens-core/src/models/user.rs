use serde::{Deserialize, Serialize};

/// The authenticated identity returned by `/auth/users/me`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub credits: f64,
}

impl User {
    pub fn credits_display(&self) -> String {
        crate::utils::format_credits(self.credits)
    }
}

/// Record returned by `/auth/register`. Registration does not sign the user in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct CreatedUser {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub is_verified: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "bearer".to_string()
}
