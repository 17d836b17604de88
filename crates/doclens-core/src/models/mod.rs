//! Wire models for the document-intelligence backend.
//!
//! This module contains the data structures exchanged with the backend:
//!
//! - `User`, `CreatedUser`, `TokenResponse`: identity and login payloads
//! - `FolderTree`, `FolderNode`, `FileEntry`: the file browser tree
//! - `UsagePeriod`, `UsageMetrics`: credit and call metering
//! - `KnowledgeBase`, `NewKnowledgeBase`: named file groupings
//! - `ChatRequest`, `ChatReply`: the chat interface

pub mod chat;
pub mod folder;
pub mod knowledge_base;
pub mod usage;
pub mod user;

pub use chat::{ChatReply, ChatRequest};
pub use folder::{FileEntry, FolderNode, FolderTree, NewFolder};
pub use knowledge_base::{KnowledgeBase, NewKnowledgeBase};
pub use usage::{UsageMetrics, UsagePeriod};
pub use user::{CreatedUser, TokenResponse, User};
