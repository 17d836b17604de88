use serde::{Deserialize, Serialize};

use crate::utils::{format_bytes, format_date};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct FileEntry {
    pub id: i64,
    #[serde(alias = "name", alias = "original_filename")]
    pub filename: String,
    #[serde(default, alias = "file_size")]
    pub size: Option<u64>,
    #[serde(default)]
    pub folder_id: Option<i64>,
    #[serde(default, alias = "created_at")]
    pub uploaded_at: Option<String>,
}

impl FileEntry {
    pub fn size_display(&self) -> String {
        match self.size {
            Some(size) => format_bytes(size),
            None => "-".to_string(),
        }
    }

    pub fn uploaded_display(&self) -> String {
        self.uploaded_at
            .as_deref()
            .map(format_date)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct FolderNode {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub children: Vec<FolderNode>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

impl FolderNode {
    fn find(&self, id: i64) -> Option<&FolderNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    fn file_count(&self) -> usize {
        self.files.len() + self.children.iter().map(FolderNode::file_count).sum::<usize>()
    }

    fn folder_count(&self) -> usize {
        1 + self.children.iter().map(FolderNode::folder_count).sum::<usize>()
    }

    fn walk<'a>(&'a self, depth: usize, out: &mut Vec<(usize, &'a FolderNode)>) {
        out.push((depth, self));
        for child in &self.children {
            child.walk(depth + 1, out);
        }
    }
}

/// Wire shapes accepted for `/folders/tree`: a bare list of root folders,
/// or an object that also carries files stored outside any folder.
#[derive(Deserialize)]
#[serde(untagged)]
enum TreeWire {
    Folders(Vec<FolderNode>),
    Full {
        #[serde(default)]
        folders: Vec<FolderNode>,
        #[serde(default)]
        files: Vec<FileEntry>,
    },
}

impl From<TreeWire> for FolderTree {
    fn from(wire: TreeWire) -> Self {
        match wire {
            TreeWire::Folders(folders) => FolderTree {
                folders,
                files: Vec::new(),
            },
            TreeWire::Full { folders, files } => FolderTree { folders, files },
        }
    }
}

/// The user's folder hierarchy with root-level files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "TreeWire")]
pub struct FolderTree {
    pub folders: Vec<FolderNode>,
    pub files: Vec<FileEntry>,
}

impl FolderTree {
    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.files.is_empty()
    }

    pub fn find_folder(&self, id: i64) -> Option<&FolderNode> {
        self.folders.iter().find_map(|folder| folder.find(id))
    }

    /// Total number of files, including root-level files.
    pub fn file_count(&self) -> usize {
        self.files.len() + self.folders.iter().map(FolderNode::file_count).sum::<usize>()
    }

    pub fn folder_count(&self) -> usize {
        self.folders.iter().map(FolderNode::folder_count).sum()
    }

    /// Depth-first walk of every folder, paired with its nesting depth.
    pub fn walk(&self) -> Vec<(usize, &FolderNode)> {
        let mut out = Vec::new();
        for folder in &self.folders {
            folder.walk(0, &mut out);
        }
        out
    }
}

/// Body for `POST /folders`.
#[derive(Debug, Clone, Serialize)]
pub struct NewFolder {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const TREE_JSON: &str = r#"[
        {"id": 1, "name": "Contracts", "parent_id": null,
         "children": [
            {"id": 3, "name": "2024", "parent_id": 1, "children": [],
             "files": [{"id": 11, "filename": "lease.pdf", "size": 2048, "folder_id": 3}]}
         ],
         "files": [{"id": 10, "filename": "nda.pdf", "folder_id": 1}]},
        {"id": 2, "name": "Invoices"}
    ]"#;

    #[test]
    fn test_parse_bare_folder_list() {
        let tree: FolderTree = serde_json::from_str(TREE_JSON).expect("tree should parse");
        assert_eq!(tree.folders.len(), 2);
        assert!(tree.files.is_empty());
        assert_eq!(tree.folder_count(), 3);
        assert_eq!(tree.file_count(), 2);
    }

    #[test]
    fn test_parse_tree_with_root_files() {
        let json = r#"{"folders": [{"id": 5, "name": "Notes"}],
                       "files": [{"id": 9, "name": "readme.txt", "file_size": 12}]}"#;
        let tree: FolderTree = serde_json::from_str(json).expect("tree should parse");
        assert_eq!(tree.folders.len(), 1);
        assert_eq!(tree.files[0].filename, "readme.txt");
        assert_eq!(tree.files[0].size, Some(12));
        assert_eq!(tree.file_count(), 1);
    }

    #[test]
    fn test_find_and_walk() {
        let tree: FolderTree = serde_json::from_str(TREE_JSON).expect("tree should parse");
        assert_eq!(tree.find_folder(3).map(|f| f.name.as_str()), Some("2024"));
        assert!(tree.find_folder(99).is_none());

        let walked: Vec<(usize, &str)> = tree
            .walk()
            .into_iter()
            .map(|(depth, folder)| (depth, folder.name.as_str()))
            .collect();
        assert_eq!(walked, vec![(0, "Contracts"), (1, "2024"), (0, "Invoices")]);
    }

    #[test]
    fn test_file_display_helpers() {
        let file = FileEntry {
            id: 1,
            filename: "report.pdf".to_string(),
            size: Some(1536),
            folder_id: None,
            uploaded_at: Some("2024-03-05T10:00:00Z".to_string()),
        };
        assert_eq!(file.size_display(), "1.5 KB");
        assert_eq!(file.uploaded_display(), "Mar 05, 2024");
    }
}
