//! Job folders: named administrative groupings of jobs and optimizing jobs.

use serde::{Deserialize, Serialize};

/// Name of the implicit default folder. Records with no folder live here.
pub const DEFAULT_FOLDER: &str = "";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFolder {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Whether the folder is visible when the admin layer runs read-only.
    /// Carried for the admin layer; the core never branches on it.
    #[serde(default)]
    pub display_in_read_only_mode: bool,
}

impl JobFolder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            display_in_read_only_mode: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_hidden_in_read_only_mode() {
        let folder = JobFolder::new("nightly");
        assert_eq!(folder.name, "nightly");
        assert!(!folder.display_in_read_only_mode);
    }
}
