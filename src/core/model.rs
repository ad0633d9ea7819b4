use serde::{Deserialize, Serialize};

/// Mime type Drive uses to mark a folder.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFolder {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    #[serde(default)]
    pub parent_ids: Vec<String>,
}

impl RemoteFolder {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// Drive omits the size for native Google documents.
    pub size: Option<u64>,
}

/// One row of a folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEntry {
    Folder(RemoteFolder),
    File(RemoteFile),
}

impl RemoteEntry {
    pub fn id(&self) -> &str {
        match self {
            RemoteEntry::Folder(f) => &f.id,
            RemoteEntry::File(f) => &f.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RemoteEntry::Folder(f) => &f.name,
            RemoteEntry::File(f) => &f.name,
        }
    }
}

/// Splits a listing into (files, folders), keeping listing order within each.
pub fn partition_entries(entries: Vec<RemoteEntry>) -> (Vec<RemoteFile>, Vec<RemoteFolder>) {
    let mut files = Vec::new();
    let mut folders = Vec::new();
    for entry in entries {
        match entry {
            RemoteEntry::File(f) => files.push(f),
            RemoteEntry::Folder(f) => folders.push(f),
        }
    }
    (files, folders)
}

/// Outcome of copying one folder node.
///
/// `items_copied` counts files across the whole subtree while `subfolders`
/// only counts direct children that were copied successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyResult {
    /// Id of the folder created at the destination.
    pub folder_id: String,
    pub folder_name: String,
    pub items_copied: usize,
    pub subfolders: usize,
    pub errors: Vec<String>,
}

impl CopyResult {
    pub fn new(folder_id: impl Into<String>, folder_name: impl Into<String>) -> Self {
        Self {
            folder_id: folder_id.into(),
            folder_name: folder_name.into(),
            ..Default::default()
        }
    }

    /// Folds a completed direct subfolder into this result.
    pub fn absorb_subfolder(&mut self, child: CopyResult) {
        self.subfolders += 1;
        self.items_copied += child.items_copied;
        self.errors.extend(child.errors);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCopyResult {
    pub total_folders: usize,
    pub completed_folders: usize,
    pub total_files: usize,
    pub total_subfolders: usize,
    pub errors: Vec<String>,
    pub folder_results: Vec<CopyResult>,
}

impl BatchCopyResult {
    pub fn new(total_folders: usize) -> Self {
        Self {
            total_folders,
            ..Default::default()
        }
    }

    pub fn record_success(&mut self, result: CopyResult) {
        self.completed_folders += 1;
        self.total_files += result.items_copied;
        self.total_subfolders += result.subfolders;
        self.errors.extend(result.errors.iter().cloned());
        self.folder_results.push(result);
    }

    pub fn record_failure(&mut self, message: String) {
        self.errors.push(message);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessErrorKind {
    NotFound,
    PermissionDenied,
    AuthError,
    DataError,
    Unknown,
}

impl AccessErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessErrorKind::NotFound => "not_found",
            AccessErrorKind::PermissionDenied => "permission_denied",
            AccessErrorKind::AuthError => "auth_error",
            AccessErrorKind::DataError => "data_error",
            AccessErrorKind::Unknown => "unknown",
        }
    }

    /// Guesses the failure class from an error's text.
    ///
    /// Drive errors are not structured by the time they reach us, so this
    /// looks for status codes and well-known phrases in the rendered message.
    pub fn classify(reason: &str) -> Self {
        let reason = reason.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| reason.contains(n));

        if has(&["404", "not found"]) {
            AccessErrorKind::NotFound
        } else if has(&["403", "forbidden"]) {
            AccessErrorKind::PermissionDenied
        } else if has(&["401", "unauthorized", "unauthenticated"]) {
            AccessErrorKind::AuthError
        } else if has(&["incomplete", "corrupted"]) {
            AccessErrorKind::DataError
        } else {
            AccessErrorKind::Unknown
        }
    }

    /// User-facing explanation for the failure class.
    pub fn describe(&self) -> &'static str {
        match self {
            AccessErrorKind::NotFound => {
                "Folder not found or not accessible. It may be in a different account or not properly shared."
            }
            AccessErrorKind::PermissionDenied => {
                "Permission denied. You may not have access to this folder or it may have limited access restrictions."
            }
            AccessErrorKind::AuthError => "Authentication error. Please re-authorize the Drive token.",
            AccessErrorKind::DataError => {
                "Folder data is incomplete - this may be a shared folder with limited metadata access."
            }
            AccessErrorKind::Unknown => "Unknown error occurred",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessCheck {
    pub has_access: bool,
    pub folder: Option<RemoteFolder>,
    pub error_type: Option<AccessErrorKind>,
    pub message: String,
}

impl AccessCheck {
    pub fn granted(folder: RemoteFolder) -> Self {
        let message = format!("Access verified for folder: {}", folder.name);
        Self {
            has_access: true,
            folder: Some(folder),
            error_type: None,
            message,
        }
    }

    /// Builds a denied result from the raw failure text.
    ///
    /// Unclassified failures keep the raw text as their message.
    pub fn denied(reason: &str) -> Self {
        let kind = AccessErrorKind::classify(reason);
        let message = match kind {
            AccessErrorKind::Unknown if !reason.trim().is_empty() => reason.to_string(),
            _ => kind.describe().to_string(),
        };
        Self {
            has_access: false,
            folder: None,
            error_type: Some(kind),
            message,
        }
    }
}
