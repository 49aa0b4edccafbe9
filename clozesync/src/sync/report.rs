use std::fmt;

use super::remote::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    Parse,
    ExternalTool,
    RemoteUnavailable,
    RemoteRejected,
    RemoteNotFound,
    WriteBack,
    Io,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::Parse => "parse",
            IssueKind::ExternalTool => "external-tool",
            IssueKind::RemoteUnavailable => "remote-unavailable",
            IssueKind::RemoteRejected => "remote-rejected",
            IssueKind::RemoteNotFound => "remote-not-found",
            IssueKind::WriteBack => "write-back",
            IssueKind::Io => "io",
        }
    }
}

impl From<&RemoteError> for IssueKind {
    fn from(err: &RemoteError) -> Self {
        match err {
            RemoteError::Unavailable(_) => IssueKind::RemoteUnavailable,
            RemoteError::Rejected(_) => IssueKind::RemoteRejected,
            RemoteError::NotFound(_) => IssueKind::RemoteNotFound,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIssue {
    pub path: String,
    /// Card position, `None` for file-scoped issues.
    pub position: Option<usize>,
    pub kind: IssueKind,
    pub message: String,
}

impl RunIssue {
    pub fn file(path: impl Into<String>, kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            position: None,
            kind,
            message: message.into(),
        }
    }

    pub fn unit(
        path: impl Into<String>,
        position: usize,
        kind: IssueKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            position: Some(position),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RunIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(position) => write!(f, "{} card {}", self.path, position + 1)?,
            None => write!(f, "{}", self.path)?,
        }
        write!(f, " [{}] {}", self.kind.as_str(), self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Candidates left for the deletion prompt.
    pub orphaned: usize,
    pub deleted: usize,
    /// Stale entries dropped because their note moved to another card.
    pub released: usize,
    /// Entries dropped because their note was already gone remotely.
    pub pruned: usize,
    pub processed_files: usize,
    pub skipped_files: usize,
    pub failed_files: usize,
    pub issues: Vec<RunIssue>,
    /// Set when the remote store stayed unavailable and remaining calls were
    /// abandoned.
    pub halted: bool,
    pub cancelled: bool,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty() && !self.halted && !self.cancelled
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "created {}, updated {}, unchanged {}, orphaned {}, deleted {}",
            self.created, self.updated, self.unchanged, self.orphaned, self.deleted
        )?;
        writeln!(
            f,
            "files: {} processed, {} unchanged, {} failed",
            self.processed_files, self.skipped_files, self.failed_files
        )?;
        if self.released > 0 || self.pruned > 0 {
            writeln!(
                f,
                "cache: {} moved entries released, {} stale entries pruned",
                self.released, self.pruned
            )?;
        }
        if self.halted {
            writeln!(f, "run halted: remote store unavailable")?;
        }
        if self.cancelled {
            writeln!(f, "run cancelled")?;
        }
        for issue in &self.issues {
            writeln!(f, "  {issue}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_counts_and_issues() {
        let report = RunReport {
            created: 2,
            unchanged: 1,
            processed_files: 1,
            issues: vec![RunIssue::unit(
                "test.md",
                2,
                IssueKind::RemoteRejected,
                "invalid deck",
            )],
            ..RunReport::default()
        };

        let text = report.to_string();
        assert!(text.starts_with("created 2, updated 0, unchanged 1, orphaned 0, deleted 0\n"));
        assert!(text.contains("  test.md card 3 [remote-rejected] invalid deck"));
        assert!(!report.is_clean());
    }

    #[test]
    fn remote_errors_map_to_issue_kinds() {
        use clozesync_core::NoteId;
        assert_eq!(
            IssueKind::from(&RemoteError::NotFound(NoteId(1))),
            IssueKind::RemoteNotFound
        );
        assert_eq!(
            IssueKind::from(&RemoteError::Unavailable(String::new())),
            IssueKind::RemoteUnavailable
        );
    }
}
