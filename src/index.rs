use std::collections::{HashMap, HashSet};

use crate::{destination::Allocation, error::SetupError};

/// How a source object relates to what the destination already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMatch {
    Missing,
    /// Present with the same size.
    Present,
    /// Present, but the recorded size differs from the source.
    SizeMismatch { recorded: u64 },
}

/// Destination path to previously stored size, built once per run.
#[derive(Debug, Clone, Default)]
pub struct ExistingFileIndex {
    files: HashMap<String, u64>,
}

impl ExistingFileIndex {
    /// Walks the allocation's file tree once, ignoring `excluded` names.
    ///
    /// # Errors
    ///
    /// Any failure is fatal to the run: migrating without knowing what
    /// already exists would re-upload everything.
    pub async fn build(
        allocation: &dyn Allocation,
        excluded: &[String],
    ) -> Result<Self, SetupError> {
        let excluded: HashSet<String> = excluded
            .iter()
            .map(|name| name.trim_end_matches('/').to_string())
            .collect();

        let files = allocation
            .list_file_tree(&excluded)
            .await
            .map_err(SetupError::IndexBuild)?;

        tracing::info!(
            allocation = allocation.id(),
            files = files.len(),
            "built existing file index."
        );
        Ok(Self {
            files: files.into_iter().collect(),
        })
    }

    #[must_use]
    pub fn lookup(&self, path: &str, size: u64) -> IndexMatch {
        match self.files.get(path) {
            None => IndexMatch::Missing,
            Some(&recorded) if recorded == size => IndexMatch::Present,
            Some(&recorded) => IndexMatch::SizeMismatch { recorded },
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FromIterator<(String, u64)> for ExistingFileIndex {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self {
            files: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let index: ExistingFileIndex = [("/b1/a.txt".to_string(), 10)].into_iter().collect();
        assert_eq!(index.lookup("/b1/a.txt", 10), IndexMatch::Present);
        assert_eq!(
            index.lookup("/b1/a.txt", 12),
            IndexMatch::SizeMismatch { recorded: 10 }
        );
        assert_eq!(index.lookup("/b1/b.txt", 10), IndexMatch::Missing);
        assert_eq!(index.len(), 1);
    }
}
