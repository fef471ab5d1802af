use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read dataset {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where the problem's input dataset comes from
pub trait DatasetSource {
    fn fetch(&self) -> Result<String, DatasetError>;
}

/// Dataset already downloaded to disk
#[derive(Debug, Clone)]
pub struct FileDataset {
    path: PathBuf,
}

impl FileDataset {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl DatasetSource for FileDataset {
    fn fetch(&self) -> Result<String, DatasetError> {
        fs::read_to_string(&self.path).map_err(|source| DatasetError::Read {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reads_dataset_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dna_dataset.txt");
        fs::write(&path, "AGCTTTTCATTCTGACTGCA\n").unwrap();
        assert_eq!(
            FileDataset::new(&path).fetch().unwrap(),
            "AGCTTTTCATTCTGACTGCA\n"
        );
    }

    #[test]
    fn missing_dataset_names_the_path() {
        let err = FileDataset::new("/nonexistent/timebox.txt")
            .fetch()
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/timebox.txt"));
    }
}
