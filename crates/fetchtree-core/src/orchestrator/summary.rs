use serde::Serialize;
use std::time::Duration;

use crate::errors::Failure;
use crate::work::CompletedFile;

/// Summary of one fetch run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FetchSummary {
    pub files: usize,
    pub complete_files: usize,
    pub incomplete_files: usize,
    pub total_bytes: u64,
    pub parts: usize,
    pub failures: usize,
    #[serde(serialize_with = "as_millis")]
    pub duration: Duration,
}

impl FetchSummary {
    pub fn from_results(files: &[CompletedFile], failures: &[Failure], duration: Duration) -> Self {
        let complete_files = files.iter().filter(|f| f.is_complete()).count();
        Self {
            files: files.len(),
            complete_files,
            incomplete_files: files.len() - complete_files,
            total_bytes: files
                .iter()
                .filter(|f| f.is_complete())
                .map(|f| f.size)
                .sum(),
            parts: files.iter().map(|f| f.parts.len()).sum(),
            failures: failures.len(),
            duration,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures == 0 && self.incomplete_files == 0
    }

    /// Throughput over complete files, in bytes per second.
    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.total_bytes as f64 / secs
        } else {
            0.0
        }
    }
}

fn as_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}
