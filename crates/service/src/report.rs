//! CSV report generation for membership history.
//!
//! Reports are written to a configured directory under a unique file name
//! and exposed through a download URL built from explicit configuration.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use cohort_core::types::HistoryRecord;
use cohort_core::{CohortError, CohortResult};

const CSV_HEADER: &str = "user_id,segment_slug,operation,executed_at";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A generated report: the file on disk plus its public download link.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Report {
    pub file_name: String,
    pub url: String,
}

pub struct ReportWriter {
    dir: PathBuf,
    /// Scheme+host+port prefix for download links, e.g. `http://localhost:8080`.
    public_base: String,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            public_base: public_base.into(),
        }
    }

    /// Render the records as CSV and persist them under a unique name.
    pub fn write(&self, user_id: i64, records: &[HistoryRecord]) -> CohortResult<Report> {
        std::fs::create_dir_all(&self.dir)?;

        let file_name = format!("{}-{}.csv", user_id, Uuid::new_v4());
        let mut contents = String::with_capacity(64 * (records.len() + 1));
        contents.push_str(CSV_HEADER);
        contents.push('\n');
        for record in records {
            contents.push_str(&format!(
                "{},{},{},{}\n",
                record.user_id,
                csv_field(&record.segment_slug),
                record.operation,
                record.executed_at.format(TIMESTAMP_FORMAT),
            ));
        }

        std::fs::write(self.dir.join(&file_name), contents)?;

        let url = format!("{}/segment/reports/{}", self.public_base, file_name);
        Ok(Report { file_name, url })
    }

    /// Resolve a report file name to its on-disk path, rejecting anything
    /// that could escape the reports directory.
    pub fn resolve(&self, file_name: &str) -> CohortResult<PathBuf> {
        if file_name.is_empty()
            || file_name.contains(['/', '\\'])
            || file_name.contains("..")
        {
            return Err(CohortError::Invalid(format!(
                "bad report file name: {file_name}"
            )));
        }
        Ok(self.dir.join(file_name))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Quote a CSV field when it contains a delimiter, quote or newline.
fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;
    use cohort_core::types::MembershipOp;

    fn record(slug: &str) -> HistoryRecord {
        HistoryRecord {
            user_id: 42,
            segment_slug: slug.to_string(),
            operation: MembershipOp::Added,
            executed_at: Utc.with_ymd_and_hms(2023, 8, 31, 12, 30, 45).unwrap(),
        }
    }

    #[test]
    fn writes_header_and_formatted_rows() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path(), "http://localhost:8080");

        let report = writer.write(42, &[record("promo")]).unwrap();
        let contents = std::fs::read_to_string(dir.path().join(&report.file_name)).unwrap();

        assert_eq!(
            contents,
            "user_id,segment_slug,operation,executed_at\n42,promo,added,2023-08-31 12:30:45\n"
        );
        assert!(report.url.starts_with("http://localhost:8080/segment/reports/"));
        assert!(report.url.ends_with(".csv"));
    }

    #[test]
    fn quotes_awkward_slugs() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path(), "http://localhost:8080");

        let report = writer.write(42, &[record("a,b\"c")]).unwrap();
        let contents = std::fs::read_to_string(dir.path().join(&report.file_name)).unwrap();
        assert!(contents.contains("\"a,b\"\"c\""));
    }

    #[test]
    fn file_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path(), "http://localhost:8080");

        let a = writer.write(42, &[]).unwrap();
        let b = writer.write(42, &[]).unwrap();
        assert_ne!(a.file_name, b.file_name);
    }

    #[test]
    fn resolve_rejects_path_traversal() {
        let writer = ReportWriter::new("/tmp/reports", "http://localhost:8080");
        assert!(writer.resolve("../etc/passwd").is_err());
        assert!(writer.resolve("a/b.csv").is_err());
        assert!(writer.resolve("").is_err());
        assert!(writer.resolve("42-abc.csv").is_ok());
    }
}
