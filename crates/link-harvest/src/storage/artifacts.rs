//! Result artifacts: serialized result tables addressed by a stable reference

use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{ResultHeader, ResultRecord};

/// Destination for a finished job's results
///
/// `write` must be idempotent: writing the same records for the same job twice
/// yields the same reference and content.
pub trait ResultSink: Send + Sync {
    /// Persist the full result table and return its reference
    fn write(&self, job_id: Uuid, header: &ResultHeader, records: &[ResultRecord]) -> Result<String>;

    /// Read back a previously written artifact
    fn read(&self, reference: &str) -> Result<Vec<u8>>;
}

/// Writes results as CSV files named `<job id>-<content hash>.csv`
pub struct CsvResultSink {
    dir: PathBuf,
}

impl CsvResultSink {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, reference: &str) -> Result<PathBuf> {
        if reference.is_empty()
            || reference.contains(['/', '\\'])
            || reference.contains("..")
        {
            return Err(Error::validation(format!("Invalid artifact reference: {}", reference)));
        }
        Ok(self.dir.join(reference))
    }
}

/// Render a result table as CSV. Absent values become empty cells.
pub fn render_csv(header: &ResultHeader, records: &[ResultRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header.columns())?;

    for record in records {
        let row = std::iter::once(record.key.as_str()).chain(
            header
                .attributes
                .iter()
                .map(|attribute| record.get(attribute).unwrap_or("")),
        );
        writer.write_record(row)?;
    }

    writer
        .into_inner()
        .map_err(|e| Error::internal(format!("Failed to flush CSV: {}", e)))
}

impl ResultSink for CsvResultSink {
    fn write(&self, job_id: Uuid, header: &ResultHeader, records: &[ResultRecord]) -> Result<String> {
        let content = render_csv(header, records)?;
        let digest = hex::encode(Sha256::digest(&content));
        let reference = format!("{}-{}.csv", job_id, &digest[..16]);
        let path = self.dir.join(&reference);

        if path.exists() {
            tracing::debug!("Artifact {} already written", reference);
            return Ok(reference);
        }

        // Write to a temp file in the same directory, then rename into place
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&content)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;

        tracing::info!(
            "Wrote artifact {} ({} rows, {} bytes)",
            reference,
            records.len(),
            content.len()
        );
        Ok(reference)
    }

    fn read(&self, reference: &str) -> Result<Vec<u8>> {
        let path = self.path_for(reference)?;
        Ok(std::fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> ResultHeader {
        ResultHeader::new("domain", vec!["Facebook".into(), "GitHub".into()])
    }

    fn records() -> Vec<ResultRecord> {
        vec![
            ResultRecord::new("acme.com")
                .with_value("Facebook", Some("https://facebook.com/acme".into()))
                .with_value("GitHub", None),
            ResultRecord::empty("globex.io", &header().attributes),
        ]
    }

    #[test]
    fn test_render_csv() {
        let csv = String::from_utf8(render_csv(&header(), &records()).unwrap()).unwrap();
        assert_eq!(
            csv,
            "domain,Facebook,GitHub\nacme.com,https://facebook.com/acme,\nglobex.io,,\n"
        );
    }

    #[test]
    fn test_empty_results_have_header_only() {
        let csv = String::from_utf8(render_csv(&header(), &[]).unwrap()).unwrap();
        assert_eq!(csv, "domain,Facebook,GitHub\n");
    }

    #[test]
    fn test_write_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvResultSink::new(dir.path()).unwrap();
        let job_id = Uuid::new_v4();

        let first = sink.write(job_id, &header(), &records()).unwrap();
        let second = sink.write(job_id, &header(), &records()).unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with(&job_id.to_string()));

        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 1);

        let bytes = sink.read(&first).unwrap();
        assert!(String::from_utf8(bytes).unwrap().starts_with("domain,Facebook,GitHub\n"));
    }

    #[test]
    fn test_different_content_gets_new_reference() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvResultSink::new(dir.path()).unwrap();
        let job_id = Uuid::new_v4();

        let a = sink.write(job_id, &header(), &records()).unwrap();
        let b = sink.write(job_id, &header(), &records()[..1]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_read_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvResultSink::new(dir.path()).unwrap();
        assert!(matches!(sink.read("../etc/passwd"), Err(Error::Validation(_))));
        assert!(matches!(sink.read(""), Err(Error::Validation(_))));
        assert!(matches!(sink.read("missing.csv"), Err(Error::Io(_))));
    }
}
