//! Labelled-text CSV I/O.
//!
//! Record files carry a header row. The label and text columns are located by
//! name, so source datasets with extra or differently named columns load too
//! (`v1`/`v2` is the classic SMS spam collection layout). Bytes that are not
//! valid UTF-8 are replaced rather than rejected; the classic dataset ships as
//! Latin-1.

use std::path::Path;

use tracing::debug;

use spamflow_shared::{Label, Record, Result, SpamflowError};

use crate::output::write_atomic;

const LABEL_COLUMNS: &[&str] = &["label", "v1", "target", "category", "class"];
const TEXT_COLUMNS: &[&str] = &["text", "v2", "message", "sms"];

/// Read every record from a labelled CSV file.
pub fn read_records(path: &Path) -> Result<Vec<Record>> {
    if !path.exists() {
        return Err(SpamflowError::InputMissing {
            path: path.to_path_buf(),
        });
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| csv_error(path, 1, e))?;

    let headers = reader
        .byte_headers()
        .map_err(|e| csv_error(path, 1, e))?
        .clone();
    let (label_idx, text_idx) = locate_columns(&headers)
        .ok_or_else(|| {
            SpamflowError::malformed(
                path,
                1,
                format!(
                    "header must name a label column ({}) and a text column ({})",
                    LABEL_COLUMNS.join("/"),
                    TEXT_COLUMNS.join("/")
                ),
            )
        })?;

    let mut records = Vec::new();
    let mut row = csv::ByteRecord::new();
    loop {
        let line = reader.position().line();
        match reader.read_byte_record(&mut row) {
            Ok(false) => break,
            Ok(true) => {}
            Err(e) => return Err(csv_error(path, line, e)),
        }
        let line = row.position().map(|p| p.line()).unwrap_or(line);

        let label_raw = row.get(label_idx).ok_or_else(|| {
            SpamflowError::malformed(path, line, "missing label field")
        })?;
        let text_raw = row
            .get(text_idx)
            .ok_or_else(|| SpamflowError::malformed(path, line, "missing text field"))?;

        let label: Label = String::from_utf8_lossy(label_raw)
            .parse()
            .map_err(|msg: String| SpamflowError::malformed(path, line, msg))?;
        let text = String::from_utf8_lossy(text_raw).into_owned();

        records.push(Record { label, text });
    }

    debug!(path = %path.display(), rows = records.len(), "read records");
    Ok(records)
}

/// Write records as `label,text` CSV, atomically.
pub fn write_records(path: &Path, records: &[Record]) -> Result<()> {
    write_atomic(path, |w| {
        let mut writer = csv::Writer::from_writer(w);
        writer
            .write_record(["label", "text"])
            .map_err(|e| csv_write_error(path, e))?;
        for record in records {
            writer
                .write_record([record.label.as_str(), record.text.as_str()])
                .map_err(|e| csv_write_error(path, e))?;
        }
        writer.flush().map_err(|e| SpamflowError::write(path, e))
    })?;
    debug!(path = %path.display(), rows = records.len(), "wrote records");
    Ok(())
}

fn locate_columns(headers: &csv::ByteRecord) -> Option<(usize, usize)> {
    let names: Vec<String> = headers
        .iter()
        .map(|h| String::from_utf8_lossy(h).trim().to_ascii_lowercase())
        .collect();
    let find = |candidates: &[&str]| {
        candidates
            .iter()
            .find_map(|c| names.iter().position(|n| n == c))
    };
    Some((find(LABEL_COLUMNS)?, find(TEXT_COLUMNS)?))
}

pub(crate) fn csv_error(path: &Path, line: u64, e: csv::Error) -> SpamflowError {
    let line = e.position().map(|p| p.line()).unwrap_or(line);
    match e.into_kind() {
        csv::ErrorKind::Io(source) => SpamflowError::io(path, source),
        other => SpamflowError::malformed(path, line, format!("{other:?}")),
    }
}

pub(crate) fn csv_write_error(path: &Path, e: csv::Error) -> SpamflowError {
    match e.into_kind() {
        csv::ErrorKind::Io(source) => SpamflowError::write(path, source),
        other => SpamflowError::Write {
            path: path.to_path_buf(),
            source: std::io::Error::other(format!("{other:?}")),
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    pub(crate) fn scratch_dir(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("spamflow_{prefix}_{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    #[test]
    fn roundtrip_with_quoting() {
        let dir = scratch_dir("dataset");
        let path = dir.join("records.csv");
        let records = vec![
            Record::new(Label::Spam, "WIN, WIN, \"free\" prize\nnow"),
            Record::new(Label::Ham, "see you at 5"),
        ];
        write_records(&path, &records).expect("write");
        let back = read_records(&path).expect("read");
        assert_eq!(back, records);
    }

    #[test]
    fn classic_layout_with_extra_columns() {
        let dir = scratch_dir("dataset");
        let path = dir.join("spam.csv");
        std::fs::write(
            &path,
            b"v1,v2,,,\nham,Go until jurong point,,,\nspam,Free entry \xe9 in 2 a wkly comp,,,\n",
        )
        .unwrap();
        let records = read_records(&path).expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].label, Label::Ham);
        assert_eq!(records[1].label, Label::Spam);
        assert!(records[1].text.starts_with("Free entry"));
    }

    #[test]
    fn missing_file_is_input_missing() {
        let dir = scratch_dir("dataset");
        let err = read_records(&dir.join("absent.csv")).unwrap_err();
        assert!(matches!(err, SpamflowError::InputMissing { .. }));
    }

    #[test]
    fn unknown_label_reports_line() {
        let dir = scratch_dir("dataset");
        let path = dir.join("bad.csv");
        std::fs::write(&path, "label,text\nham,ok\neggs,bad row\n").unwrap();
        match read_records(&path).unwrap_err() {
            SpamflowError::MalformedRow { line, message, .. } => {
                assert_eq!(line, 3);
                assert!(message.contains("eggs"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_columns_rejected() {
        let dir = scratch_dir("dataset");
        let path = dir.join("nolabel.csv");
        std::fs::write(&path, "id,text\n1,hello\n").unwrap();
        assert!(matches!(
            read_records(&path).unwrap_err(),
            SpamflowError::MalformedRow { line: 1, .. }
        ));
    }
}
