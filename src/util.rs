//! Shared utility functions for the Ralph crate.

use std::io::Write;
use std::path::Path;

use ralph_common::RalphError;

/// Write `contents` to `path` atomically: write to a sibling `.tmp` file in
/// the same directory, then rename over the destination. The rename is the
/// commit point — a reader never observes a partially written file, since
/// both the tmp file and the destination live on the same filesystem.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), RalphError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|source| RalphError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("write")
    ));

    let mut file = std::fs::File::create(&tmp_path).map_err(|source| RalphError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    file.write_all(contents).map_err(|source| RalphError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    file.sync_all().map_err(|source| RalphError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    drop(file);

    std::fs::rename(&tmp_path, path).map_err(|source| RalphError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_simple() {
        let text = r#"{"key": "value"}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"key": "value"}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_with_prefix() {
        let text = r#"Here is the JSON: {"key": "value"}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"key": "value"}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_with_suffix() {
        let text = r#"{"key": "value"} and some more text"#;
        assert_eq!(extract_json_object(text), Some(r#"{"key": "value"}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"outer": {"inner": "value"}}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_no_json() {
        let text = "No JSON here";
        assert_eq!(extract_json_object(text), None);
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        let text = r#"{"key": "value""#;
        assert_eq!(extract_json_object(text), None);
    }

    #[test]
    fn atomic_write_creates_file_and_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/prd.json");
        atomic_write(&path, b"{}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn atomic_write_leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prd.json");
        atomic_write(&path, b"hello").unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn atomic_write_overwrites_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prd.json");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }
}
