use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::warn;

/// Read at most `max_bytes` from the end of the file at `path`.
///
/// Anything before the last `max_bytes` bytes is dropped, so a growing log keeps its newest
/// content. A negative limit reads nothing. Failures are logged before being returned.
pub fn read_last_part_of_file(path: &Path, max_bytes: i64) -> io::Result<Vec<u8>> {
    let result = read_tail(path, u64::try_from(max_bytes).unwrap_or(0));
    if let Err(e) = &result {
        warn!("failed to read {}: {}", path.display(), e);
    }
    result
}

fn read_tail(path: &Path, max_bytes: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let keep = max_bytes.min(len);
    file.seek(SeekFrom::Start(len - keep))?;

    let mut contents = Vec::with_capacity(keep as usize);
    file.take(keep).read_to_end(&mut contents)?;
    Ok(contents)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_keeps_newest_bytes() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"old lines\nnew lines\n").unwrap();

        assert_eq!(read_last_part_of_file(file.path(), 10).unwrap(), b"new lines\n");
        assert_eq!(
            read_last_part_of_file(file.path(), 1000).unwrap(),
            b"old lines\nnew lines\n"
        );
        assert_eq!(read_last_part_of_file(file.path(), 0).unwrap(), b"");
        assert_eq!(read_last_part_of_file(file.path(), -5).unwrap(), b"");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_last_part_of_file(&dir.path().join("absent.log"), 100).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
