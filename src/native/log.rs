use std::path::Path;

use crate::error::{ControlError, Result};

async fn read_log(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ControlError::LogUnavailable(format!("{}: {}", path.display(), e)))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Non-empty lines of `content`, in order.
fn non_empty_lines(content: &str) -> impl DoubleEndedIterator<Item = &str> {
    content.lines().filter(|l| !l.is_empty())
}

/// The last `max_lines` non-empty lines of `content`, joined with `\n`.
pub fn tail_lines(content: &str, max_lines: usize) -> String {
    let mut tail: Vec<&str> = non_empty_lines(content).rev().take(max_lines).collect();
    tail.reverse();
    tail.join("\n")
}

/// Read the last `max_lines` lines of a server log.
///
/// An existing but empty log yields an empty string; a missing or
/// unreadable one is `LogUnavailable`.
pub async fn read_log_tail(path: &Path, max_lines: usize) -> Result<String> {
    let content = read_log(path).await?;
    Ok(tail_lines(&content, max_lines))
}

/// Last non-empty line of the log, used as a cheap health signal.
pub async fn last_log_line(path: &Path) -> Result<String> {
    let content = read_log(path).await?;
    let last = non_empty_lines(&content).next_back().unwrap_or_default().to_string();
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn numbered(n: usize) -> String {
        (1..=n).map(|i| format!("line {i}\n")).collect()
    }

    #[test]
    fn test_tail_lines_takes_last_n_in_order() {
        let content = numbered(10);
        assert_eq!(tail_lines(&content, 3), "line 8\nline 9\nline 10");
    }

    #[test]
    fn test_tail_lines_fewer_than_requested() {
        let content = numbered(2);
        assert_eq!(tail_lines(&content, 200), "line 1\nline 2");
    }

    #[test]
    fn test_tail_lines_skips_empty_entries() {
        let content = "a\n\n\nb\n\n";
        assert_eq!(tail_lines(content, 2), "a\nb");
        assert_eq!(tail_lines(content, 1), "b");
    }

    #[test]
    fn test_tail_lines_handles_crlf_and_missing_newline() {
        assert_eq!(tail_lines("a\r\nb\r\nc", 2), "b\nc");
    }

    #[test]
    fn test_tail_lines_zero_and_empty() {
        assert_eq!(tail_lines(&numbered(5), 0), "");
        assert_eq!(tail_lines("", 10), "");
    }

    #[tokio::test]
    async fn test_read_log_tail_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.log");
        std::fs::write(&path, numbered(300)).unwrap();

        let logs = read_log_tail(&path, 200).await.unwrap();
        let lines: Vec<&str> = logs.lines().collect();
        assert_eq!(lines.len(), 200);
        assert_eq!(lines[0], "line 101");
        assert_eq!(lines[199], "line 300");
    }

    #[tokio::test]
    async fn test_read_log_tail_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.log");
        std::fs::write(&path, "").unwrap();
        assert_eq!(read_log_tail(&path, 10).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_read_log_tail_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = read_log_tail(&dir.path().join("server.log"), 10).await.unwrap_err();
        assert_eq!(err.kind(), "log_unavailable");
        assert!(!err.public_message().contains(dir.path().to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_last_log_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.log");
        std::fs::write(&path, "booting\nlistening on 5001\n\n").unwrap();
        assert_eq!(last_log_line(&path).await.unwrap(), "listening on 5001");

        std::fs::write(&path, "").unwrap();
        assert_eq!(last_log_line(&path).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_last_log_line_directory_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let err = last_log_line(dir.path()).await.unwrap_err();
        assert_eq!(err.kind(), "log_unavailable");
    }
}
