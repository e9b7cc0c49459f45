use chrono::{DateTime, Local, Utc};

pub const BACKUP_FILE_PREFIX: &str = "backup_";
pub const BACKUP_FILE_SUFFIX: &str = ".tar.gz";
pub const EXTRACTED_DIR_PREFIX: &str = "extracted_";

/// Wraps a value in single quotes for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\"'\"'"))
}

/// Joins remote path segments with `/`, collapsing duplicate separators at the seams.
pub fn join_remote_path(base: &str, child: &str) -> String {
    let base = base.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    if base.is_empty() {
        return format!("/{child}");
    }
    if child.is_empty() {
        return base.to_string();
    }
    format!("{base}/{child}")
}

/// Parent directory of a remote path, or `None` for a bare name.
pub fn parent_remote_dir(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let index = trimmed.rfind('/')?;
    if index == 0 {
        return Some("/");
    }
    Some(&trimmed[..index])
}

pub fn format_file_size(size: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let value = size as f64;
    if value < KB {
        format!("{size} B")
    } else if value < MB {
        format!("{:.1} KB", value / KB)
    } else if value < GB {
        format!("{:.1} MB", value / MB)
    } else {
        format!("{:.1} GB", value / GB)
    }
}

pub fn backup_file_name(now: DateTime<Local>) -> String {
    format!(
        "{BACKUP_FILE_PREFIX}{}{BACKUP_FILE_SUFFIX}",
        now.format("%Y%m%d%H%M")
    )
}

pub fn extraction_dir_name(now: DateTime<Utc>) -> String {
    format!("{EXTRACTED_DIR_PREFIX}{}", now.timestamp_millis())
}

pub fn truncate_for_log(value: &str) -> String {
    const LIMIT: usize = 500;
    if value.len() <= LIMIT {
        return value.to_string();
    }
    let mut end = LIMIT;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &value[..end])
}
