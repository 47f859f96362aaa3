/// Formats a byte count for chat messages, e.g. `12.4 MB`.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}

/// [`format_file_size`] for error-message formatting, which hands fields
/// over by reference.
pub(crate) fn human_size(bytes: &u64) -> String {
    format_file_size(*bytes)
}

/// Makes a user-supplied file name safe to use inside a staging directory.
///
/// Path separators and control characters are replaced, leading dots are
/// stripped so nothing becomes hidden, and the result is capped at 120 bytes
/// on a char boundary.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        return "file".to_string();
    }
    truncate_bytes(&cleaned, 120).to_string()
}

/// Lowercased extension of a file name, without the dot.
pub fn extension_of(name: &str) -> Option<String> {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| !e.is_empty())
}

/// Container extensions accepted as video input.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "avi", "webm", "m4v", "ts", "flv", "3gp", "mpeg", "mpg"];

pub fn is_video_name(name: &str) -> bool {
    extension_of(name).is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

/// Keeps the last `max_chars` characters of tool output; the end of an
/// ffmpeg log is where the actual error lives.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.trim().to_string();
    }
    let tail: String = text.chars().skip(count - max_chars).collect();
    format!("…{}", tail.trim())
}

fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
