use unicode_segmentation::UnicodeSegmentation;

/// Shortens a string to at most `limit` graphemes, for log lines.
pub fn trim_string(s: &str, limit: usize) -> String {
    let mut graphemes = s.graphemes(true);
    let trimmed: String = graphemes.by_ref().take(limit).collect();
    if graphemes.next().is_some() {
        trimmed + "…"
    } else {
        trimmed
    }
}

/// Makes a string safe to use as a single path component.
pub fn safe_component(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    // "." and ".." would still escape.
    if cleaned.chars().all(|c| c == '.') {
        format!("_{}", cleaned)
    } else {
        cleaned
    }
}

pub fn hash(text: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(text.as_bytes());
    let hash = hasher.finalize();
    hash.to_string()
}

/// Renders a byte count the way the dashboard shows it.
pub fn human_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b > GB {
        format!("{:.2} GB", b / GB)
    } else if b > MB {
        format!("{:.2} MB", b / MB)
    } else if b > KB {
        format!("{:.2} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}
