use chrono::{DateTime, Local, Utc};

pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// Hour and minute in local time, as shown under each chat bubble.
pub fn clock_time(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M").to_string()
}

/// Cuts `text` to at most `max` characters, marking the cut with an ellipsis.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_adds_scheme() {
        assert_eq!(normalize_url(" abcd.supabase.co "), "https://abcd.supabase.co");
        assert_eq!(normalize_url("http://localhost:54321"), "http://localhost:54321");
    }

    #[test]
    fn truncate_counts_chars() {
        assert_eq!(truncate("habari", 10), "habari");
        assert_eq!(truncate("Karibu nyumbani", 7), "Karibu…");
    }
}
