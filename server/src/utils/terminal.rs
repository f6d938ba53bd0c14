//! Terminal utility functions

/// Format a URL as a clickable terminal hyperlink if supported.
///
/// Uses OSC 8 escape sequences for terminals that support hyperlinks.
/// Falls back to plain colored text on unsupported terminals.
pub fn terminal_link(url: &str) -> String {
    if supports_hyperlinks::on(supports_hyperlinks::Stream::Stdout) {
        format!("\x1b]8;;{}\x07\x1b[36m{}\x1b[0m\x1b]8;;\x07", url, url)
    } else {
        format!("\x1b[36m{}\x1b[0m", url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_link_contains_url() {
        let url = "http://localhost:8900";
        let result = terminal_link(url);
        assert!(result.contains(url));
        assert!(result.contains("\x1b[36m"));
        assert!(result.contains("\x1b[0m"));
    }

    #[test]
    fn test_terminal_link_plain_format() {
        let url = "http://test.local";
        let result = terminal_link(url);
        if !result.contains("\x1b]8;;") {
            assert_eq!(result, format!("\x1b[36m{}\x1b[0m", url));
        }
    }
}
