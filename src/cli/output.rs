//! Report output for the CLI

use serde::Serialize;
use std::fmt::Write;

/// Output format for command reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON document per report
    Json,
}

impl OutputFormat {
    /// Render a report: `text` for humans, `value` serialized for JSON
    pub fn render<T: Serialize>(&self, text: &str, value: &T) -> serde_json::Result<String> {
        match self {
            Self::Text => Ok(text.to_string()),
            Self::Json => serde_json::to_string_pretty(value),
        }
    }
}

/// Hex dump of the first `max` bytes of `data`
pub fn hex_preview(data: &[u8], max: usize) -> String {
    let mut out = String::with_capacity(max.min(data.len()) * 3 + 4);
    for (i, byte) in data.iter().take(max).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    if data.len() > max {
        out.push_str(" ...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_preview() {
        assert_eq!(hex_preview(&[0x0a, 0xff], 4), "0a ff");
        assert_eq!(hex_preview(&[1, 2, 3], 2), "01 02 ...");
        assert_eq!(hex_preview(&[], 4), "");
    }

    #[test]
    fn test_json_render() {
        let out = OutputFormat::Json.render("ignored", &serde_json::json!({"n": 1})).unwrap();
        assert!(out.contains("\"n\": 1"));
        assert_eq!(OutputFormat::Text.render("hello", &()).unwrap(), "hello");
    }
}
