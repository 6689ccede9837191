//! Turning spreadsheet HTML fragments into printable PDF documents.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use regex::Regex;
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Stylesheet embedded in every generated document.
pub const CUSTOM_CSS: &str = r"
body {
    font-family: 'Times New Roman', Times, serif;
    font-size: 15pt;
    margin: 0 auto;
    padding: 20px;
    line-height: 1.4;
}
h1 { font-size: 20pt; font-weight: bold; margin: 0.8em 0 0.4em; }
h2 { font-size: 16pt; font-weight: bold; margin: 0.6em 0 0.3em; }
h3 { font-size: 14pt; font-weight: bold; margin: 0.5em 0 0.25em; }
ul, ol { margin: 0.8em 0; padding-left: 1.5em; }
ul ul, ol ol, ul ol, ol ul { margin: 0.4em 0; }
table {
    width: 100%;
    border-collapse: collapse;
    margin: 0.8em 0;
    font-size: 11pt;
}
th, td {
    padding: 6px;
    border: 1px solid #ddd;
    text-align: left;
}
img { max-width: 100%; height: auto; }
@media print {
    body { margin: 0; }
    img { max-height: 100vh; }
}
";

/// Shown instead of images hosted elsewhere, which the renderer cannot fetch reliably.
pub const IMAGE_PLACEHOLDER: &str = r#"<div style="border: 1px solid #ccc; padding: 20px; text-align: center; margin: 10px 0; background-color: #f9f9f9;">This response references a nonexistent visual element</div>"#;

static REMOTE_IMG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<img[^>]*src="https?://[^"]*"[^>]*>"#).expect("static regex is valid")
});

/// Strip code fences, undo spreadsheet quote escaping and replace remote images.
#[must_use]
pub fn clean_html(content: &str) -> String {
    let content = content
        .replace("```html", "")
        .replace("```", "")
        .replace("\"\"", "\"")
        .replace("\\\"", "\"")
        .replace("\\'", "'");
    REMOTE_IMG
        .replace_all(&content, IMAGE_PLACEHOLDER)
        .into_owned()
}

/// Wrap a fragment in a complete UTF-8 HTML document with the given stylesheet.
#[must_use]
pub fn wrap_document(content: &str, css: &str) -> String {
    format!(
        r#"<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
{css}
    </style>
</head>
<body>
{content}
</body>
</html>
"#
    )
}

/// Clean and wrap a cell. Returns `None` for blank cells.
#[must_use]
pub fn prepare_document(content: &str) -> Option<String> {
    if content.trim().is_empty() {
        return None;
    }
    Some(wrap_document(&clean_html(content), CUSTOM_CSS))
}

#[async_trait]
pub trait PdfRenderer: Send + Sync {
    async fn render(&self, html: &str) -> Result<Vec<u8>>;
}

/// Renders through the `wkhtmltopdf` binary: A4 pages with 0.75in margins.
#[derive(Debug, Clone)]
pub struct WkHtmlToPdf {
    pub binary: String,
}

impl Default for WkHtmlToPdf {
    fn default() -> Self {
        Self {
            binary: "wkhtmltopdf".to_string(),
        }
    }
}

impl WkHtmlToPdf {
    fn args() -> Vec<&'static str> {
        vec![
            "--quiet",
            "--enable-local-file-access",
            "--encoding",
            "UTF-8",
            "--page-size",
            "A4",
            "--margin-top",
            "0.75in",
            "--margin-right",
            "0.75in",
            "--margin-bottom",
            "0.75in",
            "--margin-left",
            "0.75in",
            "-",
            "-",
        ]
    }
}

#[async_trait]
impl PdfRenderer for WkHtmlToPdf {
    async fn render(&self, html: &str) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.binary)
            .args(Self::args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.binary))?;

        let mut stdin = child.stdin.take().context("renderer stdin unavailable")?;
        let input = html.as_bytes().to_vec();
        let writer = tokio::spawn(async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        });

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for renderer")?;
        writer
            .await
            .context("renderer input task panicked")?
            .context("Failed to write HTML to renderer")?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        if output.stdout.is_empty() {
            bail!("{} produced no output", self.binary);
        }
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_html() {
        let raw = r#"```html<p class=""note"">It\'s \"fine\"</p>```"#;
        assert_eq!(clean_html(raw), r#"<p class="note">It's "fine"</p>"#);
    }

    #[test]
    fn test_remote_images_replaced() {
        let raw = r#"<p>a</p><img alt="x" src="https://example.com/a.png" /><img src="local.png">"#;
        let cleaned = clean_html(raw);
        assert!(cleaned.contains("nonexistent visual element"));
        assert!(!cleaned.contains("example.com"));
        assert!(cleaned.contains(r#"<img src="local.png">"#));
    }

    #[test]
    fn test_prepare_document() {
        assert!(prepare_document("   ").is_none());
        let doc = prepare_document("<h1>Title</h1>").unwrap();
        assert!(doc.contains("<meta charset=\"UTF-8\">"));
        assert!(doc.contains("font-family: 'Times New Roman'"));
        assert!(doc.contains("<h1>Title</h1>"));
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_binary_is_an_error() {
        let renderer = WkHtmlToPdf {
            binary: "definitely-not-a-real-renderer".to_string(),
        };
        assert!(renderer.render("<p>x</p>").await.is_err());
    }
}
