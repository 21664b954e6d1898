//! URL fetch tool.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::Tool;

const DEFAULT_FETCH_TIMEOUT_SECS: f64 = 10.0;

/// Fetch a URL and return its body as plain UTF-8 text with HTML stripped.
pub struct FetchUrl;

fn parse_url(raw: &str) -> anyhow::Result<reqwest::Url> {
    let url = reqwest::Url::parse(raw).map_err(|_| anyhow::anyhow!("Invalid or missing URL"))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        anyhow::bail!("Invalid or missing URL");
    }
    Ok(url)
}

#[async_trait]
impl Tool for FetchUrl {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch content from a URL, strip HTML tags, and return it as plain UTF-8 text"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch content from"
                },
                "timeout": {
                    "type": "number",
                    "description": "Request timeout in seconds (default: 10)"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value, _workspace: &Path) -> anyhow::Result<String> {
        let url = parse_url(args["url"].as_str().unwrap_or_default())?;
        let timeout_secs = args["timeout"]
            .as_f64()
            .filter(|t| t.is_finite() && *t > 0.0)
            .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS);

        let client = reqwest::Client::builder()
            .user_agent("ralph-swarm/0.1")
            .timeout(Duration::from_secs_f64(timeout_secs))
            .build()?;

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Request failed: {}", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("HTTP error {}: {}", status.as_u16(), body);
        }

        let bytes = response.bytes().await?;
        let body = String::from_utf8_lossy(&bytes);
        Ok(strip_html(&body))
    }
}

/// Remove script/style blocks and tags, then collapse whitespace.
fn strip_html(html: &str) -> String {
    let mut text = html.to_string();
    for (open, close) in [("<script", "</script>"), ("<style", "</style>")] {
        while let Some(start) = text.find(open) {
            match text[start..].find(close) {
                Some(end) => text.replace_range(start..start + end + close.len(), ""),
                None => break,
            }
        }
    }

    let mut result = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(c),
            _ => {}
        }
    }

    let collapsed = result.split_whitespace().collect::<Vec<_>>().join(" ");
    html_decode(&collapsed)
}

/// Basic HTML entity decoding.
fn html_decode(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}
