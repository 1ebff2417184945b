//! `web_fetch`: GET an http(s) URL and return readable text.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};

use super::{str_arg, Capability, Tool, ToolContext, ToolError};

const USER_AGENT: &str = concat!("crier/", env!("CARGO_PKG_VERSION"));

pub struct WebFetchTool {
    client: reqwest::Client,
    max_chars: usize,
    tags: Option<Regex>,
    blocks: Option<Regex>,
}

impl WebFetchTool {
    pub fn new(max_chars: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            max_chars,
            tags: Regex::new(r"(?s)<[^>]+>").ok(),
            blocks: Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").ok(),
        }
    }

    fn html_to_text(&self, html: &str) -> String {
        let mut text = html.to_string();
        if let Some(re) = &self.blocks {
            text = re.replace_all(&text, " ").into_owned();
        }
        if let Some(re) = &self.tags {
            text = re.replace_all(&text, " ").into_owned();
        }
        text.lines()
            .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn parse_url(raw: &str) -> Result<reqwest::Url, ToolError> {
    let url = reqwest::Url::parse(raw.trim())
        .map_err(|e| ToolError::ArgumentInvalid(format!("invalid url {}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        other => Err(ToolError::ArgumentInvalid(format!(
            "only http and https urls are allowed, got {}",
            other
        ))),
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch an http(s) URL and return its text content (HTML is reduced to text)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "http or https URL"}
            },
            "required": ["url"]
        })
    }

    fn capability(&self) -> Capability {
        Capability::Network
    }

    fn output_limit(&self) -> usize {
        self.max_chars
    }

    async fn execute(&self, args: Map<String, Value>, _ctx: &ToolContext) -> Result<String, ToolError> {
        let url = parse_url(str_arg(&args, "url")?)?;
        let res = self
            .client
            .get(url.clone())
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(|e| ToolError::RuntimeFailure(format!("request failed: {}", e)))?;
        let status = res.status();
        let content_type = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let body = res
            .text()
            .await
            .map_err(|e| ToolError::RuntimeFailure(format!("reading body failed: {}", e)))?;
        if !status.is_success() {
            return Err(ToolError::RuntimeFailure(format!("{} returned {}", url, status)));
        }
        let text = if content_type.contains("json") {
            serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| serde_json::to_string_pretty(&v).ok())
                .unwrap_or(body)
        } else if content_type.contains("html") || body.trim_start().starts_with('<') {
            self.html_to_text(&body)
        } else {
            body
        };
        Ok(format!("URL: {}\n\n{}", url, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_http_urls_are_accepted() {
        assert!(parse_url("https://example.com/a").is_ok());
        for bad in ["file:///etc/passwd", "ftp://example.com", "not a url", "http://"] {
            assert!(matches!(parse_url(bad), Err(ToolError::ArgumentInvalid(_))), "accepted {}", bad);
        }
    }

    #[test]
    fn html_is_reduced_to_text() {
        let tool = WebFetchTool::new(1000);
        let text = tool.html_to_text(
            "<html><head><style>p{}</style><script>var x=1;</script></head>\n<body><h1>Title</h1>\n<p>Hello   <b>world</b></p></body></html>",
        );
        assert!(text.contains("Title"));
        assert!(text.contains("Hello world"));
        assert!(!text.contains("var x"));
        assert!(!text.contains('<'));
    }
}
