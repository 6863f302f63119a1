// Thin helpers over a blocking HTTP client: JSON decoding, body
// streaming with size caps, and RFC 5988 Link-header pagination.

use std::io::{Read, Write};

use anyhow::{Context, bail};
use serde::de::DeserializeOwned;

pub struct Client {
    http: reqwest::blocking::Client,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub url: String,
    pub rel: String,
}

impl Client {
    pub fn new(insecure: bool) -> anyhow::Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("vmod/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(insecure)
            .build()
            .context("building HTTP client")?;
        Ok(Client { http })
    }

    fn get(&self, url: &str) -> anyhow::Result<reqwest::blocking::Response> {
        let resp = self.http.get(url).send().with_context(|| format!("get {url}"))?;
        if !resp.status().is_success() {
            bail!("get {url}: {}", resp.status());
        }
        Ok(resp)
    }

    pub fn get_json<T: DeserializeOwned>(&self, url: &str) -> anyhow::Result<T> {
        self.get(url)?
            .json()
            .with_context(|| format!("decoding {url}"))
    }

    /// JSON plus the parsed Link header, for paginated listings.
    pub fn get_json_paged<T: DeserializeOwned>(&self, url: &str) -> anyhow::Result<(T, Vec<Link>)> {
        let resp = self.get(url)?;
        let links = resp
            .headers()
            .get(reqwest::header::LINK)
            .and_then(|v| v.to_str().ok())
            .map(parse_links)
            .unwrap_or_default();
        let data = resp.json().with_context(|| format!("decoding {url}"))?;
        Ok((data, links))
    }

    pub fn get_body(&self, url: &str, max_size: u64) -> anyhow::Result<Vec<u8>> {
        let resp = self.get(url)?;
        let mut buf = Vec::new();
        resp.take(max_size + 1).read_to_end(&mut buf)?;
        if buf.len() as u64 > max_size {
            bail!("get {url}: response exceeds {max_size} bytes");
        }
        Ok(buf)
    }

    pub fn get_text(&self, url: &str, max_size: u64) -> anyhow::Result<String> {
        let body = self.get_body(url, max_size)?;
        String::from_utf8(body).with_context(|| format!("decoding {url}"))
    }

    /// Stream a response body into w, refusing to copy more than
    /// max_size bytes.
    pub fn download(&self, url: &str, w: &mut impl Write, max_size: u64) -> anyhow::Result<u64> {
        let resp = self.get(url)?;
        let n = std::io::copy(&mut resp.take(max_size + 1), w)
            .with_context(|| format!("streaming {url}"))?;
        if n > max_size {
            bail!("get {url}: response exceeds {max_size} bytes");
        }
        Ok(n)
    }
}

/// Parse a Link header value into (url, rel) pairs. Attributes other
/// than rel are ignored.
pub fn parse_links(text: &str) -> Vec<Link> {
    let mut out = Vec::new();
    for part in text.split(',') {
        let part = part.trim();
        let Some(rest) = part.strip_prefix('<') else {
            continue;
        };
        let Some(end) = rest.find('>') else {
            continue;
        };
        let url = &rest[..end];
        for attr in rest[end + 1..].split(';') {
            let attr = attr.trim();
            if let Some(val) = attr.strip_prefix("rel=") {
                let rel = val.trim_matches('"');
                out.push(Link {
                    url: url.to_string(),
                    rel: rel.to_string(),
                });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_header_pagination() {
        let text = r#"<https://api.example/tags?page=2>; rel="next", <https://api.example/tags?page=9>; rel="last""#;
        let links = parse_links(text);
        assert_eq!(
            links,
            vec![
                Link {
                    url: "https://api.example/tags?page=2".to_string(),
                    rel: "next".to_string()
                },
                Link {
                    url: "https://api.example/tags?page=9".to_string(),
                    rel: "last".to_string()
                },
            ]
        );
    }

    #[test]
    fn malformed_links_are_skipped() {
        assert!(parse_links("junk").is_empty());
        assert!(parse_links("<unterminated; rel=next").is_empty());
    }
}
