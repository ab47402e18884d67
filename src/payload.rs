//! Rendered page content served by each user's nginx container.
//!
//! Every record gets a host directory `<root>/<record_id>/` holding
//! `index.html`; the directory is bind-mounted read-only into the container.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::record::OwnerId;

/// Longest accepted custom HTML body.
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// Page details rendered into the default template.
#[derive(Debug, Clone)]
pub struct PageContext<'a> {
    pub owner: &'a OwnerId,
    pub display_name: &'a str,
    pub container_name: &'a str,
    pub host_port: u16,
}

/// Produce the `index.html` for a container.
///
/// A full HTML document supplied by the user is served verbatim. Anything
/// else (including nothing) is escaped and placed inside the default page.
pub fn render_page(ctx: &PageContext<'_>, custom: Option<&str>) -> String {
    if let Some(html) = custom.map(str::trim)
        && is_full_document(html)
    {
        return html.to_string();
    }

    let owner = escape_html(ctx.owner.as_str());
    let title = escape_html(ctx.display_name);
    let body = match custom.map(str::trim).filter(|s| !s.is_empty()) {
        Some(text) => format!("<p class=\"message\">{}</p>", escape_html(text)),
        None => String::new(),
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{title}</title>
    <style>
        body {{ font-family: sans-serif; min-height: 100vh; margin: 0; display: flex;
               align-items: center; justify-content: center; color: #fff;
               background: linear-gradient(135deg, #667eea 0%, #764ba2 100%); }}
        .card {{ text-align: center; padding: 3rem; border-radius: 20px;
                background: rgba(255, 255, 255, 0.1); }}
        .info {{ margin-top: 2rem; padding: 1rem; border-radius: 10px;
                background: rgba(255, 255, 255, 0.2); }}
    </style>
</head>
<body>
    <div class="card">
        <h1>{title}</h1>
        <p>Owner: {owner}</p>
        {body}
        <div class="info">
            <p><strong>Container:</strong> {container}</p>
            <p><strong>Port:</strong> {port}</p>
            <p><strong>Server:</strong> nginx</p>
        </div>
    </div>
</body>
</html>
"#,
        title = title,
        owner = owner,
        body = body,
        container = escape_html(ctx.container_name),
        port = ctx.host_port,
    )
}

fn is_full_document(html: &str) -> bool {
    let head: String = html.chars().take(15).collect::<String>().to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

/// Minimal HTML escaping for text nodes and attribute values.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Host directory tree holding rendered pages.
#[derive(Debug, Clone)]
pub struct PayloadStore {
    root: PathBuf,
}

impl PayloadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir_for(&self, record_id: Uuid) -> PathBuf {
        self.root.join(record_id.to_string())
    }

    /// Write `index.html` for a record and return its directory.
    pub async fn write(&self, record_id: Uuid, html: &str) -> std::io::Result<PathBuf> {
        let dir = self.dir_for(record_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("index.html"), html).await?;
        Ok(dir)
    }

    /// Remove a payload directory. Missing directories are not an error.
    pub async fn remove(&self, dir: &Path) -> std::io::Result<()> {
        if !dir.starts_with(&self.root) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} is outside the payload root", dir.display()),
            ));
        }
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
