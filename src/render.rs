//! Turning an app definition into a servable page

use crate::app::AppDefinition;
use hyper::body::Bytes;

/// A rendered preview page
#[derive(Debug, Clone)]
pub struct RenderedPreview {
    pub body: Bytes,
    pub content_type: &'static str,
}

/// Content assembly step
///
/// Implementations must treat the source blobs as opaque text.
pub trait PreviewRenderer: Send + Sync {
    fn render(&self, def: &AppDefinition) -> anyhow::Result<RenderedPreview>;
}

/// Wraps the submitted html, css and js in a minimal HTML document
#[derive(Debug, Default, Clone)]
pub struct ScaffoldRenderer;

impl PreviewRenderer for ScaffoldRenderer {
    fn render(&self, def: &AppDefinition) -> anyhow::Result<RenderedPreview> {
        let src = &def.source;
        let mut page = String::with_capacity(src.payload_len() + 256);

        page.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
        page.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
        page.push_str(&format!("<meta name=\"preview-app\" content=\"{}\">\n", def.app_id));
        page.push_str("<style>\n");
        page.push_str(&src.css);
        page.push_str("\n</style>\n</head>\n<body>\n");
        page.push_str(&src.html);
        page.push_str("\n<script>\n");
        page.push_str(&src.js);
        page.push_str("\n</script>\n</body>\n</html>\n");

        Ok(RenderedPreview {
            body: Bytes::from(page),
            content_type: "text/html; charset=utf-8",
        })
    }
}
