//! HTML and PDF content extraction.
//!
//! The snapshot worker uses [`archive_html`] to turn a rendered page into a
//! self-contained, boilerplate-free document. The index worker uses
//! [`visible_text`] and [`pdf_text`] to pull searchable text back out.

use scraper::{ElementRef, Html, Node, Selector};

/// Elements never worth keeping in an archive or an index.
const ALWAYS_STRIPPED: &[&str] = &[
    "script",
    "style",
    "noscript",
    "template",
    "iframe",
    "object",
    "embed",
    "link",
    "meta",
    "nav",
    "aside",
    "[role='navigation']",
    "[role='banner']",
    "[role='contentinfo']",
    "[role='complementary']",
    ".ad",
    ".ads",
    ".advert",
    ".advertisement",
    ".sponsored",
    "ins.adsbygoogle",
    "[id^='google_ads']",
    "[class*='cookie-banner']",
    "[class*='newsletter-signup']",
];

/// Page chrome that is stripped unless it belongs to the article itself.
const CHROME: &[&str] = &["header", "footer"];

/// Semantic containers tried in order when looking for the main content.
const MAIN_CONTENT: &[&str] = &[
    "article",
    "main",
    "[role='main']",
    "#content",
    "#main-content",
    ".post-content",
    ".entry-content",
    ".article-body",
];

/// A container must hold at least this much text to be preferred over `<body>`.
const MIN_MAIN_CONTENT_CHARS: usize = 200;

/// Tags whose text never reaches the index.
const INVISIBLE_TAGS: &[&str] = &["script", "style", "noscript", "template", "head", "title"];

const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "figcaption",
    "figure", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main",
    "nav", "ol", "p", "pre", "section", "table", "tr", "ul",
];

/// A cleaned, standalone copy of a rendered page.
#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub title: Option<String>,
    pub html: String,
    /// Whether a semantic main-content container was found.
    pub main_content: bool,
}

/// Strip boilerplate from rendered HTML and wrap the remaining content in a
/// minimal document whose `<base>` points at `page_url`.
pub fn archive_html(rendered: &str, page_url: &str) -> ArchivedPage {
    let mut document = Html::parse_document(rendered);
    let title = page_title(&document);

    strip_boilerplate(&mut document);

    let (content, main_content) = match main_content(&document) {
        Some(element) => (element.html(), true),
        None => {
            let body = selector("body")
                .and_then(|s| document.select(&s).next().map(|b| b.inner_html()))
                .unwrap_or_else(|| document.root_element().html());
            (body, false)
        }
    };

    let html = format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n<base href=\"{}\">\n</head>\n<body>\n{}\n</body>\n</html>\n",
        escape_html(title.as_deref().unwrap_or_default()),
        escape_html(page_url),
        content
    );

    ArchivedPage {
        title,
        html,
        main_content,
    }
}

/// Visible text of an HTML document's body; script and style content is dropped.
///
/// Block-level elements start a new line. The result still needs
/// [`crate::services::text::clean_text`].
pub fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let root = selector("body")
        .and_then(|s| document.select(&s).next())
        .unwrap_or_else(|| document.root_element());

    let mut out = String::new();
    collect_text(root, &mut out);
    out
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(&text.replace('\n', " ")),
            Node::Element(el) => {
                let name = el.name();
                if INVISIBLE_TAGS.contains(&name) {
                    continue;
                }
                let block = BLOCK_TAGS.contains(&name);
                if block {
                    out.push('\n');
                }
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_text(child_el, out);
                }
                if block {
                    out.push('\n');
                } else if matches!(name, "td" | "th") {
                    out.push(' ');
                }
            }
            _ => {}
        }
    }
}

/// Text layer of a PDF, page by page. Pages whose text cannot be decoded are skipped.
pub fn pdf_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let document = lopdf::Document::load_mem(bytes)?;
    if document.is_encrypted() {
        return Err(ExtractError::Encrypted);
    }

    let mut pages = Vec::new();
    for page_number in document.get_pages().keys() {
        match document.extract_text(&[*page_number]) {
            Ok(text) => pages.push(text),
            Err(e) => tracing::debug!(page = page_number, error = %e, "Skipping unreadable PDF page"),
        }
    }
    Ok(pages.join("\n\n"))
}

/// Stored snapshot format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Pdf,
}

impl ContentKind {
    /// Decide from the stored content type, falling back to the key and magic bytes.
    pub fn detect(content_type: Option<&str>, key: &str, bytes: &[u8]) -> Self {
        let declared_pdf = content_type
            .map(|ct| ct.to_ascii_lowercase().starts_with("application/pdf"))
            .unwrap_or(false);
        if declared_pdf || key.to_ascii_lowercase().ends_with(".pdf") || bytes.starts_with(b"%PDF-") {
            ContentKind::Pdf
        } else {
            ContentKind::Html
        }
    }
}

fn strip_boilerplate(document: &mut Html) {
    let mut doomed = Vec::new();

    for pattern in ALWAYS_STRIPPED {
        if let Some(sel) = selector(pattern) {
            doomed.extend(document.select(&sel).map(|el| el.id()));
        }
    }
    for pattern in CHROME {
        if let Some(sel) = selector(pattern) {
            doomed.extend(
                document
                    .select(&sel)
                    .filter(|el| !inside_article(el))
                    .map(|el| el.id()),
            );
        }
    }

    for id in doomed {
        if let Some(mut node) = document.tree.get_mut(id) {
            node.detach();
        }
    }
}

fn inside_article(element: &ElementRef<'_>) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| matches!(a.value().name(), "article" | "main"))
}

fn main_content(document: &Html) -> Option<ElementRef<'_>> {
    for pattern in MAIN_CONTENT {
        let Some(sel) = selector(pattern) else { continue };
        let best = document
            .select(&sel)
            .map(|el| (text_len(&el), el))
            .max_by_key(|(len, _)| *len);
        if let Some((len, element)) = best {
            if len >= MIN_MAIN_CONTENT_CHARS {
                return Some(element);
            }
        }
    }
    None
}

fn text_len(element: &ElementRef<'_>) -> usize {
    element
        .text()
        .map(|t| t.split_whitespace().map(str::len).sum::<usize>())
        .sum()
}

fn page_title(document: &Html) -> Option<String> {
    let from_title = selector("title").and_then(|s| {
        document
            .select(&s)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
    });
    let from_og = || {
        selector("meta[property='og:title']").and_then(|s| {
            document
                .select(&s)
                .next()
                .and_then(|el| el.value().attr("content"))
                .map(|c| c.trim().to_string())
        })
    };
    from_title
        .filter(|t| !t.is_empty())
        .or_else(from_og)
        .filter(|t| !t.is_empty())
}

fn selector(pattern: &str) -> Option<Selector> {
    Selector::parse(pattern).ok()
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Unreadable PDF: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("PDF is encrypted")]
    Encrypted,
}
