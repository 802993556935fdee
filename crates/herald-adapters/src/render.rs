//! Rendering a payload into each platform's text format.

use herald_scheduler::Payload;

/// Plain text for short-form networks: body, link, then hashtags.
pub(crate) fn social_text(payload: &Payload) -> String {
    let mut parts = vec![payload.text.trim().to_string()];
    if let Some(link) = payload.link.as_deref().filter(|l| !l.is_empty()) {
        parts.push(link.to_string());
    }
    let tags: Vec<String> = payload
        .tags
        .iter()
        .map(|t| t.trim().trim_start_matches('#'))
        .filter(|t| !t.is_empty())
        .map(|t| format!("#{}", t.replace(char::is_whitespace, "")))
        .collect();
    if !tags.is_empty() {
        parts.push(tags.join(" "));
    }
    parts.retain(|p| !p.is_empty());
    parts.join("\n\n")
}

/// HTML body for CMS posts.
pub(crate) fn html_content(payload: &Payload) -> String {
    let mut html = String::new();
    for paragraph in payload
        .text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        html.push_str("<p>");
        html.push_str(&escape_html(paragraph).replace('\n', "<br />"));
        html.push_str("</p>\n");
    }
    for media in &payload.media {
        html.push_str(&format!(
            "<figure><img src=\"{}\" alt=\"{}\" /></figure>\n",
            escape_html(&media.url),
            escape_html(&media.alt)
        ));
    }
    if let Some(link) = payload.link.as_deref().filter(|l| !l.is_empty()) {
        let link = escape_html(link);
        html.push_str(&format!("<p><a href=\"{link}\">{link}</a></p>\n"));
    }
    html
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_scheduler::MediaRef;
    use pretty_assertions::assert_eq;

    fn payload() -> Payload {
        Payload {
            text: "Release 2.0 is out.\n\nFaster & <smaller>.".to_string(),
            link: Some("https://example.com/r?a=1&b=2".to_string()),
            media: vec![MediaRef {
                url: "https://cdn.example.com/shot.png".to_string(),
                mime_type: "image/png".to_string(),
                alt: "Screenshot".to_string(),
            }],
            tags: vec!["rust".to_string(), "#release notes".to_string(), " ".to_string()],
        }
    }

    #[test]
    fn test_social_text() {
        assert_eq!(
            social_text(&payload()),
            "Release 2.0 is out.\n\nFaster & <smaller>.\n\nhttps://example.com/r?a=1&b=2\n\n#rust #releasenotes"
        );
    }

    #[test]
    fn test_social_text_body_only() {
        let payload = Payload {
            text: "  just text  ".to_string(),
            ..Default::default()
        };
        assert_eq!(social_text(&payload), "just text");
    }

    #[test]
    fn test_html_content_escapes() {
        let html = html_content(&payload());
        assert!(html.starts_with("<p>Release 2.0 is out.</p>\n<p>Faster &amp; &lt;smaller&gt;.</p>"));
        assert!(html.contains("<img src=\"https://cdn.example.com/shot.png\" alt=\"Screenshot\" />"));
        assert!(html.contains("href=\"https://example.com/r?a=1&amp;b=2\""));
    }
}
