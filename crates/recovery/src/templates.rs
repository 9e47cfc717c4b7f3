//! Merchant dunning-email templates
//!
//! One template per `(merchant_id, retry_attempt)` with attempt in 1..=3.
//! Bodies are sanitized against an HTML allowlist before storage; the only
//! substitution tokens honored at render time are `{{customer_name}}`,
//! `{{amount}}` and `{{update_url}}`.

use sqlx::PgPool;

use crate::error::RecoveryResult;

pub const MAX_SUBJECT_LEN: usize = 200;
pub const MIN_RETRY_ATTEMPT: i32 = 1;
pub const MAX_RETRY_ATTEMPT: i32 = 3;

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct EmailTemplate {
    pub merchant_id: String,
    pub retry_attempt: i32,
    pub subject: String,
    pub body: String,
}

#[derive(Clone)]
pub struct TemplateStore {
    pool: PgPool,
}

impl TemplateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(
        &self,
        merchant_id: &str,
        retry_attempt: i32,
        subject: &str,
        body: &str,
    ) -> RecoveryResult<EmailTemplate> {
        let template: EmailTemplate = sqlx::query_as(
            r#"
            INSERT INTO email_templates (merchant_id, retry_attempt, subject, body)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (merchant_id, retry_attempt)
            DO UPDATE SET subject = EXCLUDED.subject, body = EXCLUDED.body
            RETURNING merchant_id, retry_attempt, subject, body
            "#,
        )
        .bind(merchant_id)
        .bind(retry_attempt)
        .bind(subject)
        .bind(body)
        .fetch_one(&self.pool)
        .await?;
        Ok(template)
    }

    pub async fn get(
        &self,
        merchant_id: &str,
        retry_attempt: i32,
    ) -> RecoveryResult<Option<EmailTemplate>> {
        Ok(sqlx::query_as(
            "SELECT merchant_id, retry_attempt, subject, body \
             FROM email_templates \
             WHERE merchant_id = $1 AND retry_attempt = $2",
        )
        .bind(merchant_id)
        .bind(retry_attempt)
        .fetch_optional(&self.pool)
        .await?)
    }
}

// =============================================================================
// HTML sanitizer
// =============================================================================

const ALLOWED_TAGS: [&str; 15] = [
    "p", "br", "strong", "em", "b", "i", "u", "h1", "h2", "h3", "ul", "ol", "li", "span", "a",
];

fn is_allowed(name: &str) -> bool {
    ALLOWED_TAGS.contains(&name)
}

/// Tags whose content must be dropped along with the tag itself.
fn swallows_content(name: &str) -> bool {
    name == "script" || name == "style"
}

struct ParsedTag<'a> {
    name: String,
    closing: bool,
    attrs: &'a str,
    consumed: usize,
}

fn parse_tag(input: &str) -> Option<ParsedTag<'_>> {
    debug_assert!(input.starts_with('<'));
    let end = input.find('>')?;
    let mut inner = &input[1..end];

    let closing = inner.starts_with('/');
    if closing {
        inner = &inner[1..];
    }

    let name_len = inner
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(inner.len());
    if name_len == 0 {
        return None;
    }

    Some(ParsedTag {
        name: inner[..name_len].to_ascii_lowercase(),
        closing,
        attrs: &inner[name_len..],
        consumed: end + 1,
    })
}

/// Pull an `https://` href out of a raw attribute string; anything else
/// (http, javascript:, data:, unquoted) is dropped.
fn extract_safe_href(attrs: &str) -> Option<&str> {
    let idx = attrs.to_ascii_lowercase().find("href=")?;
    let rest = &attrs[idx + 5..];
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let rest = &rest[1..];
    let close = rest.find(quote)?;
    let href = &rest[..close];
    if href.starts_with("https://") || href == "{{update_url}}" {
        Some(href)
    } else {
        None
    }
}

/// Reduce HTML to the allowlisted tags, dropping every attribute except a
/// safe `href` on anchors. Unknown tags are stripped but their text kept;
/// script and style lose their content too.
pub fn sanitize_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(idx) = rest.find('<') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];

        let Some(tag) = parse_tag(rest) else {
            // Stray '<' with no closing bracket; neutralize it.
            out.push_str("&lt;");
            rest = &rest[1..];
            continue;
        };

        let consumed = tag.consumed;
        if tag.closing {
            if is_allowed(&tag.name) {
                out.push_str("</");
                out.push_str(&tag.name);
                out.push('>');
            }
        } else if is_allowed(&tag.name) {
            if tag.name == "a" {
                match extract_safe_href(tag.attrs) {
                    Some(href) => {
                        out.push_str("<a href=\"");
                        out.push_str(href);
                        out.push_str("\">");
                    }
                    None => out.push_str("<a>"),
                }
            } else {
                out.push('<');
                out.push_str(&tag.name);
                out.push('>');
            }
        } else if swallows_content(&tag.name) {
            let close = format!("</{}", tag.name);
            let lower = rest.to_ascii_lowercase();
            if let Some(close_idx) = lower[consumed..].find(&close) {
                let after = consumed + close_idx;
                let skip = rest[after..]
                    .find('>')
                    .map(|i| after + i + 1)
                    .unwrap_or(rest.len());
                rest = &rest[skip..];
                continue;
            }
            // No closing tag; drop everything after it.
            rest = "";
            continue;
        }

        rest = &rest[consumed..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_allowlisted_markup() {
        let body = "<p>Hello <strong>{{customer_name}}</strong>,<br>pay {{amount}}.</p>";
        assert_eq!(sanitize_html(body), body);
    }

    #[test]
    fn strips_script_with_content() {
        let body = "<p>Hi</p><script>alert('x')</script><p>Bye</p>";
        assert_eq!(sanitize_html(body), "<p>Hi</p><p>Bye</p>");
    }

    #[test]
    fn strips_unknown_tags_but_keeps_text() {
        let body = "<table><tr><td>cell</td></tr></table>";
        assert_eq!(sanitize_html(body), "cell");
    }

    #[test]
    fn drops_event_handler_attributes() {
        let body = r#"<p onclick="steal()">Hi</p>"#;
        assert_eq!(sanitize_html(body), "<p>Hi</p>");
    }

    #[test]
    fn keeps_https_hrefs_only() {
        assert_eq!(
            sanitize_html(r#"<a href="https://ok.example/pay">pay</a>"#),
            r#"<a href="https://ok.example/pay">pay</a>"#
        );
        assert_eq!(
            sanitize_html(r#"<a href="javascript:alert(1)">pay</a>"#),
            "<a>pay</a>"
        );
        assert_eq!(
            sanitize_html(r#"<a href="http://plain.example">pay</a>"#),
            "<a>pay</a>"
        );
    }

    #[test]
    fn update_url_token_survives_in_href() {
        assert_eq!(
            sanitize_html(r#"<a href="{{update_url}}">Update card</a>"#),
            r#"<a href="{{update_url}}">Update card</a>"#
        );
    }

    #[test]
    fn neutralizes_stray_angle_bracket() {
        assert_eq!(sanitize_html("1 < 2"), "1 &lt; 2");
    }

    #[test]
    fn unterminated_script_drops_remainder() {
        assert_eq!(sanitize_html("<p>ok</p><script>evil"), "<p>ok</p>");
    }
}
