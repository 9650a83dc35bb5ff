//! Template rendering and tag formatting.

use crate::FieldValue;
use std::collections::BTreeMap;

/// Renders a message template by substituting `${name}` and `$name`
/// placeholders from `kwargs`. `$$` escapes a literal dollar sign. Unknown
/// placeholders are left verbatim so receivers can surface template bugs
/// without the core rejecting the message.
pub fn render_template(template: &str, kwargs: &BTreeMap<String, FieldValue>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                out.push('$');
                let _ = chars.next();
            }
            Some('{') => {
                let _ = chars.next();
                let mut name = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                match kwargs.get(&name) {
                    Some(value) if closed => out.push_str(&value.to_string()),
                    _ => {
                        out.push_str("${");
                        out.push_str(&name);
                        if closed {
                            out.push('}');
                        }
                    }
                }
            }
            Some(n) if n.is_ascii_alphabetic() || *n == '_' => {
                let mut name = String::new();
                while let Some(n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || *n == '_' {
                        name.push(*n);
                        let _ = chars.next();
                    } else {
                        break;
                    }
                }
                match kwargs.get(&name) {
                    Some(value) => out.push_str(&value.to_string()),
                    None => {
                        out.push('$');
                        out.push_str(&name);
                    }
                }
            }
            _ => out.push('$'),
        }
    }

    out
}

/// Turns tags into `#hash_tags`: every run of non-alphanumeric characters
/// collapses to a single underscore and the result is lowercased.
pub fn make_hash_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .map(|tag| {
            let mut hash_tag = String::with_capacity(tag.len() + 1);
            hash_tag.push('#');
            let mut last_underscore = false;
            for c in tag.chars() {
                if c.is_alphanumeric() {
                    hash_tag.extend(c.to_lowercase());
                    last_underscore = false;
                } else if !last_underscore {
                    hash_tag.push('_');
                    last_underscore = true;
                }
            }
            hash_tag
        })
        .collect()
}

/// Minimal HTML escaping for receivers that send HTML-parsed text.
pub fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kwargs(pairs: &[(&str, &str)]) -> BTreeMap<String, FieldValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::from(*v)))
            .collect()
    }

    #[test]
    fn renders_braced_and_bare_placeholders() {
        let kw = kwargs(&[("title", "Hello"), ("url", "https://e.com")]);
        assert_eq!(
            render_template("${title} at $url", &kw),
            "Hello at https://e.com"
        );
    }

    #[test]
    fn missing_placeholder_is_left_verbatim() {
        let kw = kwargs(&[("title", "Hello")]);
        assert_eq!(render_template("${title} ${oops}", &kw), "Hello ${oops}");
        assert_eq!(render_template("$title $oops", &kw), "Hello $oops");
    }

    #[test]
    fn double_dollar_escapes() {
        let kw = kwargs(&[("price", "5")]);
        assert_eq!(render_template("$$${price}", &kw), "$5");
    }

    #[test]
    fn renders_numeric_kwargs() {
        let mut kw = BTreeMap::new();
        let _ = kw.insert("score".to_string(), FieldValue::Int(99));
        assert_eq!(render_template("score=${score}", &kw), "score=99");
    }

    #[test]
    fn hash_tags_collapse_punctuation() {
        let tags = vec!["Rust Lang".to_string(), "c++/news".to_string()];
        assert_eq!(make_hash_tags(&tags), vec!["#rust_lang", "#c_news"]);
    }

    #[test]
    fn escapes_html() {
        assert_eq!(html_escape("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#x27;");
    }
}
