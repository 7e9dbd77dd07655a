//! Output encodings for macro results.

/// Encoding applied to a macro's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    None,
    Html,
    Xml,
    Form,
    Url,
    All,
}

impl Encoding {
    /// Parse the value of an `encoding` macro parameter.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "html" => Some(Encoding::Html),
            "xml" => Some(Encoding::Xml),
            "form" => Some(Encoding::Form),
            "url" => Some(Encoding::Url),
            "all" => Some(Encoding::All),
            _ => None,
        }
    }

    pub fn apply(self, text: &str) -> String {
        match self {
            Encoding::None => text.to_string(),
            Encoding::Html => html(text),
            Encoding::Xml => xml(text),
            Encoding::Form => form(text),
            Encoding::Url => url(text),
            Encoding::All => all(text),
        }
    }
}

/// Escape markup and turn line breaks into `<br />`.
pub fn html(text: &str) -> String {
    encode_with(text, false)
}

/// Like [`html`], also escaping single quotes.
pub fn all(text: &str) -> String {
    encode_with(text, true)
}

fn encode_with(text: &str, quotes: bool) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' if quotes => out.push_str("&#39;"),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str("<br />\n");
            }
            '\n' => out.push_str("<br />\n"),
            c => out.push(c),
        }
    }
    out
}

/// Escape for XML text and attribute values.
pub fn xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Escape for use inside a form field value, keeping line breaks as
/// character references.
pub fn form(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            c => out.push(c),
        }
    }
    out
}

/// Percent-encode for use in a URL.
pub fn url(text: &str) -> String {
    urlencoding::encode(text).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html() {
        assert_eq!(html("a < b & \"c\""), "a &lt; b &amp; &quot;c&quot;");
        assert_eq!(html("one\ntwo\r\nthree"), "one<br />\ntwo<br />\nthree");
        assert_eq!(html("it's"), "it's");
        assert_eq!(all("it's"), "it&#39;s");
    }

    #[test]
    fn test_xml_and_form() {
        assert_eq!(xml("<a href='x'>"), "&lt;a href=&#39;x&#39;&gt;");
        assert_eq!(form("a\nb\""), "a&#10;b&quot;");
    }

    #[test]
    fn test_url() {
        assert_eq!(url("a b&c"), "a%20b%26c");
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Encoding::from_name("html"), Some(Encoding::Html));
        assert_eq!(Encoding::from_name("HTML"), None);
        assert_eq!(Encoding::None.apply("<x>"), "<x>");
    }
}
