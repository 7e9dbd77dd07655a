//! Skin template parsing.
//!
//! A skin is literal text with `<% ... %>` macro tags. A tag holds a dotted
//! macro name, positional and `name=value` parameters, an optional filter
//! chain introduced by `|`, and may nest other tags as parameter values.
//! `<% #name %>` starts a subskin that runs until the next such anchor.

use std::collections::{BTreeMap, HashSet};

use kiln_types::ParamMap;
use tracing::warn;

use super::encode::Encoding;
use crate::error::ScriptError;

/// What a macro's first path segment resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Undotted name, resolved in the global scope.
    Global,
    This,
    Request,
    Response,
    Session,
    Param,
    /// Any other name, looked up among the registered handlers.
    Other,
}

/// How an unhandled macro is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    /// Verbose for untyped or missing handlers, silent otherwise.
    #[default]
    Default,
    Silent,
    Verbose,
}

/// A macro parameter value: literal text or a nested macro.
#[derive(Debug, Clone)]
pub enum Param {
    Literal(String),
    Macro(Box<Macro>),
}

/// The parameters every macro understands.
#[derive(Debug, Clone, Default)]
pub struct StandardParams {
    pub prefix: Option<Param>,
    pub suffix: Option<Param>,
    pub default: Option<Param>,
    pub failmode: FailMode,
}

/// One parsed `<% ... %>` tag.
#[derive(Debug, Clone)]
pub struct Macro {
    start: usize,
    end: usize,
    name: Option<String>,
    path: Vec<String>,
    handler: HandlerKind,
    encoding: Encoding,
    std: StandardParams,
    named: BTreeMap<String, Param>,
    positional: Vec<Param>,
    literal_params: ParamMap,
    has_nested: bool,
    filter: Option<Box<Macro>>,
    is_comment: bool,
    is_subskin: bool,
    extends: Option<String>,
}

impl Macro {
    fn empty(start: usize) -> Self {
        Self {
            start,
            end: start,
            name: None,
            path: Vec::new(),
            handler: HandlerKind::Global,
            encoding: Encoding::None,
            std: StandardParams::default(),
            named: BTreeMap::new(),
            positional: Vec::new(),
            literal_params: ParamMap::new(),
            has_nested: false,
            filter: None,
            is_comment: false,
            is_subskin: false,
            extends: None,
        }
    }

    fn reset(&mut self) {
        *self = Self::empty(self.start);
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// The last path segment: the property or function the macro names.
    pub fn property(&self) -> &str {
        self.path
            .last()
            .map(String::as_str)
            .or(self.name.as_deref())
            .unwrap_or_default()
    }

    pub fn handler(&self) -> HandlerKind {
        self.handler
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn standard_params(&self) -> &StandardParams {
        &self.std
    }

    pub fn named_params(&self) -> &BTreeMap<String, Param> {
        &self.named
    }

    pub fn positional_params(&self) -> &[Param] {
        &self.positional
    }

    /// Named parameters as a map, valid when no parameter is a nested macro.
    pub(crate) fn literal_params(&self) -> &ParamMap {
        &self.literal_params
    }

    pub fn has_nested_macros(&self) -> bool {
        self.has_nested
    }

    pub fn filter(&self) -> Option<&Macro> {
        self.filter.as_deref()
    }

    pub fn is_comment(&self) -> bool {
        self.is_comment
    }

    fn add_param(&mut self, name: Option<String>, value: Param) {
        if matches!(value, Param::Macro(_)) {
            self.has_nested = true;
        }
        let Some(name) = name else {
            self.positional.push(value);
            return;
        };
        match name.as_str() {
            "prefix" => self.std.prefix = Some(value.clone()),
            "suffix" => self.std.suffix = Some(value.clone()),
            "default" => self.std.default = Some(value.clone()),
            "encoding" => {
                if let Param::Literal(text) = &value {
                    match Encoding::from_name(text) {
                        Some(encoding) => self.encoding = encoding,
                        None => warn!(encoding = %text, "Unknown macro encoding"),
                    }
                }
            }
            "failmode" => {
                if let Param::Literal(text) = &value {
                    self.std.failmode = match text.as_str() {
                        "silent" => FailMode::Silent,
                        "verbose" => FailMode::Verbose,
                        _ => FailMode::Default,
                    };
                }
            }
            _ => {}
        }
        self.named.insert(name, value);
    }
}

/// A run of literal text or a macro, in source order.
#[derive(Debug, Clone)]
pub enum Part {
    Text(String),
    Macro(Macro),
}

/// The main body of a skin or one of its subskins.
#[derive(Debug, Clone, Default)]
pub struct SkinBody {
    parts: Vec<Part>,
    has_content: bool,
}

impl SkinBody {
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Whether the body has non-whitespace text or a macro that is not a
    /// comment.
    pub fn has_content(&self) -> bool {
        self.has_content
    }

    pub fn macros(&self) -> impl Iterator<Item = &Macro> {
        self.parts.iter().filter_map(|part| match part {
            Part::Macro(m) => Some(m),
            Part::Text(_) => None,
        })
    }
}

/// A parsed skin: a main body plus named subskins.
#[derive(Debug, Clone)]
pub struct Skin {
    source: String,
    main: SkinBody,
    subskins: BTreeMap<String, SkinBody>,
    extends: Option<String>,
    sandbox: Option<HashSet<String>>,
}

impl Skin {
    pub fn parse(source: impl Into<String>) -> Result<Self, ScriptError> {
        let source = source.into();
        let chars: Vec<char> = source.chars().collect();

        let main_scanner = Scanner {
            src: &chars,
            top_level: true,
        };
        let (main, mut next) = main_scanner.body(0)?;

        let sub_scanner = Scanner {
            src: &chars,
            top_level: false,
        };
        let mut subskins = BTreeMap::new();
        while let Some((name, start)) = next {
            let (body, following) = sub_scanner.body(start)?;
            subskins.insert(name, body);
            next = following;
        }

        let extends = main.macros().filter_map(|m| m.extends.clone()).last();
        Ok(Self {
            source,
            main,
            subskins,
            extends,
            sandbox: None,
        })
    }

    /// Parse a skin that may only call the listed macros.
    pub fn parse_sandboxed<I, S>(source: impl Into<String>, allowed: I) -> Result<Self, ScriptError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut skin = Self::parse(source)?;
        skin.sandbox = Some(allowed.into_iter().map(Into::into).collect());
        Ok(skin)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn main(&self) -> &SkinBody {
        &self.main
    }

    pub fn subskin(&self, name: &str) -> Option<&SkinBody> {
        self.subskins.get(name)
    }

    pub fn has_subskin(&self, name: &str) -> bool {
        self.subskins.contains_key(name)
    }

    pub fn subskin_names(&self) -> impl Iterator<Item = &str> {
        self.subskins.keys().map(String::as_str)
    }

    /// Name of the base skin given by an `.extends` macro.
    pub fn extends(&self) -> Option<&str> {
        self.extends.as_deref()
    }

    /// Whether a macro may run. Unsandboxed skins allow everything.
    pub fn allows_macro(&self, name: &str) -> bool {
        self.sandbox
            .as_ref()
            .is_none_or(|allowed| allowed.contains(name))
    }

    /// Whether the main body or any subskin calls `name`.
    pub fn contains_macro(&self, name: &str) -> bool {
        std::iter::once(&self.main)
            .chain(self.subskins.values())
            .flat_map(SkinBody::macros)
            .any(|m| m.name() == Some(name))
    }

    /// Merge onto a base skin: this skin's main body wins when it has
    /// content, and its subskins replace the base's of the same name.
    pub fn extend(self, base: &Skin) -> Skin {
        let main = if self.main.has_content {
            self.main
        } else {
            base.main.clone()
        };
        let mut subskins = base.subskins.clone();
        subskins.extend(self.subskins);
        Skin {
            source: self.source,
            main,
            subskins,
            extends: self.extends,
            sandbox: self.sandbox,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scanner
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Name,
    Param,
    Done,
}

struct Scanner<'a> {
    src: &'a [char],
    /// Only the main body may declare `.extends`.
    top_level: bool,
}

/// Name and start offset of the subskin following a body.
type NextSubskin = Option<(String, usize)>;

impl Scanner<'_> {
    fn len(&self) -> usize {
        self.src.len()
    }

    fn slice(&self, from: usize, to: usize) -> String {
        self.src[from..to].iter().collect()
    }

    /// Parse a body starting at `offset`, stopping at the next subskin anchor.
    fn body(&self, offset: usize) -> Result<(SkinBody, NextSubskin), ScriptError> {
        let mut parts = Vec::new();
        let mut next = None;
        let mut end = self.len();
        let mut written = offset;
        let mut escape = false;
        let mut i = offset;

        while i + 1 < self.len() {
            if self.src[i] == '<' && self.src[i + 1] == '%' && !escape {
                let m = self.macro_at(i, 2)?;
                if m.is_subskin {
                    next = Some((m.name.clone().unwrap_or_default(), m.end));
                    end = i;
                    break;
                }
                if m.start > written {
                    parts.push(Part::Text(self.slice(written, m.start)));
                }
                written = m.end;
                i = m.end;
                parts.push(Part::Macro(m));
                escape = false;
                continue;
            }
            escape = self.src[i] == '\\' && !escape;
            i += 1;
        }
        if written < end {
            parts.push(Part::Text(self.slice(written, end)));
        }

        let has_content = parts.iter().any(|part| match part {
            Part::Text(text) => text.chars().any(|c| !c.is_whitespace()),
            Part::Macro(m) => !m.is_comment,
        });
        Ok((SkinBody { parts, has_content }, next))
    }

    /// Parse a macro whose tag starts at `start`, with the name beginning
    /// `offset` characters later.
    fn macro_at(&self, start: usize, offset: usize) -> Result<Macro, ScriptError> {
        let mut m = Macro::empty(start);
        let i = self.scan(&mut m, offset, false)?;
        let len = self.len();

        m.end = if m.is_subskin {
            if i + 1 < len && self.src[i] == '\r' && self.src[i + 1] == '\n' {
                i + 2
            } else if i < len && (self.src[i] == '\r' || self.src[i] == '\n') {
                i + 1
            } else {
                i
            }
        } else {
            i
        }
        .min(len);

        m.path = m
            .name
            .as_deref()
            .map(|name| {
                name.split('.')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        m.handler = if m.path.len() <= 1 {
            HandlerKind::Global
        } else {
            match m.path[0].to_lowercase().as_str() {
                "this" => HandlerKind::This,
                "request" => HandlerKind::Request,
                "response" => HandlerKind::Response,
                "session" => HandlerKind::Session,
                "param" => HandlerKind::Param,
                _ => HandlerKind::Other,
            }
        };

        if m.name.as_deref() == Some(".extends") {
            if !self.top_level {
                return Err(ScriptError::Skin(
                    ".extends may only be used in the main skin".to_string(),
                ));
            }
            match m.positional.first() {
                Some(Param::Literal(base)) => m.extends = Some(base.clone()),
                _ => {
                    return Err(ScriptError::Skin(
                        ".extends requires the name of a skin".to_string(),
                    ));
                }
            }
            m.is_comment = true;
        }

        if !m.has_nested {
            m.literal_params = m
                .named
                .iter()
                .filter_map(|(key, value)| match value {
                    Param::Literal(text) => Some((key.clone(), text.clone())),
                    Param::Macro(_) => None,
                })
                .collect();
        }
        Ok(m)
    }

    /// Scan the inside of a tag. Returns the index just past the closing
    /// `%>`. An unbalanced quote triggers one lenient rescan in which `%>`
    /// closes the tag even inside quotes.
    fn scan(&self, m: &mut Macro, offset: usize, lenient: bool) -> Result<usize, ScriptError> {
        let len = self.len();
        let mut state = State::Name;
        let mut escape = false;
        let mut quote: Option<char> = None;
        let mut last_param: Option<String> = None;
        let mut b = String::new();
        let mut i = m.start + offset;

        while i + 1 < len {
            let c = self.src[i];
            match c {
                '<' => {
                    if state == State::Param
                        && quote.is_none()
                        && b.is_empty()
                        && self.src[i + 1] == '%'
                    {
                        let nested = self.macro_at(i, 2)?;
                        let next = nested.end;
                        m.add_param(last_param.take(), Param::Macro(Box::new(nested)));
                        i = next - 1;
                    } else {
                        b.push(c);
                        escape = false;
                    }
                }
                '%' => {
                    if (state != State::Param || quote.is_none() || lenient)
                        && self.src[i + 1] == '>'
                    {
                        state = State::Done;
                        break;
                    }
                    b.push(c);
                    escape = false;
                }
                '/' => {
                    b.push(c);
                    escape = false;
                    if state == State::Name && b == "//" {
                        m.is_comment = true;
                    }
                }
                '#' => {
                    if state == State::Name && b.is_empty() {
                        m.is_subskin = true;
                    } else {
                        b.push(c);
                        escape = false;
                    }
                }
                '|' => {
                    if !escape && quote.is_none() {
                        let filter = self.macro_at(i, 1)?;
                        i = filter.end.saturating_sub(2);
                        m.filter = Some(Box::new(filter));
                        state = State::Done;
                        break;
                    }
                    b.push(c);
                    escape = false;
                }
                '\\' => {
                    if escape {
                        b.push(c);
                    }
                    escape = !escape;
                }
                '"' | '\'' => {
                    if !escape && state == State::Param {
                        if quote == Some(c) {
                            let next = self.src[i + 1];
                            if next != '%' && !next.is_whitespace() && !lenient {
                                m.reset();
                                return self.scan(m, offset, true);
                            }
                            m.add_param(last_param.take(), Param::Literal(std::mem::take(&mut b)));
                            quote = None;
                        } else if quote.is_none() {
                            quote = Some(c);
                            b.clear();
                        } else {
                            b.push(c);
                        }
                    } else {
                        b.push(c);
                    }
                    escape = false;
                }
                ' ' | '\t' | '\n' | '\r' | '\u{c}' => {
                    if state == State::Name && !b.is_empty() {
                        m.name = Some(b.trim().to_string());
                        b.clear();
                        state = State::Param;
                    } else if state == State::Param {
                        if quote.is_none() {
                            if !b.is_empty() {
                                m.add_param(last_param.take(), Param::Literal(std::mem::take(&mut b)));
                            }
                        } else {
                            b.push(c);
                            escape = false;
                        }
                    }
                }
                '=' => {
                    if !escape && quote.is_none() && state == State::Param && last_param.is_none() {
                        last_param = Some(b.trim().to_string());
                        b.clear();
                    } else {
                        b.push(c);
                        escape = false;
                    }
                }
                _ => {
                    b.push(c);
                    escape = false;
                }
            }

            if i + 2 == len && !lenient && (state != State::Done || quote.is_some()) {
                m.reset();
                return self.scan(m, offset, true);
            }
            i += 1;
        }

        if !b.is_empty() {
            if m.name.is_none() {
                m.name = Some(b.trim().to_string());
            } else {
                m.add_param(last_param.take(), Param::Literal(b));
            }
        }
        if state != State::Done {
            warn!(
                tag = %self.slice(m.start, (m.start + 40).min(len)),
                "Unterminated macro tag"
            );
        }
        Ok(i + 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn only_macro(skin: &Skin) -> &Macro {
        let mut macros = skin.main().macros();
        let m = macros.next().unwrap();
        assert!(macros.next().is_none());
        m
    }

    #[test]
    fn test_text_and_macro_parts() {
        let skin = Skin::parse("Hello <% user.name %>!").unwrap();
        let parts = skin.main().parts();
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[0], Part::Text(t) if t == "Hello "));
        assert!(matches!(&parts[2], Part::Text(t) if t == "!"));

        let m = only_macro(&skin);
        assert_eq!(m.name(), Some("user.name"));
        assert_eq!(m.path(), ["user", "name"]);
        assert_eq!(m.property(), "name");
        assert_eq!(m.handler(), HandlerKind::Other);
    }

    #[test]
    fn test_handler_kinds() {
        let kind = |src: &str| only_macro(&Skin::parse(src).unwrap()).handler();
        assert_eq!(kind("<% title %>"), HandlerKind::Global);
        assert_eq!(kind("<% this.title %>"), HandlerKind::This);
        assert_eq!(kind("<% Response.message %>"), HandlerKind::Response);
        assert_eq!(kind("<% param.x %>"), HandlerKind::Param);
        assert_eq!(kind("<% session.user %>"), HandlerKind::Session);
    }

    #[test]
    fn test_named_and_positional_params() {
        let skin = Skin::parse(r#"<% link "home" to='/' prefix="[" suffix=] %>"#).unwrap();
        let m = only_macro(&skin);
        assert!(matches!(&m.positional_params()[0], Param::Literal(s) if s == "home"));
        assert!(matches!(m.named_params().get("to"), Some(Param::Literal(s)) if s == "/"));
        assert!(matches!(&m.standard_params().prefix, Some(Param::Literal(s)) if s == "["));
        assert!(matches!(&m.standard_params().suffix, Some(Param::Literal(s)) if s == "]"));
        assert_eq!(m.literal_params().get_str("to"), Some("/"));
        assert!(!m.has_nested_macros());
    }

    #[test]
    fn test_escaped_quote_in_param() {
        let skin = Skin::parse(r#"<% say text="a \"quoted\" word" %>"#).unwrap();
        let m = only_macro(&skin);
        assert_eq!(m.literal_params().get_str("text"), Some(r#"a "quoted" word"#));
    }

    #[test]
    fn test_encoding_and_failmode() {
        let skin = Skin::parse(r#"<% this.body encoding="html" failmode="silent" %>"#).unwrap();
        let m = only_macro(&skin);
        assert_eq!(m.encoding(), Encoding::Html);
        assert_eq!(m.standard_params().failmode, FailMode::Silent);
    }

    #[test]
    fn test_nested_macro_param() {
        let skin = Skin::parse(r#"<% link to=<% this.href %> text="go" %> tail"#).unwrap();
        let m = only_macro(&skin);
        assert!(m.has_nested_macros());
        match m.named_params().get("to") {
            Some(Param::Macro(inner)) => assert_eq!(inner.name(), Some("this.href")),
            other => panic!("expected nested macro, got {other:?}"),
        }
        assert!(matches!(skin.main().parts().last(), Some(Part::Text(t)) if t == " tail"));
    }

    #[test]
    fn test_filter_chain() {
        let skin = Skin::parse("<% this.title | lowercase | truncate 10 %>").unwrap();
        let m = only_macro(&skin);
        assert_eq!(m.name(), Some("this.title"));
        let first = m.filter().unwrap();
        assert_eq!(first.name(), Some("lowercase"));
        let second = first.filter().unwrap();
        assert_eq!(second.name(), Some("truncate"));
        assert!(matches!(&second.positional_params()[0], Param::Literal(s) if s == "10"));
    }

    #[test]
    fn test_comment_macro_has_no_content() {
        let skin = Skin::parse("  <% // just a note %>\n").unwrap();
        assert!(only_macro(&skin).is_comment());
        assert!(!skin.main().has_content());

        let skin = Skin::parse("<%// note %>x").unwrap();
        assert!(skin.main().has_content());
    }

    #[test]
    fn test_subskins() {
        let src = "main body\n<% #row %>\r\n<li><% this.name %></li>\n<% #footer %>\nbye";
        let skin = Skin::parse(src).unwrap();

        assert!(matches!(&skin.main().parts()[0], Part::Text(t) if t == "main body\n"));
        assert!(skin.has_subskin("row"));
        assert!(skin.has_subskin("footer"));
        assert_eq!(skin.subskin_names().collect::<Vec<_>>(), ["footer", "row"]);

        let row = skin.subskin("row").unwrap();
        assert!(matches!(&row.parts()[0], Part::Text(t) if t == "<li>"));
        assert!(matches!(row.parts().last(), Some(Part::Text(t)) if t == "</li>\n"));

        let footer = skin.subskin("footer").unwrap();
        assert!(matches!(&footer.parts()[0], Part::Text(t) if t == "bye"));
    }

    #[test]
    fn test_escaped_tag_is_text() {
        let skin = Skin::parse(r"a \<% not a macro %> b").unwrap();
        assert_eq!(skin.main().macros().count(), 0);
    }

    #[test]
    fn test_unbalanced_quote_is_lenient() {
        let skin = Skin::parse(r#"<% say text="oops %> after"#).unwrap();
        let m = only_macro(&skin);
        assert_eq!(m.name(), Some("say"));
        assert!(matches!(skin.main().parts().last(), Some(Part::Text(t)) if t == " after"));
    }

    #[test]
    fn test_extends() {
        let skin = Skin::parse(r#"<% .extends "base" %><% #content %>mine"#).unwrap();
        assert_eq!(skin.extends(), Some("base"));
        assert!(!skin.main().has_content());

        let err = Skin::parse("<% #sub %><% .extends \"base\" %>").unwrap_err();
        assert!(matches!(err, ScriptError::Skin(_)));
        assert!(Skin::parse("<% .extends %>").is_err());
    }

    #[test]
    fn test_extend_merges_onto_base() {
        let base = Skin::parse("frame<% #content %>base content<% #side %>side").unwrap();
        let child = Skin::parse(r#"<% .extends "base" %><% #content %>mine"#).unwrap();
        let merged = child.extend(&base);

        assert!(matches!(&merged.main().parts()[0], Part::Text(t) if t == "frame"));
        let content = merged.subskin("content").unwrap();
        assert!(matches!(&content.parts()[0], Part::Text(t) if t == "mine"));
        assert!(merged.has_subskin("side"));
    }

    #[test]
    fn test_sandbox() {
        let skin = Skin::parse_sandboxed("<% title %>", ["title"]).unwrap();
        assert!(skin.allows_macro("title"));
        assert!(!skin.allows_macro("delete"));
        assert!(Skin::parse("x").unwrap().allows_macro("anything"));
        assert!(skin.contains_macro("title"));
    }
}
