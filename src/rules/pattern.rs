use crate::ConfigError;
use regex::Regex;
use std::fmt;

/// A compiled URL pattern
///
/// Patterns are regular expressions with glob sugar, compiled once at rule
/// registration:
/// 1. An unescaped `.` is a literal dot
/// 2. `**` matches anything (`.*`)
/// 3. `<.>` is the regex any-character
/// 4. Escaped sequences such as `\.` or `\d` are kept as written
///
/// Matching is a search, not a full match: `example.com/**` matches
/// `https://example.com/news`.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    /// Compiles a glob-flavoured pattern
    ///
    /// # Examples
    ///
    /// ```
    /// use tidepool::rules::Pattern;
    ///
    /// let pattern = Pattern::compile("example.com/news/**").unwrap();
    /// assert!(pattern.is_match("https://example.com/news/today"));
    /// assert!(!pattern.is_match("https://exampleXcom/news/today"));
    /// ```
    pub fn compile(pattern: &str) -> Result<Self, ConfigError> {
        let translated = glob_to_regex(pattern);
        let regex = Regex::new(&translated).map_err(|source| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Pattern matching every URL
    pub fn match_all() -> Self {
        Self {
            source: "**".to_string(),
            regex: Regex::new(".*").expect("static regex compiles"),
        }
    }

    pub fn is_match(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    /// The pattern as written at registration
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The translated regular expression
    pub fn as_regex(&self) -> &str {
        self.regex.as_str()
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.source).finish()
    }
}

/// Translates glob sugar into a regular expression
pub fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut rest = pattern;

    while let Some(c) = rest.chars().next() {
        if rest.starts_with("<.>") {
            out.push('.');
            rest = &rest[3..];
            continue;
        }

        if rest.starts_with("**") {
            out.push_str(".*");
            rest = &rest[2..];
            continue;
        }

        match c {
            '\\' => {
                out.push('\\');
                rest = &rest[1..];
                if let Some(escaped) = rest.chars().next() {
                    out.push(escaped);
                    rest = &rest[escaped.len_utf8()..];
                }
                continue;
            }
            '.' => out.push_str("\\."),
            other => out.push(other),
        }
        rest = &rest[c.len_utf8()..];
    }

    out
}

/// Builds a pattern matching everything under the directory of `url`
///
/// # Examples
///
/// ```
/// use tidepool::rules::pattern_for_path;
///
/// assert_eq!(
///     pattern_for_path("https://example.com/news/2024/index.html"),
///     "https://example.com/news/2024/**"
/// );
/// ```
pub fn pattern_for_path(url: &str) -> String {
    let authority_start = url.find("://").map(|i| i + 3).unwrap_or(0);

    let dir = match url[authority_start..].rfind('/') {
        Some(i) => &url[..authority_start + i],
        None => url,
    };

    format!("{}/**", dir)
}
