//! Cookie jar and CSRF header resolution.
//!
//! The token is found through two levels of indirection: one cookie names the
//! request header, another names the cookie that holds the token.

use std::collections::HashMap;

use cookie::Cookie;
use serde::Deserialize;

/// Names of the two cookies that point at the CSRF header and token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CsrfConfig {
    /// Cookie whose value is the name of the request header to set.
    pub header_name_cookie: String,
    /// Cookie whose value is the name of the cookie carrying the token.
    pub token_name_cookie: String,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            header_name_cookie: "csrf_header_name".to_string(),
            token_name_cookie: "csrf_cookie_name".to_string(),
        }
    }
}

/// Cookies visible to the consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: HashMap<String, String>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `Cookie` header value (`a=1; b=2`). Values are percent-decoded
    /// and unquoted; malformed pairs are skipped and the first occurrence of a
    /// name wins.
    pub fn parse(header: &str) -> Self {
        let mut jar = Self::new();
        for cookie in Cookie::split_parse_encoded(header).filter_map(Result::ok) {
            if cookie.name().is_empty() {
                continue;
            }
            jar.cookies
                .entry(cookie.name().to_string())
                .or_insert_with(|| cookie.value_trimmed().to_string());
        }
        jar
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Resolve `(header name, token)` or `None` if any link is missing.
    pub fn csrf_header(&self, config: &CsrfConfig) -> Option<(String, String)> {
        let header = self.get(&config.header_name_cookie)?;
        let token_cookie = self.get(&config.token_name_cookie)?;
        let token = self.get(token_cookie)?;
        Some((header.to_string(), token.to_string()))
    }
}
