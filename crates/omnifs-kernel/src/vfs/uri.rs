//! RFC 3986 URIs over raw bytes.
//!
//! Components are stored in their encoded (display) form. Decoded views
//! return raw bytes, since a decoded path segment is not guaranteed to be
//! valid UTF-8. Equality, hashing and ordering use the canonical encoded
//! string.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Errors from parsing or building a [`Uri`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("invalid scheme: {0:?}")]
    InvalidScheme(String),
    #[error("invalid character {ch:?} in {component}: {value:?}")]
    InvalidCharacter {
        component: &'static str,
        ch: char,
        value: String,
    },
    #[error("malformed percent-encoding in {0:?}")]
    MalformedEscape(String),
    #[error("invalid port: {0:?}")]
    InvalidPort(String),
    #[error("path must be absolute or empty when an authority is present: {0:?}")]
    RelativePathWithAuthority(String),
}

// RFC 3986, appendix B.
static URI_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:([^:/?#]+):)?(?://([^/?#]*))?([^?#]*)(?:\?([^#]*))?(?:#(.*))?$")
        .expect("static URI regex")
});

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

fn is_sub_delim(b: u8) -> bool {
    matches!(
        b,
        b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+' | b',' | b';' | b'='
    )
}

fn is_pchar(b: u8) -> bool {
    is_unreserved(b) || is_sub_delim(b) || b == b':' || b == b'@'
}

/// Characters allowed unescaped in a path segment.
pub fn is_segment_char(b: u8) -> bool {
    is_pchar(b)
}

/// Characters allowed unescaped in a path.
pub fn is_path_char(b: u8) -> bool {
    is_pchar(b) || b == b'/'
}

/// Characters allowed unescaped in a query or fragment.
pub fn is_query_char(b: u8) -> bool {
    is_pchar(b) || b == b'/' || b == b'?'
}

/// Characters allowed unescaped in a query parameter key or value.
pub fn is_query_param_char(b: u8) -> bool {
    is_query_char(b) && !matches!(b, b'&' | b'=' | b'+')
}

fn is_user_info_char(b: u8) -> bool {
    is_unreserved(b) || is_sub_delim(b) || b == b':'
}

fn is_reg_name_char(b: u8) -> bool {
    is_unreserved(b) || is_sub_delim(b)
}

/// Strictest class: only unreserved characters survive unescaped.
pub fn is_unreserved_char(b: u8) -> bool {
    is_unreserved(b)
}

/// Percent-encode `bytes`, leaving bytes accepted by `allowed` as-is.
pub fn percent_encode(bytes: &[u8], allowed: impl Fn(u8) -> bool) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if allowed(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0f) as usize] as char);
        }
    }
    out
}

/// Decode `%XX` escapes into raw bytes.
pub fn percent_decode(encoded: &str) -> Result<Vec<u8>, UriError> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| UriError::MalformedEscape(encoded.to_string()))?;
            let hi = (hex[0] as char).to_digit(16);
            let lo = (hex[1] as char).to_digit(16);
            match (hi, lo) {
                (Some(hi), Some(lo)) => out.push((hi * 16 + lo) as u8),
                _ => return Err(UriError::MalformedEscape(encoded.to_string())),
            }
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn validate(
    component: &'static str,
    value: &str,
    allowed: impl Fn(u8) -> bool,
) -> Result<(), UriError> {
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'%' {
            let ok = bytes
                .get(i + 1..i + 3)
                .is_some_and(|h| h.iter().all(u8::is_ascii_hexdigit));
            if !ok {
                return Err(UriError::MalformedEscape(value.to_string()));
            }
            i += 3;
            continue;
        }
        if !allowed(b) {
            let ch = value[i..].chars().next().unwrap_or('\u{fffd}');
            return Err(UriError::InvalidCharacter {
                component,
                ch,
                value: value.to_string(),
            });
        }
        i += 1;
    }
    Ok(())
}

fn validate_scheme(scheme: &str) -> Result<(), UriError> {
    let mut bytes = scheme.bytes();
    let valid = bytes.next().is_some_and(|b| b.is_ascii_alphabetic())
        && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(UriError::InvalidScheme(scheme.to_string()))
    }
}

fn validate_host(host: &str) -> Result<(), UriError> {
    if host.starts_with('[') && host.ends_with(']') {
        // IP-literal
        return validate("host", &host[1..host.len() - 1], |b| {
            b.is_ascii_hexdigit() || matches!(b, b':' | b'.') || is_unreserved(b) || is_sub_delim(b)
        });
    }
    validate("host", host, is_reg_name_char)
}

/// The authority component: `[userinfo@]host[:port]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authority {
    user_info: Option<String>,
    host: String,
    port: Option<u16>,
}

impl Authority {
    fn parse(raw: &str) -> Result<Self, UriError> {
        let (user_info, host_port) = match raw.rfind('@') {
            Some(at) => (Some(&raw[..at]), &raw[at + 1..]),
            None => (None, raw),
        };
        let (host, port) = if host_port.starts_with('[') {
            match host_port.find(']') {
                Some(end) => {
                    let rest = &host_port[end + 1..];
                    let port = rest.strip_prefix(':');
                    (&host_port[..=end], port)
                }
                None => (host_port, None),
            }
        } else {
            match host_port.rfind(':') {
                Some(colon) => (&host_port[..colon], Some(&host_port[colon + 1..])),
                None => (host_port, None),
            }
        };
        if let Some(user_info) = user_info {
            validate("user info", user_info, is_user_info_char)?;
        }
        validate_host(host)?;
        let port = match port {
            None | Some("") => None,
            Some(p) => Some(p.parse().map_err(|_| UriError::InvalidPort(p.to_string()))?),
        };
        Ok(Self {
            user_info: user_info.map(str::to_string),
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    fn write(&self, out: &mut String) {
        if let Some(user_info) = &self.user_info {
            out.push_str(user_info);
            out.push('@');
        }
        out.push_str(&self.host);
        if let Some(port) = self.port {
            out.push(':');
            out.push_str(&port.to_string());
        }
    }
}

/// An RFC 3986 URI.
#[derive(Clone)]
pub struct Uri {
    scheme: Option<String>,
    authority: Option<Authority>,
    path: String,
    query: Option<String>,
    fragment: Option<String>,
    canonical: String,
}

impl Uri {
    /// Parse an encoded URI string, validating every component.
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let caps = URI_REGEX
            .captures(input)
            .ok_or_else(|| UriError::InvalidScheme(input.to_string()))?;
        let scheme = caps.get(1).map(|m| m.as_str().to_ascii_lowercase());
        let authority = caps.get(2).map(|m| Authority::parse(m.as_str())).transpose()?;
        let path = caps.get(3).map_or("", |m| m.as_str()).to_string();
        let query = caps.get(4).map(|m| m.as_str().to_string());
        let fragment = caps.get(5).map(|m| m.as_str().to_string());
        Self::from_parts(scheme, authority, path, query, fragment)
    }

    fn from_parts(
        scheme: Option<String>,
        authority: Option<Authority>,
        path: String,
        query: Option<String>,
        fragment: Option<String>,
    ) -> Result<Self, UriError> {
        if let Some(scheme) = &scheme {
            validate_scheme(scheme)?;
        }
        validate("path", &path, is_path_char)?;
        if authority.is_some() && !path.is_empty() && !path.starts_with('/') {
            return Err(UriError::RelativePathWithAuthority(path));
        }
        if let Some(query) = &query {
            validate("query", query, is_query_char)?;
        }
        if let Some(fragment) = &fragment {
            validate("fragment", fragment, is_query_char)?;
        }
        let mut uri = Self {
            scheme,
            authority,
            path,
            query,
            fragment,
            canonical: String::new(),
        };
        uri.canonical = uri.build_canonical();
        Ok(uri)
    }

    fn build_canonical(&self) -> String {
        let mut out = String::new();
        if let Some(scheme) = &self.scheme {
            out.push_str(scheme);
            out.push(':');
        }
        if let Some(authority) = &self.authority {
            out.push_str("//");
            authority.write(&mut out);
        }
        out.push_str(&self.path);
        if let Some(query) = &self.query {
            out.push('?');
            out.push_str(query);
        }
        if let Some(fragment) = &self.fragment {
            out.push('#');
            out.push_str(fragment);
        }
        out
    }

    /// Start building a URI from components.
    pub fn builder() -> UriBuilder {
        UriBuilder::default()
    }

    /// Builder pre-populated with this URI's components.
    pub fn to_builder(&self) -> UriBuilder {
        UriBuilder {
            scheme: self.scheme.clone(),
            authority: self.authority.clone(),
            path: self.path.clone(),
            query: self.query.clone(),
            fragment: self.fragment.clone(),
        }
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    pub fn is_absolute(&self) -> bool {
        self.scheme.is_some()
    }

    pub fn has_authority(&self) -> bool {
        self.authority.is_some()
    }

    /// Encoded authority, e.g. `user@host:21`.
    pub fn encoded_authority(&self) -> Option<String> {
        self.authority.as_ref().map(|a| {
            let mut out = String::new();
            a.write(&mut out);
            out
        })
    }

    pub fn encoded_user_info(&self) -> Option<&str> {
        self.authority.as_ref()?.user_info.as_deref()
    }

    pub fn decoded_user_info(&self) -> Option<Vec<u8>> {
        self.encoded_user_info().and_then(|u| percent_decode(u).ok())
    }

    pub fn host(&self) -> Option<&str> {
        self.authority.as_ref().map(|a| a.host.as_str())
    }

    pub fn port(&self) -> Option<u16> {
        self.authority.as_ref()?.port
    }

    pub fn encoded_path(&self) -> &str {
        &self.path
    }

    pub fn decoded_path(&self) -> Vec<u8> {
        // Validated at construction, so the escapes are well-formed.
        percent_decode(&self.path).unwrap_or_else(|_| self.path.clone().into_bytes())
    }

    pub fn encoded_query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn decoded_query(&self) -> Option<Vec<u8>> {
        self.query.as_deref().and_then(|q| percent_decode(q).ok())
    }

    pub fn encoded_fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    pub fn decoded_fragment(&self) -> Option<Vec<u8>> {
        self.fragment.as_deref().and_then(|f| percent_decode(f).ok())
    }

    /// Query parameters in order, decoded lossily as UTF-8.
    pub fn query_parameters(&self) -> Vec<(String, String)> {
        let Some(query) = &self.query else {
            return Vec::new();
        };
        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (decode_form(key), decode_form(value))
            })
            .collect()
    }

    /// First value of query parameter `key`.
    pub fn query_parameter(&self, key: &str) -> Option<String> {
        self.query_parameters()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Copy with a new encoded path.
    pub fn with_path(&self, encoded_path: &str) -> Result<Self, UriError> {
        self.to_builder().path(encoded_path).build()
    }

    /// Copy with a new raw path, escaped as needed.
    pub fn with_decoded_path(&self, path: &[u8]) -> Self {
        let encoded = percent_encode(path, is_path_char);
        // Encoded output only contains path characters, so this cannot fail.
        self.with_path(&encoded).unwrap_or_else(|_| self.clone())
    }

    /// Canonical encoded form.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

fn decode_form(s: &str) -> String {
    let replaced = s.replace('+', " ");
    let bytes = percent_decode(&replaced).unwrap_or_else(|_| replaced.into_bytes());
    String::from_utf8_lossy(&bytes).into_owned()
}

impl PartialEq for Uri {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for Uri {}

impl Hash for Uri {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for Uri {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Uri {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl fmt::Debug for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uri({:?})", self.canonical)
    }
}

impl FromStr for Uri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uri::parse(s)
    }
}

/// Component-wise URI construction. Every component is validated in
/// [`UriBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct UriBuilder {
    scheme: Option<String>,
    authority: Option<Authority>,
    path: String,
    query: Option<String>,
    fragment: Option<String>,
}

impl UriBuilder {
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into().to_ascii_lowercase());
        self
    }

    /// Set an empty authority (as in `file:///`) if none is present yet.
    pub fn empty_authority(mut self) -> Self {
        self.authority.get_or_insert_with(Authority::default);
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.authority.get_or_insert_with(Authority::default).host =
            host.into().to_ascii_lowercase();
        self
    }

    pub fn port(mut self, port: Option<u16>) -> Self {
        self.authority.get_or_insert_with(Authority::default).port = port;
        self
    }

    /// Set raw user info (escaped as needed).
    pub fn user_info(mut self, user_info: Option<&[u8]>) -> Self {
        self.authority.get_or_insert_with(Authority::default).user_info =
            user_info.map(|u| percent_encode(u, is_user_info_char));
        self
    }

    /// Set an already-encoded path.
    pub fn path(mut self, encoded: impl Into<String>) -> Self {
        self.path = encoded.into();
        self
    }

    /// Set a raw path (escaped as needed).
    pub fn decoded_path(mut self, path: &[u8]) -> Self {
        self.path = percent_encode(path, is_path_char);
        self
    }

    /// Set an already-encoded query.
    pub fn query(mut self, encoded: Option<String>) -> Self {
        self.query = encoded;
        self
    }

    /// Append `key=value` to the query, escaping both.
    pub fn append_query_parameter(mut self, key: &str, value: &str) -> Self {
        let pair = format!(
            "{}={}",
            percent_encode(key.as_bytes(), is_query_param_char),
            percent_encode(value.as_bytes(), is_query_param_char)
        );
        self.query = Some(match self.query.take() {
            Some(q) if !q.is_empty() => format!("{q}&{pair}"),
            _ => pair,
        });
        self
    }

    /// Set an already-encoded fragment.
    pub fn fragment(mut self, encoded: Option<String>) -> Self {
        self.fragment = encoded;
        self
    }

    /// Set a raw fragment (escaped as needed).
    pub fn decoded_fragment(mut self, fragment: &[u8]) -> Self {
        self.fragment = Some(percent_encode(fragment, is_unreserved_char));
        self
    }

    pub fn build(self) -> Result<Uri, UriError> {
        if let Some(authority) = &self.authority {
            if let Some(user_info) = &authority.user_info {
                validate("user info", user_info, is_user_info_char)?;
            }
            validate_host(&authority.host)?;
        }
        Uri::from_parts(
            self.scheme,
            self.authority,
            self.path,
            self.query,
            self.fragment,
        )
    }
}
