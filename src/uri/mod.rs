//! Reference model: parsing, normalization, relative resolution and
//! multi-target splitting.

mod encoding;
pub mod pattern;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::{FileOpError, FileOpResult};

pub(crate) use encoding::{decode, encode_name, has_wildcard};

/// Separator between targets of a multi reference.
pub const LIST_SEPARATOR: char = ';';

pub const FILE_SCHEME: &str = "file";

/// Connection pooling key: scheme + host + port + principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Authority {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// One absolute, normalized, scheme-qualified path.
///
/// The path is stored percent-encoded. Unescaped `*` and `?` are wildcards,
/// a trailing `/` marks a directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SingleRef {
    scheme: String,
    user: Option<String>,
    password: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    path: String,
}

impl SingleRef {
    /// Parse an absolute reference (`scheme://...` or `scheme:/...`).
    pub fn parse(input: &str) -> FileOpResult<Self> {
        let trimmed = input.trim();
        let (scheme, rest) = split_scheme(trimmed)
            .ok_or_else(|| FileOpError::malformed(input, "missing scheme"))?;
        validate_scheme(input, scheme)?;
        let scheme = scheme.to_ascii_lowercase();

        if let Some(after) = rest.strip_prefix("//") {
            let (authority, path) = match after.find('/') {
                Some(idx) => (&after[..idx], &after[idx..]),
                None => (after, "/"),
            };
            let mut parsed = Self::with_authority(input, scheme, authority)?;
            parsed.path = encoding::normalize_path(input, path)?;
            Ok(parsed)
        } else if rest.starts_with('/') {
            Ok(Self {
                scheme,
                user: None,
                password: None,
                host: None,
                port: None,
                path: encoding::normalize_path(input, rest)?,
            })
        } else {
            Err(FileOpError::malformed(input, "expected a hierarchical reference"))
        }
    }

    fn with_authority(input: &str, scheme: String, authority: &str) -> FileOpResult<Self> {
        let (userinfo, hostport) = match authority.rfind('@') {
            Some(idx) => (Some(&authority[..idx]), &authority[idx + 1..]),
            None => (None, authority),
        };
        let (user, password) = match userinfo {
            Some(info) => match info.split_once(':') {
                Some((user, password)) => (Some(user.to_string()), Some(password.to_string())),
                None => (Some(info.to_string()), None),
            },
            None => (None, None),
        };

        let (host, port) = if hostport.starts_with('[') {
            let end = hostport
                .find(']')
                .ok_or_else(|| FileOpError::malformed(input, "unterminated IPv6 host"))?;
            (&hostport[..=end], hostport[end + 1..].strip_prefix(':'))
        } else {
            match hostport.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (hostport, None),
            }
        };
        let port = match port {
            Some(p) if !p.is_empty() => Some(
                p.parse::<u16>()
                    .map_err(|_| FileOpError::malformed(input, format!("invalid port '{}'", p)))?,
            ),
            _ => None,
        };
        let host = (!host.is_empty()).then(|| host.to_ascii_lowercase());

        Ok(Self {
            scheme,
            user,
            password,
            host,
            port,
            path: "/".to_string(),
        })
    }

    /// Standard hierarchical resolution of `relative` against `self`.
    pub fn resolve(&self, relative: &str) -> FileOpResult<Self> {
        let relative = relative.trim();
        if relative.is_empty() {
            return Ok(self.clone());
        }
        if split_scheme(relative).is_some() {
            return Self::parse(relative);
        }
        if relative.starts_with("//") {
            return Self::parse(&format!("{}:{}", self.scheme, relative));
        }

        let raw = if relative.starts_with('/') {
            relative.to_string()
        } else {
            let base = match self.path.rfind('/') {
                Some(idx) => &self.path[..=idx],
                None => "/",
            };
            format!("{}{}", base, relative)
        };

        let mut resolved = self.clone();
        resolved.path = encoding::normalize_path(relative, &raw)?;
        Ok(resolved)
    }

    /// Build a `file` reference from a local filesystem path.
    pub fn from_local_path(path: &Path, directory: bool) -> FileOpResult<Self> {
        let path = dunce::simplified(path);
        let shown = path.display().to_string();
        if !path.is_absolute() {
            return Err(FileOpError::malformed(shown, "local path must be absolute"));
        }

        let mut raw = String::new();
        for component in path.components() {
            use std::path::Component;
            match component {
                Component::Prefix(prefix) => {
                    raw.push('/');
                    raw.push_str(&prefix.as_os_str().to_string_lossy());
                }
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => raw.push_str("/.."),
                Component::Normal(name) => {
                    raw.push('/');
                    raw.push_str(&encode_name(&name.to_string_lossy()));
                }
            }
        }
        if raw.is_empty() || directory {
            raw.push('/');
        }

        Ok(Self {
            scheme: FILE_SCHEME.to_string(),
            user: None,
            password: None,
            host: None,
            port: None,
            path: encoding::normalize_path(&shown, &raw)?,
        })
    }

    /// Decoded local filesystem path of this reference.
    pub fn to_local_path(&self) -> PathBuf {
        let decoded = decode(self.trimmed_path());
        if cfg!(windows) {
            // "/C:/dir" -> "C:/dir"
            let bytes = decoded.as_bytes();
            if bytes.len() >= 3 && bytes[0] == b'/' && bytes[2] == b':' {
                return PathBuf::from(&decoded[1..]);
            }
        }
        PathBuf::from(decoded)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Percent-encoded path, always absolute.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn decoded_path(&self) -> String {
        decode(&self.path)
    }

    pub fn authority_key(&self) -> Authority {
        Authority {
            scheme: self.scheme.clone(),
            host: self.host.clone().unwrap_or_default(),
            port: self.port,
            user: self.user.clone(),
        }
    }

    pub fn has_trailing_slash(&self) -> bool {
        self.path.len() > 1 && self.path.ends_with('/')
    }

    /// Root of the same endpoint.
    pub fn root(&self) -> Self {
        let mut root = self.clone();
        root.path = "/".to_string();
        root
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    pub fn is_wildcard(&self) -> bool {
        has_wildcard(&self.path)
    }

    fn trimmed_path(&self) -> &str {
        if self.has_trailing_slash() {
            &self.path[..self.path.len() - 1]
        } else {
            &self.path
        }
    }

    /// Encoded, non-empty path segments.
    pub fn segments(&self) -> Vec<&str> {
        self.trimmed_path()
            .split('/')
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Decoded last segment; empty for the root.
    pub fn name(&self) -> String {
        self.segments().last().map(|s| decode(s)).unwrap_or_default()
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let trimmed = self.trimmed_path();
        let idx = trimmed.rfind('/')?;
        let mut parent = self.clone();
        parent.path = trimmed[..=idx].to_string();
        Some(parent)
    }

    /// Child entry with a literal (unencoded) name.
    pub fn child(&self, name: &str) -> Self {
        self.join_encoded(&encode_name(name))
    }

    /// Append an already-encoded segment.
    pub(crate) fn join_encoded(&self, segment: &str) -> Self {
        let mut child = self.clone();
        let base = self.trimmed_path();
        child.path = if base == "/" {
            format!("/{}", segment)
        } else {
            format!("{}/{}", base, segment)
        };
        child
    }

    /// Same reference carrying a directory marker.
    pub fn as_directory(&self) -> Self {
        let mut dir = self.clone();
        if !dir.path.ends_with('/') {
            dir.path.push('/');
        }
        dir
    }

    /// Same reference without a directory marker.
    pub fn without_trailing_slash(&self) -> Self {
        let mut plain = self.clone();
        plain.path = self.trimmed_path().to_string();
        plain
    }

    /// Same remote endpoint, same path (ignores password and directory marker).
    pub fn same_location(&self, other: &Self) -> bool {
        self.authority_key() == other.authority_key() && self.trimmed_path() == other.trimmed_path()
    }

    /// `self` is a proper descendant of `ancestor` on the same endpoint.
    pub fn is_within(&self, ancestor: &Self) -> bool {
        if self.authority_key() != ancestor.authority_key() {
            return false;
        }
        let base = ancestor.trimmed_path();
        let prefix = if base == "/" {
            "/".to_string()
        } else {
            format!("{}/", base)
        };
        let own = self.trimmed_path();
        own.len() > prefix.len() && own.starts_with(&prefix)
    }

    /// Display form with the password masked.
    pub fn redacted(&self) -> String {
        self.render(false)
    }

    fn render(&self, with_password: bool) -> String {
        let mut out = format!("{}://", self.scheme);
        if let Some(user) = &self.user {
            out.push_str(user);
            if let Some(password) = &self.password {
                out.push(':');
                out.push_str(if with_password { password } else { "***" });
            }
            out.push('@');
        }
        if let Some(host) = &self.host {
            out.push_str(host);
        }
        if let Some(port) = self.port {
            out.push_str(&format!(":{}", port));
        }
        out.push_str(&self.path);
        out
    }
}

impl fmt::Display for SingleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(true))
    }
}

impl FromStr for SingleRef {
    type Err = FileOpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for SingleRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.redacted())
    }
}

/// A single target or a flat list of targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Single(SingleRef),
    Multi(Vec<SingleRef>),
}

impl Reference {
    /// Parse an expression whose every part is absolute.
    pub fn parse(input: &str) -> FileOpResult<Self> {
        Self::build(input, |part| SingleRef::parse(part))
    }

    /// Parse an expression, resolving relative parts against `base`.
    pub fn parse_with_base(input: &str, base: &SingleRef) -> FileOpResult<Self> {
        Self::build(input, |part| base.resolve(part))
    }

    fn build<F>(input: &str, mut parse_part: F) -> FileOpResult<Self>
    where
        F: FnMut(&str) -> FileOpResult<SingleRef>,
    {
        let mut refs = Vec::new();
        for part in split_list(input)? {
            let single = match part.strip_prefix('"').and_then(|p| p.strip_suffix('"')) {
                Some(quoted) => parse_part(&encoding::quote_wildcards(quoted))?,
                None => parse_part(&part)?,
            };
            refs.push(single);
        }

        match refs.len() {
            0 => Err(FileOpError::malformed(input, "empty reference")),
            1 => Ok(Self::Single(refs.remove(0))),
            _ => Ok(Self::Multi(refs)),
        }
    }

    pub fn is_single(&self) -> bool {
        matches!(self, Self::Single(_))
    }

    pub fn as_single(&self) -> Option<&SingleRef> {
        match self {
            Self::Single(single) => Some(single),
            Self::Multi(_) => None,
        }
    }

    pub fn split(&self) -> Vec<SingleRef> {
        match self {
            Self::Single(single) => vec![single.clone()],
            Self::Multi(list) => list.clone(),
        }
    }

    pub fn into_refs(self) -> Vec<SingleRef> {
        match self {
            Self::Single(single) => vec![single],
            Self::Multi(list) => list,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(single) => write!(f, "{}", single),
            Self::Multi(list) => {
                let parts: Vec<String> = list.iter().map(ToString::to_string).collect();
                f.write_str(&parts.join(";"))
            }
        }
    }
}

impl FromStr for Reference {
    type Err = FileOpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Split on the list separator outside double quotes; quotes are kept.
fn split_list(input: &str) -> FileOpResult<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for ch in input.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                current.push(ch);
            }
            LIST_SEPARATOR if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    if quoted {
        return Err(FileOpError::malformed(input, "unbalanced quotes"));
    }
    parts.push(current);

    Ok(parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect())
}

/// `scheme:rest` when the text before the first ':' looks like a scheme.
fn split_scheme(input: &str) -> Option<(&str, &str)> {
    let idx = input.find(':')?;
    let scheme = &input[..idx];
    // A single letter is a Windows drive, not a scheme
    if scheme.len() < 2 || scheme.contains('/') {
        return None;
    }
    Some((scheme, &input[idx + 1..]))
}

fn validate_scheme(input: &str, scheme: &str) -> FileOpResult<()> {
    let mut chars = scheme.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(FileOpError::malformed(input, format!("invalid scheme '{}'", scheme)))
    }
}
