//! Hierarchical URI handling
//!
//! A small RFC 3986 URI type plus the join/relativize operations used by every
//! module and asset lookup. Unlike many URI libraries, an empty authority is
//! kept distinct from a missing one, so `file:/foo` and `file:///foo` survive
//! resolution with their original slash count.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::error::{Error, Result};

/// Characters escaped when turning a filesystem path into a `file:` URI
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// A parsed URI reference (absolute or relative)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    scheme: Option<String>,
    /// `Some("")` for `file:///x`, `None` for `file:/x`
    authority: Option<String>,
    path: String,
    query: Option<String>,
    fragment: Option<String>,
}

impl Uri {
    /// Parse a URI reference
    pub fn parse(input: &str) -> Result<Self> {
        if let Some(c) = input.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::malformed(format!(
                "Illegal character {:?} in URI `{}`",
                c, input
            )));
        }

        let (rest, fragment) = match input.split_once('#') {
            Some((rest, fragment)) => (rest, Some(fragment.to_string())),
            None => (input, None),
        };
        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query.to_string())),
            None => (rest, None),
        };

        let (scheme, rest) = match rest.split_once(':') {
            Some((scheme, rest)) if is_scheme(scheme) => {
                if rest.is_empty() && query.is_none() && fragment.is_none() {
                    return Err(Error::malformed(format!(
                        "Expected scheme-specific part in URI `{}`",
                        input
                    )));
                }
                (Some(scheme.to_string()), rest)
            }
            Some((prefix, _)) if !prefix.contains('/') && !prefix.starts_with('.') => {
                return Err(Error::malformed(format!(
                    "Illegal character in scheme name of URI `{}`",
                    input
                )));
            }
            _ => (None, rest),
        };

        let (authority, path) = match rest.strip_prefix("//") {
            Some(after) => match after.find('/') {
                Some(idx) => (Some(after[..idx].to_string()), after[idx..].to_string()),
                None => (Some(after.to_string()), String::new()),
            },
            None => (None, rest.to_string()),
        };

        Ok(Self {
            scheme,
            authority,
            path,
            query,
            fragment,
        })
    }

    pub(crate) fn from_parts(
        scheme: Option<&str>,
        authority: Option<&str>,
        path: impl Into<String>,
        fragment: Option<&str>,
    ) -> Self {
        Self {
            scheme: scheme.map(str::to_string),
            authority: authority.map(str::to_string),
            path: path.into(),
            query: None,
            fragment: fragment.map(str::to_string),
        }
    }

    /// Convert an absolute filesystem path into a `file:///` URI
    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.is_absolute() {
            return Err(Error::InvalidArgument(format!(
                "Path `{}` is not absolute",
                path.display()
            )));
        }
        let raw = path.to_string_lossy().replace('\\', "/");
        let raw = if raw.starts_with('/') {
            raw
        } else {
            format!("/{}", raw)
        };
        Ok(Self {
            scheme: Some("file".to_string()),
            authority: Some(String::new()),
            path: utf8_percent_encode(&raw, PATH_ENCODE_SET).to_string(),
            query: None,
            fragment: None,
        })
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    /// The user info part of the authority, if any
    pub fn user_info(&self) -> Option<&str> {
        let authority = self.authority.as_deref()?;
        authority.rsplit_once('@').map(|(user, _)| user)
    }

    /// The host part of the authority, if any
    pub fn host(&self) -> Option<&str> {
        let host_port = self.host_port()?;
        match split_port(host_port) {
            Some((host, _)) => Some(host),
            None => Some(host_port),
        }
    }

    /// The port part of the authority, if any
    pub fn port(&self) -> Option<u16> {
        split_port(self.host_port()?).and_then(|(_, port)| port.parse().ok())
    }

    fn host_port(&self) -> Option<&str> {
        let authority = self.authority.as_deref()?;
        Some(match authority.rsplit_once('@') {
            Some((_, host_port)) => host_port,
            None => authority,
        })
    }

    /// Whether this URI has a scheme
    pub fn is_absolute(&self) -> bool {
        self.scheme.is_some()
    }

    /// Whether this URI is opaque (`scheme:body` with no hierarchical path)
    pub fn is_opaque(&self) -> bool {
        self.scheme.is_some() && self.authority.is_none() && !self.path.starts_with('/')
    }

    /// Return a copy with the given path
    pub fn with_path(&self, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..self.clone()
        }
    }

    /// Return a copy with the given query
    pub fn with_query(&self, query: Option<String>) -> Self {
        Self {
            query,
            ..self.clone()
        }
    }

    /// Return a copy with the given fragment
    pub fn with_fragment(&self, fragment: Option<String>) -> Self {
        Self {
            fragment,
            ..self.clone()
        }
    }

    /// Append `/` to the path of a hierarchical URI if it does not end with one
    pub fn ensure_path_ends_with_slash(&self) -> Self {
        if self.is_opaque() || self.path.ends_with('/') {
            return self.clone();
        }
        self.with_path(format!("{}/", self.path))
    }

    /// Convert a `file:` URI to a filesystem path
    ///
    /// Returns `None` for any other scheme and for `file:` URIs naming a
    /// remote host. Fails for relative URIs.
    pub fn to_path(&self) -> Result<Option<PathBuf>> {
        if !self.is_absolute() {
            return Err(Error::InvalidArgument(format!(
                "URI `{}` is not absolute",
                self
            )));
        }
        if self.scheme() != Some("file") || !self.path.starts_with('/') {
            return Ok(None);
        }
        if !matches!(self.authority(), None | Some("") | Some("localhost")) {
            return Ok(None);
        }
        let decoded = percent_decode_str(&self.path)
            .decode_utf8()
            .map_err(|e| Error::malformed(format!("Invalid path in URI `{}`: {}", self, e)))?;
        Ok(Some(PathBuf::from(decoded.as_ref())))
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref scheme) = self.scheme {
            write!(f, "{}:", scheme)?;
        }
        if let Some(ref authority) = self.authority {
            write!(f, "//{}", authority)?;
        }
        f.write_str(&self.path)?;
        if let Some(ref query) = self.query {
            write!(f, "?{}", query)?;
        }
        if let Some(ref fragment) = self.fragment {
            write!(f, "#{}", fragment)?;
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn is_scheme(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        _ => false,
    }
}

fn split_port(host_port: &str) -> Option<(&str, &str)> {
    let (host, port) = host_port.rsplit_once(':')?;
    // `[::1]` without a port
    if host.starts_with('[') && !host.ends_with(']') {
        return None;
    }
    if port.chars().all(|c| c.is_ascii_digit()) {
        Some((host, port))
    } else {
        None
    }
}

/// Resolve `reference` against `base`
///
/// Absolute references are returned unchanged. `jar:` bases are resolved
/// against the archive entry path. All other opaque bases return the
/// reference unchanged.
pub fn resolve(base: &Uri, reference: &Uri) -> Uri {
    if reference.is_absolute() {
        return reference.clone();
    }
    if base.scheme() == Some("jar") {
        if let Some(resolved) = resolve_jar(base, reference) {
            return resolved;
        }
    }
    if base.is_opaque() {
        return reference.clone();
    }

    let (authority, path, query) = if reference.authority.is_some() {
        (
            reference.authority.clone(),
            remove_dot_segments(&reference.path),
            reference.query.clone(),
        )
    } else if reference.path.is_empty() {
        (
            base.authority.clone(),
            base.path.clone(),
            reference.query.clone().or_else(|| base.query.clone()),
        )
    } else {
        let merged = if reference.path.starts_with('/') {
            reference.path.clone()
        } else {
            merge(base, &reference.path)
        };
        (
            base.authority.clone(),
            remove_dot_segments(&merged),
            reference.query.clone(),
        )
    };

    Uri {
        scheme: base.scheme.clone(),
        authority,
        path,
        query,
        fragment: reference.fragment.clone(),
    }
}

/// `jar:<archive>!<entry>`: resolve against `<entry>`, keep `<archive>` verbatim
fn resolve_jar(base: &Uri, reference: &Uri) -> Option<Uri> {
    let (archive, entry) = base.path.split_once('!')?;
    let entry_uri = Uri {
        scheme: None,
        authority: None,
        path: entry.to_string(),
        query: base.query.clone(),
        fragment: None,
    };
    let resolved = resolve(&entry_uri, reference);
    if resolved.authority.is_some() {
        return None;
    }
    Some(Uri {
        scheme: base.scheme.clone(),
        authority: None,
        path: format!("{}!{}", archive, resolved.path),
        query: resolved.query,
        fragment: resolved.fragment,
    })
}

fn merge(base: &Uri, reference_path: &str) -> String {
    if base.authority.is_some() && base.path.is_empty() {
        return format!("/{}", reference_path);
    }
    match base.path.rfind('/') {
        Some(idx) => format!("{}{}", &base.path[..=idx], reference_path),
        None => reference_path.to_string(),
    }
}

/// Relativize `full` against `base`
///
/// Returns `full` unchanged unless both URIs are hierarchical and share
/// scheme and authority.
pub fn relativize(full: &Uri, base: &Uri) -> Uri {
    if full.is_opaque()
        || base.is_opaque()
        || full.scheme != base.scheme
        || full.authority != base.authority
    {
        return full.clone();
    }

    let full_path = remove_dot_segments(&full.path);
    let base_path = remove_dot_segments(&base.path);
    if full_path.starts_with('/') != base_path.starts_with('/') {
        return full.clone();
    }

    let (base_dirs, _) = split_dirs(&base_path);
    let (full_dirs, full_name) = split_dirs(&full_path);

    let common = base_dirs
        .iter()
        .zip(full_dirs.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = "../".repeat(base_dirs.len() - common);
    for dir in &full_dirs[common..] {
        relative.push_str(dir);
        relative.push('/');
    }
    relative.push_str(full_name);

    if relative.is_empty() {
        relative.push_str("./");
    } else if relative
        .split('/')
        .next()
        .is_some_and(|s| s.is_empty() || s.contains(':'))
    {
        relative.insert_str(0, "./");
    }

    let keep_suffix = full.scheme() != Some("file");
    Uri {
        scheme: None,
        authority: None,
        path: relative,
        query: full.query.clone().filter(|_| keep_suffix),
        fragment: full.fragment.clone().filter(|_| keep_suffix),
    }
}

/// Directory segments and last segment of a path; empty segments are kept
fn split_dirs(path: &str) -> (Vec<&str>, &str) {
    let path = path.strip_prefix('/').unwrap_or(path);
    match path.rfind('/') {
        Some(idx) => (path[..idx].split('/').collect(), &path[idx + 1..]),
        None => (Vec::new(), path),
    }
}

/// Remove `.` and `..` segments, clamping `..` at the root of absolute paths
pub fn remove_dot_segments(path: &str) -> String {
    remove_dots(path, false).unwrap_or_default()
}

/// Remove `.` and `..` segments
///
/// Returns `None` if an absolute path would climb above its root.
pub fn normalize_path(path: &str) -> Option<String> {
    remove_dots(path, true)
}

fn remove_dots(path: &str, strict: bool) -> Option<String> {
    let absolute = path.starts_with('/');
    let body = if absolute { &path[1..] } else { path };
    let segments: Vec<&str> = body.split('/').collect();
    let last = segments.len() - 1;

    let mut out: Vec<&str> = Vec::with_capacity(segments.len());
    let mut trailing_slash = false;
    for (i, segment) in segments.iter().enumerate() {
        match *segment {
            "." => trailing_slash = i == last,
            ".." => {
                match out.last() {
                    Some(&prev) if prev != ".." => {
                        out.pop();
                    }
                    _ if absolute => {
                        if strict {
                            return None;
                        }
                    }
                    _ => out.push(".."),
                }
                trailing_slash = i == last;
            }
            other => {
                out.push(other);
                trailing_slash = false;
            }
        }
    }

    let mut result = if absolute {
        String::from("/")
    } else {
        String::new()
    };
    result.push_str(&out.join("/"));
    if trailing_slash && !out.is_empty() && !result.ends_with('/') {
        result.push('/');
    }
    Some(result)
}

/// Infer a module's name from its URI
///
/// `file:///foo/bar/baz.pkl` → `baz`, `pkl:foo.bar.baz` → `baz`,
/// `package://example.com/foo@1.0.0#/baz/qux.pkl` → `qux`.
pub fn infer_module_name(uri: &Uri) -> String {
    if uri.scheme() == Some("pkl") {
        return uri.path.rsplit('.').next().unwrap_or_default().to_string();
    }

    let path = match uri.scheme() {
        Some("package" | "projectpackage") => uri.fragment().unwrap_or_default(),
        Some("jar") => uri
            .path
            .split_once('!')
            .map(|(_, entry)| entry)
            .unwrap_or(&uri.path),
        _ => uri.path(),
    };

    let file_name = path.rsplit('/').next().unwrap_or(path);
    match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => file_name.to_string(),
    }
}
