//! Path classification
//!
//! Decides whether a path belongs to the virtual namespace. The mount marker
//! must appear as a whole segment directly after one of the recognized
//! prefix forms:
//!
//! | form              | example                        |
//! |-------------------|--------------------------------|
//! | root              | `/__packfs__/lib`              |
//! | drive             | `C:\__packfs__\lib`            |
//! | long path         | `\\?\__packfs__\lib`           |
//! | long path + drive | `\\?\C:\__packfs__\lib`        |
//!
//! Only the root form is active unless `windows_forms` is enabled, and
//! backslash only counts as a separator in that mode.

use crate::config::RouterConfig;
use crate::error::{Result, RouterError};

/// Namespace a path belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    /// Inside the mount scope (archive or shadow overlay)
    Virtual,
    /// Anywhere else; served by the host
    Real,
}

#[derive(Debug, Clone, Copy)]
enum Unit {
    Sep,
    Lit(u8),
    Drive,
}

struct PrefixForm {
    windows_only: bool,
    units: &'static [Unit],
}

const PREFIX_FORMS: &[PrefixForm] = &[
    // root
    PrefixForm {
        windows_only: false,
        units: &[Unit::Sep],
    },
    // drive
    PrefixForm {
        windows_only: true,
        units: &[Unit::Drive, Unit::Lit(b':'), Unit::Sep],
    },
    // long path
    PrefixForm {
        windows_only: true,
        units: &[Unit::Sep, Unit::Sep, Unit::Lit(b'?'), Unit::Sep],
    },
    // long path + drive
    PrefixForm {
        windows_only: true,
        units: &[
            Unit::Sep,
            Unit::Sep,
            Unit::Lit(b'?'),
            Unit::Sep,
            Unit::Drive,
            Unit::Lit(b':'),
            Unit::Sep,
        ],
    },
];

/// Table-driven matcher for the virtual namespace
#[derive(Debug, Clone)]
pub struct PathClassifier {
    marker: String,
    segment_utf8: Vec<u32>,
    segment_utf16: Vec<u32>,
    windows_forms: bool,
    max_path_len: usize,
}

impl PathClassifier {
    /// Build a classifier for a validated configuration
    pub fn new(config: &RouterConfig) -> Self {
        let segment = config.mount_marker.trim_start_matches('/');
        Self {
            marker: config.mount_marker.clone(),
            segment_utf8: segment.bytes().map(u32::from).collect(),
            segment_utf16: segment.encode_utf16().map(u32::from).collect(),
            windows_forms: config.windows_forms,
            max_path_len: config.max_path_len,
        }
    }

    /// The mount scope marker, e.g. `/__packfs__`
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Longest path accepted by [`expand`](Self::expand)
    pub fn max_path_len(&self) -> usize {
        self.max_path_len
    }

    pub fn classify(&self, path: &str) -> PathClass {
        match self.scope_end(path.as_bytes(), &self.segment_utf8) {
            Some(_) => PathClass::Virtual,
            None => PathClass::Real,
        }
    }

    /// Wide-character variant of [`classify`](Self::classify)
    pub fn classify_wide(&self, path: &[u16]) -> PathClass {
        match self.scope_end(path, &self.segment_utf16) {
            Some(_) => PathClass::Virtual,
            None => PathClass::Real,
        }
    }

    pub fn is_virtual(&self, path: &str) -> bool {
        self.classify(path) == PathClass::Virtual
    }

    /// True unless the path starts with a recognized absolute prefix form
    pub fn is_relative(&self, path: &str) -> bool {
        !self.has_absolute_prefix(path.as_bytes())
    }

    /// Wide-character variant of [`is_relative`](Self::is_relative)
    pub fn is_relative_wide(&self, path: &[u16]) -> bool {
        !self.has_absolute_prefix(path)
    }

    /// Remainder of a virtual path after the marker segment
    ///
    /// `/__packfs__/a/b` yields `/a/b`, `/__packfs__` yields an empty string,
    /// real paths yield `None`.
    pub fn strip_scope<'a>(&self, path: &'a str) -> Option<&'a str> {
        self.scope_end(path.as_bytes(), &self.segment_utf8)
            .map(|end| &path[end..])
    }

    /// Join a relative path onto the virtual working directory
    ///
    /// Plain concatenation: `.` and `..` are left for the backend to resolve.
    pub fn expand(&self, cwd: &str, relative: &str) -> Result<String> {
        let len = cwd.len() + relative.len();
        if len > self.max_path_len {
            return Err(RouterError::NameTooLong(len));
        }

        let mut expanded = String::new();
        expanded.try_reserve_exact(len)?;
        expanded.push_str(cwd);
        expanded.push_str(relative);
        Ok(expanded)
    }

    /// Whether `c` separates path components under the current mode
    pub fn is_separator(&self, c: char) -> bool {
        c == '/' || (self.windows_forms && c == '\\')
    }

    fn forms(&self) -> impl Iterator<Item = &'static PrefixForm> + '_ {
        PREFIX_FORMS
            .iter()
            .filter(move |form| self.windows_forms || !form.windows_only)
    }

    fn has_absolute_prefix<T: Copy + Into<u32>>(&self, path: &[T]) -> bool {
        self.forms()
            .any(|form| self.match_prefix(path, form.units).is_some())
    }

    /// Index just past the marker segment, if the path is in scope
    fn scope_end<T: Copy + Into<u32>>(&self, path: &[T], segment: &[u32]) -> Option<usize> {
        self.forms().find_map(|form| {
            let start = self.match_prefix(path, form.units)?;
            let end = start + segment.len();
            if path.len() < end {
                return None;
            }
            let matches = path[start..end]
                .iter()
                .zip(segment)
                .all(|(unit, expected)| (*unit).into() == *expected);
            let whole_segment = match path.get(end) {
                None => true,
                Some(next) => self.is_separator_unit((*next).into()),
            };
            (matches && whole_segment).then_some(end)
        })
    }

    fn match_prefix<T: Copy + Into<u32>>(&self, path: &[T], units: &[Unit]) -> Option<usize> {
        if path.len() < units.len() {
            return None;
        }
        let matched = units.iter().zip(path).all(|(unit, value)| {
            let value: u32 = (*value).into();
            match unit {
                Unit::Sep => self.is_separator_unit(value),
                Unit::Lit(expected) => value == u32::from(*expected),
                Unit::Drive => char::from_u32(value).is_some_and(|c| c.is_ascii_alphabetic()),
            }
        });
        matched.then_some(units.len())
    }

    fn is_separator_unit(&self, value: u32) -> bool {
        value == u32::from(b'/') || (self.windows_forms && value == u32::from(b'\\'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier(windows_forms: bool) -> PathClassifier {
        let mut config = RouterConfig::default().with_mount_marker("/__scope__");
        config.windows_forms = windows_forms;
        PathClassifier::new(&config)
    }

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    #[test]
    fn test_marker_followed_by_separator_is_virtual() {
        let c = classifier(false);
        for path in ["/__scope__/", "/__scope__/a", "/__scope__/a/b/c.txt", "/__scope__//x"] {
            assert_eq!(c.classify(path), PathClass::Virtual, "{}", path);
        }
        assert_eq!(c.classify("/__scope__"), PathClass::Virtual);
    }

    #[test]
    fn test_other_absolute_paths_are_real() {
        let c = classifier(false);
        for path in [
            "/",
            "/usr/lib",
            "/__scope__x/a",
            "/__scop",
            "/tmp/__scope__/a",
            "//__scope__/a",
            "\\__scope__\\a",
            "C:/__scope__/a",
        ] {
            assert_eq!(c.classify(path), PathClass::Real, "{}", path);
        }
    }

    #[test]
    fn test_windows_forms() {
        let c = classifier(true);
        for path in [
            "\\__scope__\\a",
            "C:\\__scope__\\a",
            "d:/__scope__/a",
            "\\\\?\\__scope__\\a",
            "//?/__scope__/a",
            "\\\\?\\C:\\__scope__\\a",
            "//?/c:/__scope__",
        ] {
            assert_eq!(c.classify(path), PathClass::Virtual, "{}", path);
        }
        assert_eq!(c.classify("1:/__scope__/a"), PathClass::Real);
        assert_eq!(c.classify("C:__scope__/a"), PathClass::Real);
    }

    #[test]
    fn test_wide_variant_matches_narrow() {
        let c = classifier(true);
        for path in ["/__scope__/a", "C:\\__scope__\\a", "/usr", "/__scope__x", "rel/path"] {
            assert_eq!(c.classify(path), c.classify_wide(&wide(path)), "{}", path);
            assert_eq!(c.is_relative(path), c.is_relative_wide(&wide(path)), "{}", path);
        }
    }

    #[test]
    fn test_relative_detection() {
        let unix = classifier(false);
        assert!(unix.is_relative("a/b"));
        assert!(unix.is_relative("./a"));
        assert!(unix.is_relative("C:/x"));
        assert!(!unix.is_relative("/a"));

        let win = classifier(true);
        assert!(!win.is_relative("C:/x"));
        assert!(!win.is_relative("\\x"));
        assert!(!win.is_relative("\\\\?\\x"));
        assert!(win.is_relative("C:x"));
    }

    #[test]
    fn test_expand_is_plain_concatenation() {
        let c = classifier(false);
        assert_eq!(c.expand("/__scope__/a/", "b").unwrap(), "/__scope__/a/b");
        assert_eq!(c.expand("/__scope__/a/", "../b/./c").unwrap(), "/__scope__/a/../b/./c");
    }

    #[test]
    fn test_expand_length_limit() {
        let mut config = RouterConfig::default().with_mount_marker("/__scope__");
        config.max_path_len = 16;
        let c = PathClassifier::new(&config);

        assert_eq!(c.expand("/__scope__/", "abcde").unwrap().len(), 16);
        assert!(matches!(
            c.expand("/__scope__/", "abcdef"),
            Err(RouterError::NameTooLong(17))
        ));
    }

    #[test]
    fn test_strip_scope() {
        let c = classifier(false);
        assert_eq!(c.strip_scope("/__scope__/a/b"), Some("/a/b"));
        assert_eq!(c.strip_scope("/__scope__"), Some(""));
        assert_eq!(c.strip_scope("/usr/lib"), None);
        assert_eq!(c.strip_scope("/__scope__x"), None);
    }
}
