//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Name of a resolve: a closed dependency-version universe with its own lockfile.
    ResolveName
);

string_newtype!(
    /// Address of a node in the build graph (a requirement or a first-party unit).
    Address
);

string_newtype!(
    /// Dotted, importable module name such as `google.protobuf`.
    ModuleName
);

string_newtype!(
    /// Full 64-character blake3 hex digest used to detect staleness and key caches.
    Fingerprint
);

impl Fingerprint {
    /// Truncated 12-character prefix, used for display and log lines.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }

    /// True for a 64-character hex digest.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 64 && self.0.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl ModuleName {
    /// The first dotted component: `yaml` for `yaml.loader`.
    pub fn top_level(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }

    /// The module itself followed by each parent, longest first.
    ///
    /// `a.b.c` yields `a.b.c`, `a.b`, `a`.
    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        let s = self.0.as_str();
        std::iter::successors(Some(s), |cur| cur.rfind('.').map(|idx| &cur[..idx]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_name_display_and_as_ref() {
        let name = ResolveName::new("python-default");
        assert_eq!(name.to_string(), "python-default");
        assert_eq!(name.as_str(), "python-default");
        assert_eq!(AsRef::<str>::as_ref(&name), "python-default");
    }

    #[test]
    fn address_serde_roundtrip() {
        let addr = Address::new("req:flask");
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"req:flask\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn module_prefixes_longest_first() {
        let m = ModuleName::new("pants.task.task");
        let prefixes: Vec<&str> = m.prefixes().collect();
        assert_eq!(prefixes, vec!["pants.task.task", "pants.task", "pants"]);
        assert_eq!(m.top_level(), "pants");
    }

    #[test]
    fn single_component_module_has_one_prefix() {
        let m = ModuleName::new("flask");
        assert_eq!(m.prefixes().collect::<Vec<_>>(), vec!["flask"]);
    }

    #[test]
    fn fingerprint_short_prefix() {
        let fp = Fingerprint::new("a".repeat(64));
        assert_eq!(fp.short(), "aaaaaaaaaaaa");
        assert!(fp.is_well_formed());
    }

    #[test]
    fn fingerprint_short_respects_char_boundaries() {
        let fp = Fingerprint::new(format!("a{}", "é".repeat(12)));
        assert_eq!(fp.short(), format!("a{}", "é".repeat(11)));
        assert_eq!(Fingerprint::new("abc").short(), "abc");
        assert!(!fp.is_well_formed());
        assert!(!Fingerprint::new("abc").is_well_formed());
    }
}
