//! Curated distribution-to-module table for distributions whose importable
//! module does not follow from their name, plus the standard-library modules
//! that never need a third-party owner.

use crate::requirement::canonicalize_name;
use crate::types::ModuleName;
use std::collections::BTreeMap;

pub struct MappingEntry {
    pub distribution: &'static str,
    pub modules: &'static [&'static str],
}

macro_rules! mapping {
    ($($dist:literal => [$($module:literal),+ $(,)?]),+ $(,)?) => {
        &[$(MappingEntry { distribution: $dist, modules: &[$($module),+] }),+]
    };
}

/// Keys are canonical (PEP 503) distribution names.
pub const BUILTIN_MODULE_MAPPING: &[MappingEntry] = mapping! {
    "absl-py" => ["absl"],
    "antlr4-python3-runtime" => ["antlr4"],
    "apache-airflow" => ["airflow"],
    "attrs" => ["attr", "attrs"],
    "beautifulsoup4" => ["bs4"],
    "cattrs" => ["cattr", "cattrs"],
    "django-cors-headers" => ["corsheaders"],
    "djangorestframework" => ["rest_framework"],
    "elastic-apm" => ["elasticapm"],
    "factory-boy" => ["factory"],
    "gitpython" => ["git"],
    "google-api-python-client" => ["apiclient", "googleapiclient"],
    "google-auth" => ["google.auth"],
    "google-cloud-storage" => ["google.cloud.storage"],
    "grpcio" => ["grpc"],
    "ipython" => ["IPython"],
    "kafka-python" => ["kafka"],
    "lark-parser" => ["lark"],
    "mysql-connector-python" => ["mysql"],
    "opencv-python" => ["cv2"],
    "opencv-python-headless" => ["cv2"],
    "paho-mqtt" => ["paho"],
    "pillow" => ["PIL"],
    "protobuf" => ["google.protobuf"],
    "psycopg2-binary" => ["psycopg2"],
    "pycrypto" => ["Crypto"],
    "pycryptodome" => ["Crypto"],
    "pyhamcrest" => ["hamcrest"],
    "pyjwt" => ["jwt"],
    "pymongo" => ["bson", "gridfs", "pymongo"],
    "pymupdf" => ["fitz"],
    "pyopenssl" => ["OpenSSL"],
    "python-dateutil" => ["dateutil"],
    "python-dotenv" => ["dotenv"],
    "python-jose" => ["jose"],
    "python-json-logger" => ["pythonjsonlogger"],
    "python-magic" => ["magic"],
    "python-multipart" => ["multipart"],
    "pytest-runner" => ["ptr"],
    "pyyaml" => ["yaml"],
    "pyzmq" => ["zmq"],
    "scikit-image" => ["skimage"],
    "scikit-learn" => ["sklearn"],
    "setuptools" => ["easy_install", "pkg_resources", "setuptools"],
    "snowflake-connector-python" => ["snowflake.connector"],
};

pub const BUILTIN_TYPE_STUBS_MODULE_MAPPING: &[MappingEntry] = mapping! {
    "grpc-stubs" => ["grpc"],
    "types-protobuf" => ["google.protobuf"],
    "types-pyopenssl" => ["OpenSSL"],
    "types-python-dateutil" => ["dateutil"],
    "types-pyyaml" => ["yaml"],
    "types-setuptools" => ["easy_install", "pkg_resources", "setuptools"],
};

/// Top-level modules shipped with the interpreter.
pub const STDLIB_MODULES: &[&str] = &[
    "__future__", "_thread", "abc", "argparse", "array", "ast", "asyncio", "atexit",
    "base64", "binascii", "bisect", "builtins", "bz2", "calendar", "cmath", "codecs",
    "collections", "concurrent", "configparser", "contextlib", "contextvars", "copy",
    "csv", "ctypes", "dataclasses", "datetime", "decimal", "difflib", "dis", "email",
    "encodings", "enum", "errno", "faulthandler", "fcntl", "filecmp", "fnmatch",
    "fractions", "ftplib", "functools", "gc", "getpass", "gettext", "glob", "graphlib",
    "gzip", "hashlib", "heapq", "hmac", "html", "http", "imaplib", "importlib",
    "inspect", "io", "ipaddress", "itertools", "json", "keyword", "locale", "logging",
    "lzma", "math", "mimetypes", "mmap", "multiprocessing", "netrc", "numbers",
    "operator", "os", "pathlib", "pdb", "pickle", "pkgutil", "platform", "plistlib",
    "pprint", "profile", "pstats", "queue", "random", "re", "resource", "sched",
    "secrets", "select", "selectors", "shelve", "shlex", "shutil", "signal", "site",
    "smtplib", "socket", "socketserver", "sqlite3", "ssl", "stat", "statistics",
    "string", "struct", "subprocess", "sys", "sysconfig", "tarfile", "tempfile",
    "textwrap", "threading", "time", "timeit", "tkinter", "token", "tokenize",
    "tomllib", "traceback", "types", "typing", "unicodedata", "unittest", "urllib",
    "uuid", "venv", "warnings", "weakref", "xml", "zipfile", "zipimport", "zlib",
    "zoneinfo",
];

pub fn is_stdlib_module(top_level: &str) -> bool {
    STDLIB_MODULES.contains(&top_level)
}

/// The curated default mapping: the built-in tables overlaid by configuration.
///
/// Constructed once per process and handed to the module mapper by reference;
/// never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultModuleMapping {
    modules: BTreeMap<String, Vec<ModuleName>>,
    type_stub_modules: BTreeMap<String, Vec<ModuleName>>,
}

impl DefaultModuleMapping {
    pub fn builtin() -> Self {
        Self {
            modules: table_from(BUILTIN_MODULE_MAPPING),
            type_stub_modules: table_from(BUILTIN_TYPE_STUBS_MODULE_MAPPING),
        }
    }

    /// Overlay user entries; a user entry replaces the built-in entry for the same distribution.
    #[must_use]
    pub fn with_overrides(
        mut self,
        modules: &BTreeMap<String, Vec<String>>,
        type_stub_modules: &BTreeMap<String, Vec<String>>,
    ) -> Self {
        for (dist, mods) in modules {
            self.modules.insert(
                canonicalize_name(dist),
                mods.iter().map(|m| ModuleName::new(m.trim())).collect(),
            );
        }
        for (dist, mods) in type_stub_modules {
            self.type_stub_modules.insert(
                canonicalize_name(dist),
                mods.iter().map(|m| ModuleName::new(m.trim())).collect(),
            );
        }
        self
    }

    pub fn modules_for(&self, distribution: &str) -> Option<&[ModuleName]> {
        self.modules
            .get(&canonicalize_name(distribution))
            .map(Vec::as_slice)
    }

    pub fn type_stub_modules_for(&self, distribution: &str) -> Option<&[ModuleName]> {
        self.type_stub_modules
            .get(&canonicalize_name(distribution))
            .map(Vec::as_slice)
    }
}

fn table_from(entries: &[MappingEntry]) -> BTreeMap<String, Vec<ModuleName>> {
    entries
        .iter()
        .map(|e| {
            (
                e.distribution.to_owned(),
                e.modules.iter().map(|m| ModuleName::new(*m)).collect(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_keys_are_canonical() {
        for entry in BUILTIN_MODULE_MAPPING
            .iter()
            .chain(BUILTIN_TYPE_STUBS_MODULE_MAPPING)
        {
            assert_eq!(
                entry.distribution,
                canonicalize_name(entry.distribution),
                "mapping key '{}' must be a canonical project name",
                entry.distribution
            );
        }
    }

    #[test]
    fn builtin_keys_are_unique() {
        let mut names: Vec<&str> = BUILTIN_MODULE_MAPPING
            .iter()
            .map(|e| e.distribution)
            .collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), BUILTIN_MODULE_MAPPING.len());
    }

    #[test]
    fn lookup_canonicalizes_the_query() {
        let mapping = DefaultModuleMapping::builtin();
        let modules = mapping.modules_for("BeautifulSoup4").unwrap();
        assert_eq!(modules, &[ModuleName::new("bs4")]);
        assert_eq!(
            mapping.modules_for("Python_Dateutil").unwrap(),
            &[ModuleName::new("dateutil")]
        );
        assert!(mapping.modules_for("flask").is_none());
    }

    #[test]
    fn overrides_replace_builtin_entries() {
        let mut user = BTreeMap::new();
        user.insert("PyYAML".to_owned(), vec!["yaml".to_owned(), "_yaml".to_owned()]);
        user.insert("my-dist".to_owned(), vec!["my_mod".to_owned()]);
        let mapping = DefaultModuleMapping::builtin().with_overrides(&user, &BTreeMap::new());
        assert_eq!(mapping.modules_for("pyyaml").unwrap().len(), 2);
        assert_eq!(
            mapping.modules_for("my_dist").unwrap(),
            &[ModuleName::new("my_mod")]
        );
    }

    #[test]
    fn stdlib_detection() {
        assert!(is_stdlib_module("os"));
        assert!(is_stdlib_module("typing"));
        assert!(!is_stdlib_module("flask"));
    }
}
