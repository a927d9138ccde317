//! File resolution for the test runner
//!
//! Two layers live here:
//! - [`FileResolver`] maps a `(directory, module path)` request onto a
//!   [`RunnerFile`] record (path, content, sub-path) the way bundled test
//!   output addresses its own files: relative paths, absolute paths, the
//!   fake `https://test.cases/` origin and multi-entry arrays.
//! - [`PackageResolver`] falls back to Node-style `node_modules` lookup via
//!   `oxc_resolver` for bare specifiers nothing else claims.

use oxc_resolver::{ResolveOptions, Resolver};
use std::{
    cell::RefCell,
    collections::HashMap,
    fmt,
    path::{Component, Path, PathBuf},
    rc::Rc,
};
use thiserror::Error;

/// Fake origin that test bundles use as their public path
pub const TEST_CASES_ORIGIN: &str = "https://test.cases/";
/// Fake origin prefix with the conventional `path/` segment
pub const TEST_CASES_PATH_ORIGIN: &str = "https://test.cases/path/";

/// Sub-path reported for files addressed by absolute path
pub const ABSOLUTE_SUB_PATH: &str = "absolute_path";

/// Name of the synthesized file for array requests
const ARRAY_REQUIRE_FILE: &str = ".array-require.js";

/// Errors that can occur during file or package resolution
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot find module '{0}'")]
    NotFound(String),
}

impl ResolveError {
    /// Node-style error code surfaced to sandboxed code
    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => "ENOENT",
            ResolveError::Io { .. } => "EIO",
            ResolveError::NotFound(_) => "MODULE_NOT_FOUND",
        }
    }
}

pub type ResolveResult<T> = Result<T, ResolveError>;

/// A module path as requested by sandboxed code
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModulePath {
    Single(String),
    Many(Vec<String>),
}

impl ModulePath {
    /// Drop a `?query` suffix from single paths
    pub fn without_query(self) -> Self {
        match self {
            ModulePath::Single(p) => match p.split_once('?') {
                Some((head, _)) => ModulePath::Single(head.to_string()),
                None => ModulePath::Single(p),
            },
            many => many,
        }
    }

    pub fn as_single(&self) -> Option<&str> {
        match self {
            ModulePath::Single(p) => Some(p),
            ModulePath::Many(_) => None,
        }
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModulePath::Single(p) => f.write_str(p),
            // Same rendering as a JS array coerced to string
            ModulePath::Many(ps) => f.write_str(&ps.join(",")),
        }
    }
}

impl From<&str> for ModulePath {
    fn from(value: &str) -> Self {
        ModulePath::Single(value.to_string())
    }
}

impl From<String> for ModulePath {
    fn from(value: String) -> Self {
        ModulePath::Single(value)
    }
}

/// A file the runner is about to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerFile {
    pub path: PathBuf,
    pub content: Rc<str>,
    /// Directory part of the request after its first segment, used to
    /// emulate `<script src>`-relative public paths
    pub sub_path: String,
}

impl RunnerFile {
    pub fn new(path: impl Into<PathBuf>, content: impl Into<Rc<str>>, sub_path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            sub_path: sub_path.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("/"))
    }

    pub fn extension(&self) -> Option<&str> {
        self.path.extension().and_then(|e| e.to_str())
    }

    pub fn is_json(&self) -> bool {
        self.extension() == Some("json")
    }

    pub fn is_mjs(&self) -> bool {
        self.extension() == Some("mjs")
    }
}

/// `./a/b/c.js` → `b/`; single-segment requests have no sub-path
pub fn get_sub_path(p: &str) -> String {
    let Some(last_slash) = p.rfind('/') else {
        return String::new();
    };
    let Some(mut first_slash) = p.find('/') else {
        return String::new();
    };
    if first_slash == last_slash {
        return String::new();
    }

    // Skip over any run of `.` segments following the first one
    loop {
        let next = p[first_slash + 1..].find('/').map(|i| i + first_slash + 1);
        match next {
            Some(next) if &p[first_slash + 1..next] == "." => first_slash = next,
            _ => break,
        }
    }

    if first_slash >= last_slash {
        return String::new();
    }
    p[first_slash + 1..=last_slash].to_string()
}

/// Map a fake-origin URL onto a dist-relative `./` path
pub fn url_to_relative_path(url: &str) -> String {
    let rest = url
        .strip_prefix(TEST_CASES_PATH_ORIGIN)
        .or_else(|| url.strip_prefix(TEST_CASES_ORIGIN))
        .unwrap_or(url);
    format!("./{rest}")
}

fn is_relative_path(p: &str) -> bool {
    p.starts_with("./") || p.starts_with("../")
}

/// Lexically join and normalize, like `path.join`
pub fn join_normalized(base: &Path, request: &str) -> PathBuf {
    let mut out = PathBuf::new();
    for component in base.join(request).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolves module requests to [`RunnerFile`]s with an optional cache
/// keyed by `"<dir>|<path>"`
#[derive(Debug, Default)]
pub struct FileResolver {
    cachable: bool,
    cache: RefCell<HashMap<String, RunnerFile>>,
}

impl FileResolver {
    pub fn new(cachable: bool) -> Self {
        Self {
            cachable,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Resolve a request. `Ok(None)` means the request is not a file the
    /// runner addresses directly and should go to the miss requirer.
    pub fn get_file(&self, module_path: &ModulePath, current_directory: &Path) -> ResolveResult<Option<RunnerFile>> {
        let cache_key = format!("{}|{}", current_directory.display(), module_path);
        if self.cachable
            && let Some(hit) = self.cache.borrow().get(&cache_key)
        {
            tracing::trace!(key = %cache_key, "file cache hit");
            return Ok(Some(hit.clone()));
        }

        let file = match module_path {
            ModulePath::Many(paths) => Some(array_file(paths, current_directory)),
            ModulePath::Single(p) if p.starts_with(TEST_CASES_ORIGIN) => {
                let path = join_normalized(current_directory, &url_to_relative_path(p));
                let content = read_file(&path)?;
                Some(RunnerFile::new(path, content, ""))
            }
            ModulePath::Single(p) if is_relative_path(p) => {
                let path = join_normalized(current_directory, p);
                let content = read_file(&path)?;
                Some(RunnerFile::new(path, content, get_sub_path(p)))
            }
            ModulePath::Single(p) if Path::new(p).is_absolute() => {
                let content = read_file(Path::new(p))?;
                Some(RunnerFile::new(p, content, ABSOLUTE_SUB_PATH))
            }
            ModulePath::Single(_) => None,
        };

        if self.cachable
            && let Some(file) = &file
        {
            self.cache.borrow_mut().insert(cache_key, file.clone());
        }
        Ok(file)
    }
}

fn array_file(paths: &[String], current_directory: &Path) -> RunnerFile {
    let requires = paths
        .iter()
        .map(|p| {
            let request = serde_json::to_string(&format!("./{p}")).unwrap_or_else(|_| format!("\"./{p}\""));
            format!("require({request})")
        })
        .collect::<Vec<_>>()
        .join(", ");
    RunnerFile::new(
        current_directory.join(ARRAY_REQUIRE_FILE),
        format!("module.exports = ({requires});"),
        "",
    )
}

fn read_file(path: &Path) -> ResolveResult<Rc<str>> {
    std::fs::read_to_string(path)
        .map(Rc::from)
        .map_err(|source| ResolveError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Node-compatible package resolution for bare specifiers
pub struct PackageResolver {
    cjs_resolver: Resolver,
}

impl PackageResolver {
    pub fn new() -> Self {
        let cjs_options = ResolveOptions {
            condition_names: vec!["require".into(), "node".into(), "default".into()],
            extensions: vec![".js".into(), ".cjs".into(), ".json".into(), ".mjs".into()],
            main_fields: vec!["main".into()],
            exports_fields: vec![vec!["exports".into()]],
            imports_fields: vec![vec!["imports".into()]],
            ..ResolveOptions::default()
        };
        Self {
            cjs_resolver: Resolver::new(cjs_options),
        }
    }

    /// Resolve `specifier` from `directory` with CommonJS conditions
    pub fn resolve(&self, specifier: &str, directory: &Path) -> ResolveResult<PathBuf> {
        match self.cjs_resolver.resolve(directory, specifier) {
            Ok(resolution) => Ok(resolution.path().to_path_buf()),
            Err(error) => {
                tracing::debug!(specifier, %error, "package resolution failed");
                Err(ResolveError::NotFound(specifier.to_string()))
            }
        }
    }
}

impl Default for PackageResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PackageResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageResolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_sub_path() {
        assert_eq!(get_sub_path("./main.js"), "");
        assert_eq!(get_sub_path("main.js"), "");
        assert_eq!(get_sub_path("./chunks/a.js"), "chunks/");
        assert_eq!(get_sub_path("./a/b/c.js"), "a/b/");
        assert_eq!(get_sub_path("././a/b.js"), "a/");
        assert_eq!(get_sub_path("dir/file.js"), "");
    }

    #[test]
    fn test_url_to_relative_path() {
        assert_eq!(url_to_relative_path("https://test.cases/path/chunk.js"), "./chunk.js");
        assert_eq!(url_to_relative_path("https://test.cases/a/b.js"), "./a/b.js");
    }

    #[test]
    fn test_query_is_stripped() {
        let p = ModulePath::from("./a.js?v=1").without_query();
        assert_eq!(p, ModulePath::from("./a.js"));
    }

    #[test]
    fn test_relative_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/a.js"), "module.exports = 1;").unwrap();

        let resolver = FileResolver::new(false);
        let file = resolver
            .get_file(&ModulePath::from("./sub/a.js"), dir.path())
            .unwrap()
            .unwrap();
        assert_eq!(file.path, dir.path().join("sub/a.js"));
        assert_eq!(&*file.content, "module.exports = 1;");
        assert_eq!(file.sub_path, "sub/");
    }

    #[test]
    fn test_fake_origin_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("chunk.js"), "1").unwrap();
        let resolver = FileResolver::new(false);
        let file = resolver
            .get_file(&ModulePath::from("https://test.cases/path/chunk.js"), dir.path())
            .unwrap()
            .unwrap();
        assert_eq!(file.path, dir.path().join("chunk.js"));
        assert_eq!(file.sub_path, "");
    }

    #[test]
    fn test_absolute_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abs.js");
        fs::write(&path, "2").unwrap();
        let resolver = FileResolver::new(false);
        let file = resolver
            .get_file(&ModulePath::from(path.to_str().unwrap()), Path::new("/elsewhere"))
            .unwrap()
            .unwrap();
        assert_eq!(file.sub_path, ABSOLUTE_SUB_PATH);
    }

    #[test]
    fn test_bare_specifier_is_a_miss() {
        let resolver = FileResolver::new(true);
        let file = resolver.get_file(&ModulePath::from("lodash"), Path::new("/dist")).unwrap();
        assert!(file.is_none());
    }

    #[test]
    fn test_missing_relative_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FileResolver::new(false);
        let err = resolver
            .get_file(&ModulePath::from("./nope.js"), dir.path())
            .unwrap_err();
        assert_eq!(err.code(), "ENOENT");
    }

    #[test]
    fn test_array_request() {
        let resolver = FileResolver::new(false);
        let file = resolver
            .get_file(
                &ModulePath::Many(vec!["a.js".into(), "b.js".into()]),
                Path::new("/dist"),
            )
            .unwrap()
            .unwrap();
        assert_eq!(file.path, Path::new("/dist/.array-require.js"));
        assert_eq!(
            &*file.content,
            r#"module.exports = (require("./a.js"), require("./b.js"));"#
        );
    }

    #[test]
    fn test_cache_returns_first_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.js");
        fs::write(&path, "first").unwrap();
        let resolver = FileResolver::new(true);
        let request = ModulePath::from("./a.js");
        resolver.get_file(&request, dir.path()).unwrap();
        fs::write(&path, "second").unwrap();
        let file = resolver.get_file(&request, dir.path()).unwrap().unwrap();
        assert_eq!(&*file.content, "first");
    }

    #[test]
    fn test_package_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("node_modules/leftpad");
        fs::create_dir_all(&pkg).unwrap();
        fs::write(pkg.join("package.json"), r#"{"name":"leftpad","main":"lib.js"}"#).unwrap();
        fs::write(pkg.join("lib.js"), "module.exports = 1;").unwrap();

        let resolver = PackageResolver::new();
        let resolved = resolver.resolve("leftpad", dir.path()).unwrap();
        assert!(resolved.ends_with("node_modules/leftpad/lib.js"));
        assert!(resolver.resolve("missing-pkg", dir.path()).is_err());
    }
}
