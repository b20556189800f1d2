//! Mapping request keys onto applications.
//!
//! Keys may carry a disambiguating suffix (a per-checkout hash such as
//! `blog-a1b2c3`) that must still reach the application whose directory it
//! refers to. [`resolve`] tries, in order:
//!
//! 1. an exact name match among live applications;
//! 2. when creation is allowed, the registry's create-or-lookup;
//! 3. stripping the hex suffix and canonicalizing `root/<stripped>`;
//! 4. a live application whose canonical directory is that path;
//! 5. a live application whose name, stripped the same way, matches.

use std::path::Path;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use super::{App, AppRegistry};

static HEX_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-[a-f0-9]{4,}$").expect("valid regex"));

/// Remove a trailing `-<4+ lowercase hex>` suffix.
pub fn strip_hex_suffix(key: &str) -> &str {
    match HEX_SUFFIX.find(key) {
        Some(m) => &key[..m.start()],
        None => key,
    }
}

/// Remove the first matching `.<domain>` from the end of `key`.
pub fn strip_domain<'a, S: AsRef<str>>(key: &'a str, domains: &[S]) -> &'a str {
    for domain in domains {
        let domain = domain.as_ref().trim_start_matches('.');
        if domain.is_empty() {
            continue;
        }
        if let Some(stripped) = key.strip_suffix(domain).and_then(|k| k.strip_suffix('.')) {
            if !stripped.is_empty() {
                return stripped;
            }
        }
    }
    key
}

/// Resolve `key` to a live (or, with `allow_create`, creatable) application.
pub fn resolve<R>(registry: &R, key: &str, allow_create: bool) -> Option<Arc<App>>
where
    R: AppRegistry + ?Sized,
{
    if let Some(app) = registry.get(key) {
        return Some(app);
    }

    if allow_create {
        match registry.lookup_or_create(key) {
            Ok(app) => return Some(app),
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Could not look up app by name");
            }
        }
    }

    let simple_key = strip_hex_suffix(key);
    let expected = match canonical(&registry.root_dir().join(simple_key)) {
        Some(path) => path,
        None => {
            tracing::debug!(key = %key, simple_key = %simple_key, "No app directory for key");
            return None;
        }
    };

    let apps = registry.apps();
    if let Some(app) = apps
        .iter()
        .find(|app| canonical(app.dir()).as_deref() == Some(expected.as_path()))
    {
        tracing::debug!(key = %key, app = %app.name(), "Resolved app by directory");
        return Some(app.clone());
    }

    apps.into_iter()
        .find(|app| strip_hex_suffix(app.name()) == simple_key)
        .inspect(|app| {
            tracing::debug!(key = %key, app = %app.name(), "Resolved app by stripped name");
        })
}

fn canonical(path: &Path) -> Option<std::path::PathBuf> {
    std::fs::canonicalize(path).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::AppPool;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_strip_hex_suffix() {
        assert_eq!(strip_hex_suffix("blog-a1b2c3"), "blog");
        assert_eq!(strip_hex_suffix("blog-abcd"), "blog");
        assert_eq!(strip_hex_suffix("blog-abc"), "blog-abc");
        assert_eq!(strip_hex_suffix("blog-A1B2C3"), "blog-A1B2C3");
        assert_eq!(strip_hex_suffix("my-app-00ff00ff"), "my-app");
        assert_eq!(strip_hex_suffix("blog"), "blog");
    }

    #[test]
    fn test_strip_domain() {
        let domains = ["test", ".localhost"];
        assert_eq!(strip_domain("blog.test", &domains), "blog");
        assert_eq!(strip_domain("api.localhost", &domains), "api");
        assert_eq!(strip_domain("blog", &domains), "blog");
        assert_eq!(strip_domain("blogtest", &domains), "blogtest");
        assert_eq!(strip_domain(".test", &domains), ".test");
    }

    #[test]
    fn test_exact_match_wins() {
        let pool = AppPool::new("/nonexistent");
        let app = pool.insert("blog-a1b2c3", "/elsewhere");

        let found = resolve(&pool, "blog-a1b2c3", false).unwrap();
        assert!(Arc::ptr_eq(&found, &app));
    }

    #[test]
    fn test_create_when_allowed() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("shop")).unwrap();
        let pool = AppPool::new(root.path());

        assert!(resolve(&pool, "shop", false).is_none());
        let app = resolve(&pool, "shop", true).unwrap();
        assert_eq!(app.name(), "shop");
    }

    #[test]
    fn test_suffixed_key_resolves_by_directory() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("blog")).unwrap();
        let pool = AppPool::new(root.path());
        let blog = pool.insert("blog", root.path().join("blog"));

        let found = resolve(&pool, "blog-a1b2c3", false).unwrap();
        assert!(Arc::ptr_eq(&found, &blog));
    }

    #[test]
    fn test_suffixed_key_resolves_through_symlinks() {
        let root = TempDir::new().unwrap();
        let checkout = TempDir::new().unwrap();
        symlink(checkout.path(), root.path().join("blog")).unwrap();

        let pool = AppPool::new(root.path());
        // Registered under another name, pointing at the real checkout.
        let app = pool.insert("weblog", checkout.path());

        let found = resolve(&pool, "blog-a1b2c3", false).unwrap();
        assert!(Arc::ptr_eq(&found, &app));
    }

    #[test]
    fn test_suffixed_key_resolves_by_stripped_name() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("blog")).unwrap();
        let pool = AppPool::new(root.path());
        let app = pool.insert("blog-ffff", "/gone/away");

        let found = resolve(&pool, "blog-a1b2c3", false).unwrap();
        assert!(Arc::ptr_eq(&found, &app));
    }

    #[test]
    fn test_missing_root_path_is_not_found() {
        let root = TempDir::new().unwrap();
        let pool = AppPool::new(root.path());
        pool.insert("blog-ffff", "/gone/away");

        // root/blog does not exist, so the stripped-name scan is never reached.
        assert!(resolve(&pool, "blog-a1b2c3", false).is_none());
    }

    #[test]
    fn test_failed_create_falls_through() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("blog")).unwrap();
        let pool = AppPool::new(root.path());
        let blog = pool.insert("blog", root.path().join("blog"));

        let found = resolve(&pool, "blog-a1b2c3", true).unwrap();
        assert!(Arc::ptr_eq(&found, &blog));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_exhausted_is_not_found() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("blog")).unwrap();
        let pool = AppPool::new(root.path());
        pool.insert("shop", root.path().join("shop"));

        assert!(resolve(&pool, "blog-a1b2c3", false).is_none());
    }
}
