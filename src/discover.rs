//! Route discovery for projects that do not list their routes.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use log::debug;
use regex::Regex;
use serde_json as json;

use crate::config::{Framework, ProjectConfig};

static ROUTE_ELEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<Route\s+[^>]*path=["']([^"']+)["']"#)
        .expect("static regex is valid")
});

const APP_CANDIDATES: &[&str] =
    &["src/App.tsx", "src/App.jsx", "src/app.tsx", "src/app.jsx"];

fn fallback() -> Vec<String> {
    vec!["/".to_string()]
}

pub fn discover_routes(config: &ProjectConfig) -> Vec<String> {
    let framework = config.framework.or_else(|| detect_framework(&config.dir));
    debug!("discovering routes for {:?} project", framework);
    match framework {
        Some(Framework::Vite) => vite_routes(&config.dir),
        Some(Framework::NextJs) => next_routes(&config.dir),
        Some(framework @ (Framework::BrowserSync | Framework::Static)) => {
            static_routes(&config.dir, framework)
        }
        None => fallback(),
    }
}

pub fn detect_framework(dir: &Path) -> Option<Framework> {
    if let Some(framework) = framework_from_package(dir) {
        return Some(framework);
    }
    if dir.join("index.html").exists() {
        return Some(Framework::Static);
    }
    if dir.join("dist/index.html").exists() {
        return Some(Framework::BrowserSync);
    }
    None
}

fn framework_from_package(dir: &Path) -> Option<Framework> {
    let source = fs::read_to_string(dir.join("package.json")).ok()?;
    let package: json::Value = json::from_str(&source).ok()?;
    let has = |name: &str| {
        ["dependencies", "devDependencies"]
            .iter()
            .any(|section| package[section].get(name).is_some())
    };
    if has("next") {
        Some(Framework::NextJs)
    } else if has("vite") {
        Some(Framework::Vite)
    } else if has("browser-sync") {
        Some(Framework::BrowserSync)
    } else {
        None
    }
}

/// `<Route path="...">` elements in the React Router app component.
fn vite_routes(dir: &Path) -> Vec<String> {
    let Some(source) = APP_CANDIDATES
        .iter()
        .find_map(|candidate| fs::read_to_string(dir.join(candidate)).ok())
    else {
        return fallback();
    };

    let routes: Vec<String> = ROUTE_ELEMENT
        .captures_iter(&source)
        .map(|captures| captures[1].to_string())
        .filter(|path| path != "*" && !path.contains(':'))
        .map(|path| {
            if path.starts_with('/') {
                path
            } else {
                format!("/{}", path)
            }
        })
        .collect();
    if routes.is_empty() { fallback() } else { routes }
}

/// Directories under `src/app` that contain a `page.tsx` or `page.jsx`.
fn next_routes(dir: &Path) -> Vec<String> {
    fn walk(dir: &Path, prefix: &str, routes: &mut Vec<String>) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        let mut entries: Vec<_> = entries.filter_map(Result::ok).collect();
        entries.sort_by_key(|entry| entry.file_name());

        let has_page = entries.iter().any(|entry| {
            entry.path().is_file()
                && matches!(
                    entry.file_name().to_str(),
                    Some("page.tsx" | "page.jsx")
                )
        });
        if has_page {
            routes.push(if prefix.is_empty() {
                "/".to_string()
            } else {
                prefix.to_string()
            });
        }

        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !entry.path().is_dir()
                || name == "api"
                || name.starts_with('[')
                || name.starts_with('_')
            {
                continue;
            }
            walk(&entry.path(), &format!("{}/{}", prefix, name), routes);
        }
    }

    let mut routes = vec![];
    walk(&dir.join("src/app"), "", &mut routes);
    if routes.is_empty() { fallback() } else { routes }
}

/// `*.html` files in the project root, then `dist/`. browser-sync projects
/// only look in `dist/`.
fn static_routes(dir: &Path, framework: Framework) -> Vec<String> {
    let scan_dirs = if framework == Framework::BrowserSync {
        vec![dir.join("dist")]
    } else {
        vec![dir.to_path_buf(), dir.join("dist")]
    };

    for scan_dir in scan_dirs {
        let Ok(entries) = fs::read_dir(&scan_dir) else {
            continue;
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".html"))
            .collect();
        names.sort();

        let mut routes = vec![];
        if names.iter().any(|name| name == "index.html") {
            routes.push("/".to_string());
        }
        routes.extend(
            names
                .into_iter()
                .filter(|name| name != "index.html")
                .map(|name| format!("/{}", name)),
        );
        if !routes.is_empty() {
            return routes;
        }
    }
    fallback()
}
