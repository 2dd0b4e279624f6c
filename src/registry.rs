//! Dependency registry: the fixed import-name -> implementation map that
//! materialized modules resolve `require(name)` against.
//!
//! A registry is immutable once built. Declaring a different dependency
//! list builds a new registry, which replaces the installed one wholesale.

use crate::error::PreviewError;
use crate::fetch::{fetch_script, FetchConfig};
use crate::runtime::{CallError, PreviewRuntime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One entry of the dependency declaration surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyDeclaration {
    #[serde(alias = "libraryName")]
    pub import_name: String,
    #[serde(alias = "libraryGlobal")]
    pub global_symbol_name: String,
    #[serde(alias = "libraryUrl")]
    pub remote_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencySource {
    /// Shipped in the preview isolate's snapshot.
    Builtin,
    /// Loaded from a declared URL.
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub global_symbol: String,
    pub source: DependencySource,
}

#[derive(Debug, Clone)]
pub struct DependencyRegistry {
    entries: BTreeMap<String, Dependency>,
}

impl DependencyRegistry {
    /// The UI runtime bundled with the preview isolate.
    pub fn builtin() -> Self {
        let entries = [
            ("react", "React"),
            ("react-dom", "ReactDOM"),
            ("react-dom/server", "ReactDOM"),
        ]
        .into_iter()
        .map(|(name, symbol)| {
            (
                name.to_string(),
                Dependency {
                    global_symbol: symbol.to_string(),
                    source: DependencySource::Builtin,
                },
            )
        })
        .collect();
        Self { entries }
    }

    /// A new registry with `declared` layered over this one's entries.
    pub fn with_declared<'a>(&self, declared: impl IntoIterator<Item = &'a DependencyDeclaration>) -> Self {
        let mut entries = self.entries.clone();
        for declaration in declared {
            entries.insert(
                declaration.import_name.clone(),
                Dependency {
                    global_symbol: declaration.global_symbol_name.clone(),
                    source: DependencySource::Remote(declaration.remote_url.clone()),
                },
            );
        }
        Self { entries }
    }

    pub fn get(&self, import_name: &str) -> Option<&Dependency> {
        self.entries.get(import_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// import name -> global symbol, as carried by compilation jobs.
    pub fn overrides(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(name, dep)| (name.clone(), dep.global_symbol.clone()))
            .collect()
    }

    /// Make this registry the one module resolution consults.
    ///
    /// Returns the import names whose global is not defined in the isolate;
    /// those resolve to `undefined`.
    pub fn install(&self, runtime: &mut PreviewRuntime) -> Result<Vec<String>, CallError> {
        let pairs: Vec<(&str, &str)> = self
            .entries
            .iter()
            .map(|(name, dep)| (name.as_str(), dep.global_symbol.as_str()))
            .collect();
        let expression = format!(
            "globalThis.__preview_internal__.installRegistry({})",
            serde_json::to_string(&pairs).map_err(anyhow::Error::from)?
        );

        #[derive(Deserialize)]
        struct Installed {
            missing: Vec<String>,
        }

        let installed: Installed = runtime.call("<registry>", expression)?;
        for name in &installed.missing {
            log::warn!("dependency '{}' has no implementation; it will resolve to undefined", name);
        }
        Ok(installed.missing)
    }
}

/// Load each declared script into the isolate.
///
/// Declarations are independent: a failure is collected and the rest still
/// load. Returns the declarations that loaded and the failures.
pub async fn load_declared(
    runtime: &mut PreviewRuntime,
    declarations: &[DependencyDeclaration],
    fetch: &FetchConfig,
) -> (Vec<DependencyDeclaration>, Vec<PreviewError>) {
    let mut loaded = Vec::new();
    let mut failures = Vec::new();

    for declaration in declarations {
        match load_one(runtime, declaration, fetch).await {
            Ok(()) => {
                log::debug!(
                    "loaded dependency '{}' as global {}",
                    declaration.import_name,
                    declaration.global_symbol_name
                );
                loaded.push(declaration.clone());
            }
            Err(reason) => {
                log::warn!("dependency '{}' failed to load: {}", declaration.import_name, reason);
                failures.push(PreviewError::DependencyLoad {
                    import_name: declaration.import_name.clone(),
                    url: declaration.remote_url.clone(),
                    reason,
                });
            }
        }
    }

    (loaded, failures)
}

async fn load_one(
    runtime: &mut PreviewRuntime,
    declaration: &DependencyDeclaration,
    fetch: &FetchConfig,
) -> Result<(), String> {
    let source = fetch_script(&declaration.remote_url, fetch)
        .await
        .map_err(|e| e.to_string())?;

    runtime
        .evaluate_script(&declaration.remote_url, &source)
        .map_err(|e| e.to_string())?;

    let symbol = serde_json::to_string(&declaration.global_symbol_name).map_err(|e| e.to_string())?;
    let defined: bool = runtime
        .call(
            "<registry>",
            format!("JSON.stringify(globalThis[{}] !== undefined)", symbol),
        )
        .map_err(|e| e.to_string())?;

    if !defined {
        return Err(format!(
            "script did not define global '{}'",
            declaration.global_symbol_name
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use std::fs;
    use tempfile::tempdir;
    use url::Url;

    fn declaration(name: &str, symbol: &str, url: &str) -> DependencyDeclaration {
        DependencyDeclaration {
            import_name: name.into(),
            global_symbol_name: symbol.into(),
            remote_url: url.into(),
        }
    }

    #[test]
    fn test_builtin_registry_resolves_react() {
        let registry = DependencyRegistry::builtin();
        assert_eq!(registry.get("react").unwrap().global_symbol, "React");
        assert!(registry.get("antd").is_none());
        assert_eq!(registry.overrides().get("react-dom").map(String::as_str), Some("ReactDOM"));
    }

    #[test]
    fn test_with_declared_leaves_original_untouched() {
        let base = DependencyRegistry::builtin();
        let extended = base.with_declared(&[declaration("dayjs", "dayjs", "https://unpkg.com/dayjs")]);

        assert!(base.get("dayjs").is_none());
        assert_eq!(extended.len(), base.len() + 1);
        assert_eq!(
            extended.get("dayjs").unwrap().source,
            DependencySource::Remote("https://unpkg.com/dayjs".into())
        );
    }

    #[test]
    fn test_declaration_accepts_form_field_names() {
        let parsed: DependencyDeclaration = serde_json::from_str(
            r#"{"libraryName":"dayjs","libraryGlobal":"dayjs","libraryUrl":"https://unpkg.com/dayjs"}"#,
        )
        .unwrap();
        assert_eq!(parsed, declaration("dayjs", "dayjs", "https://unpkg.com/dayjs"));
    }

    #[test]
    fn test_install_reports_missing_globals() {
        let mut rt = PreviewRuntime::new(&SandboxConfig::default()).unwrap();
        let registry = DependencyRegistry::builtin()
            .with_declared(&[declaration("antd", "antd", "https://unpkg.com/antd")]);

        let missing = registry.install(&mut rt).unwrap();
        assert_eq!(missing, vec!["antd".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_declaration_does_not_block_others() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("greeting.js");
        fs::write(&good, "globalThis.Greeting = { text: 'hi' };").unwrap();
        let silent = dir.path().join("silent.js");
        fs::write(&silent, "var nothing = 1;").unwrap();

        let fetch = FetchConfig {
            allowed_origins: vec![],
            local_dir: Some(dir.path().to_path_buf()),
        };
        let mut rt = PreviewRuntime::new(&SandboxConfig::default()).unwrap();

        let declarations = vec![
            declaration("missing", "Missing", "https://blocked.example/lib.js"),
            declaration("greeting", "Greeting", Url::from_file_path(&good).unwrap().as_str()),
            declaration("silent", "Silent", Url::from_file_path(&silent).unwrap().as_str()),
        ];
        let (loaded, failures) = load_declared(&mut rt, &declarations, &fetch).await;

        assert_eq!(loaded, vec![declarations[1].clone()]);
        assert_eq!(failures.len(), 2);
        assert!(failures[1].to_string().contains("did not define global 'Silent'"));
    }
}
