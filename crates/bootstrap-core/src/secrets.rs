//! Secret seeding.
//!
//! Records are declared as templates whose field values come from the
//! environment snapshot, a literal, or a generated credential. Seeding runs a
//! complete pre-flight first (every missing variable is reported at once),
//! then writes each record with a full-overwrite put.

use crate::env::Environment;
use crate::error::{BootstrapError, Result};
use crate::platform::run_command_with_stdin;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

pub type Fields = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    /// Read from the named environment variable.
    Env(String),
    Literal(String),
    /// Random alphanumeric credential of the given length. An existing value
    /// in the store is kept, so re-seeding does not rotate it.
    Generated(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretTemplate {
    pub path: String,
    pub fields: BTreeMap<String, ValueSource>,
}

impl SecretTemplate {
    pub fn env_vars(&self) -> impl Iterator<Item = &str> {
        self.fields.values().filter_map(|v| match v {
            ValueSource::Env(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

/// A concrete path → fields write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRecord {
    pub path: String,
    pub fields: Fields,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeededPath {
    pub path: String,
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated: Vec<String>,
}

/// What a seeding pass wrote. Field names only; values never leave the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedReport {
    pub paths: Vec<SeededPath>,
}

// ---------------------------------------------------------------------------
// SecretStore
// ---------------------------------------------------------------------------

pub trait SecretStore: Send + Sync {
    /// Replace every field at `path` with `fields`.
    fn put(&self, path: &str, fields: &Fields) -> Result<()>;
    fn get(&self, path: &str) -> Result<Option<Fields>>;
}

#[derive(Debug, Default)]
pub struct MemorySecretStore {
    data: Mutex<BTreeMap<String, Fields>>,
    puts: Mutex<usize>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Fields> {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn put_count(&self) -> usize {
        *self.puts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SecretStore for MemorySecretStore {
    fn put(&self, path: &str, fields: &Fields) -> Result<()> {
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), fields.clone());
        *self.puts.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Option<Fields>> {
        Ok(self
            .data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned())
    }
}

/// KV v2 engine driven through the `vault` CLI. Values travel over stdin as
/// JSON so they never appear in process arguments.
#[derive(Debug, Clone)]
pub struct VaultStore {
    pub mount: String,
    env: Vec<(String, String)>,
}

impl VaultStore {
    pub fn new(mount: impl Into<String>, address: Option<&str>, token: Option<&str>) -> Self {
        let mut env = Vec::new();
        if let Some(addr) = address {
            env.push(("VAULT_ADDR".to_string(), addr.to_string()));
        }
        if let Some(token) = token {
            env.push(("VAULT_TOKEN".to_string(), token.to_string()));
        }
        Self {
            mount: mount.into(),
            env,
        }
    }
}

#[derive(Deserialize)]
struct VaultRead {
    data: VaultReadData,
}

#[derive(Deserialize)]
struct VaultReadData {
    #[serde(default)]
    data: Fields,
}

impl SecretStore for VaultStore {
    fn put(&self, path: &str, fields: &Fields) -> Result<()> {
        let mount = format!("-mount={}", self.mount);
        let body = serde_json::to_string(fields)?;
        run_command_with_stdin("vault", &["kv", "put", &mount, path, "-"], &self.env, Some(&body))?;
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Option<Fields>> {
        let mount = format!("-mount={}", self.mount);
        match run_command_with_stdin(
            "vault",
            &["kv", "get", &mount, "-format=json", path],
            &self.env,
            None,
        ) {
            Ok(json) => {
                let read: VaultRead = serde_json::from_str(&json)?;
                Ok(Some(read.data.data))
            }
            // `vault kv get` exits 2 when the path has no value.
            Err(BootstrapError::External { message, .. }) if message.starts_with("exit 2") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Seeding
// ---------------------------------------------------------------------------

/// Check every template against the environment. Reports all missing
/// variables and empty literals in one error.
pub fn validate(templates: &[SecretTemplate], env: &Environment) -> Result<()> {
    let mut missing = env.missing(templates.iter().flat_map(|t| t.env_vars()));
    for t in templates {
        for (field, source) in &t.fields {
            match source {
                ValueSource::Literal(v) if v.trim().is_empty() => {
                    missing.push(format!("{}#{field} (empty literal)", t.path));
                }
                ValueSource::Generated(0) => {
                    missing.push(format!("{}#{field} (zero-length generated value)", t.path));
                }
                _ => {}
            }
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(BootstrapError::MissingVariables(missing))
    }
}

/// Generate a random alphanumeric credential.
pub fn generate_credential(length: usize) -> String {
    use rand::{distributions::Alphanumeric, Rng};
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub struct SecretSeeder<'a> {
    store: &'a dyn SecretStore,
}

impl<'a> SecretSeeder<'a> {
    pub fn new(store: &'a dyn SecretStore) -> Self {
        Self { store }
    }

    /// Resolve templates into records. Generated fields reuse the value
    /// already stored at the path, if any.
    pub fn resolve(
        &self,
        templates: &[SecretTemplate],
        env: &Environment,
    ) -> Result<(Vec<SecretRecord>, SeedReport)> {
        validate(templates, env)?;

        let mut records = Vec::with_capacity(templates.len());
        let mut report = SeedReport::default();
        for t in templates {
            let needs_existing = t
                .fields
                .values()
                .any(|v| matches!(v, ValueSource::Generated(_)));
            let existing = if needs_existing {
                self.store.get(&t.path)?.unwrap_or_default()
            } else {
                Fields::new()
            };

            let mut fields = Fields::new();
            let mut generated = Vec::new();
            for (name, source) in &t.fields {
                let value = match source {
                    // Presence was checked by `validate`.
                    ValueSource::Env(var) => env.get(var).unwrap_or_default().to_string(),
                    ValueSource::Literal(v) => v.clone(),
                    ValueSource::Generated(len) => match existing.get(name) {
                        Some(v) if !v.is_empty() => v.clone(),
                        _ => {
                            generated.push(name.clone());
                            generate_credential(*len)
                        }
                    },
                };
                fields.insert(name.clone(), value);
            }

            report.paths.push(SeededPath {
                path: t.path.clone(),
                fields: fields.keys().cloned().collect(),
                generated,
            });
            records.push(SecretRecord {
                path: t.path.clone(),
                fields,
            });
        }
        Ok((records, report))
    }

    /// Write each record. Every field must be non-empty; the check covers all
    /// records before the first write.
    pub fn seed(&self, records: &[SecretRecord]) -> Result<()> {
        let empty: Vec<String> = records
            .iter()
            .flat_map(|r| {
                r.fields
                    .iter()
                    .filter(|(_, v)| v.is_empty())
                    .map(move |(k, _)| format!("{}#{k}", r.path))
            })
            .collect();
        if !empty.is_empty() {
            return Err(BootstrapError::MissingVariables(empty));
        }

        for record in records {
            tracing::info!(
                "writing {} field(s) to {}",
                record.fields.len(),
                record.path
            );
            self.store.put(&record.path, &record.fields)?;
        }
        Ok(())
    }

    /// Validate, resolve and write in one pass.
    pub fn seed_templates(
        &self,
        templates: &[SecretTemplate],
        env: &Environment,
    ) -> Result<SeedReport> {
        let (records, report) = self.resolve(templates, env)?;
        self.seed(&records)?;
        Ok(report)
    }
}
