use bootstrap_core::paths::CONFIG_FILE;
use std::path::{Path, PathBuf};

/// Resolve the project root.
///
/// Priority:
/// 1. `--root` flag / `BOOTSTRAP_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `bootstrap.yaml`
/// 3. Walk upward from `cwd` looking for `.git/`
/// 4. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_upward(&cwd, |dir| dir.join(CONFIG_FILE).is_file())
        .or_else(|| find_upward(&cwd, |dir| dir.join(".git").is_dir()))
        .unwrap_or(cwd)
}

fn find_upward(start: &Path, found: impl Fn(&Path) -> bool) -> Option<PathBuf> {
    start.ancestors().find(|dir| found(dir)).map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_root_wins() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resolve_root(Some(dir.path())), dir.path());
    }

    #[test]
    fn config_file_beats_git_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        let project = dir.path().join("infra");
        std::fs::create_dir_all(project.join("topology")).unwrap();
        std::fs::write(project.join(CONFIG_FILE), "").unwrap();

        let start = project.join("topology");
        let by_config = find_upward(&start, |d| d.join(CONFIG_FILE).is_file());
        assert_eq!(by_config.as_deref(), Some(project.as_path()));
        let by_git = find_upward(&start, |d| d.join(".git").is_dir());
        assert_eq!(by_git.as_deref(), Some(dir.path()));
    }
}
