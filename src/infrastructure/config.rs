use crate::domain::schema::DashboardSchema;
use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub clickhouse: ClickHouseSettings,
    pub dashboards: DashboardSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClickHouseSettings {
    pub host: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Per-query ceiling in seconds; 0 disables it.
    #[serde(default)]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DashboardSettings {
    pub dir: String,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_user() -> String {
    "default".to_string()
}

/// `config/server.toml`, overridable with `DASHBOARD__CLICKHOUSE__HOST` style variables.
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config/server"))
        .add_source(config::Environment::with_prefix("DASHBOARD").separator("__"))
        .build()?;

    Ok(settings.try_deserialize()?)
}

/// Read every `.json` and `.toml` dashboard document in `dir`, sorted by file name.
/// Documents without a name are named after their file.
pub fn load_dashboards(dir: impl AsRef<Path>) -> anyhow::Result<Vec<DashboardSchema>> {
    let dir = dir.as_ref();
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read dashboard directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("json") | Some("toml")
            )
        })
        .collect();
    paths.sort();

    let mut dashboards = Vec::with_capacity(paths.len());
    for path in paths {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut schema = parse_dashboard(&text, path.extension().and_then(|e| e.to_str()))
            .with_context(|| format!("Failed to parse dashboard {}", path.display()))?;
        if schema.name.is_empty() {
            schema.name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
        }
        tracing::debug!(dashboard = %schema.name, path = %path.display(), "Loaded dashboard");
        dashboards.push(schema);
    }
    Ok(dashboards)
}

fn parse_dashboard(text: &str, extension: Option<&str>) -> anyhow::Result<DashboardSchema> {
    match extension {
        Some("toml") => Ok(toml::from_str(text)?),
        _ => Ok(serde_json::from_str(text)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schema::EntrySchema;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("dashboard-config-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_load_dashboards_reads_json_and_toml() {
        let dir = scratch_dir("mixed");
        std::fs::write(
            dir.join("a_queries.json"),
            r#"{"name": "queries", "charts": [{"type": "table", "query": {"sql": "SELECT 1"}}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("b_merges.toml"),
            r#"
title = "Merges"
version = 3

[[charts]]
type = "line"
title = "Merges per second"
gridPos = { w = 12, h = 4 }
query = { sql = "SELECT 1" }
"#,
        )
        .unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let dashboards = load_dashboards(&dir).unwrap();
        assert_eq!(dashboards.len(), 2);
        assert_eq!(dashboards[0].name, "queries");
        assert_eq!(dashboards[0].version, 1);
        assert_eq!(dashboards[1].name, "b_merges");
        assert_eq!(dashboards[1].title, "Merges");
        match &dashboards[1].charts[0] {
            EntrySchema::Panel(panel) => assert_eq!(panel.grid_pos.unwrap().w, 12),
            other => panic!("unexpected entry {:?}", other),
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_invalid_document_names_the_file() {
        let dir = scratch_dir("broken");
        std::fs::write(dir.join("broken.json"), "{not json").unwrap();
        let error = load_dashboards(&dir).unwrap_err();
        assert!(format!("{:#}", error).contains("broken.json"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        assert!(load_dashboards("/definitely/not/here").is_err());
    }
}
