//! Static workload-to-image lookup.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Resolves a workload identity to the image reference it should run.
pub trait ImageResolver: Send + Sync {
    fn resolve(&self, id: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct ImageEntry {
    #[serde(rename = "ref")]
    reference: String,
}

/// Read-only image table loaded once at startup from a JSON object of the
/// shape `{ "<id>": { "ref": "<image reference>" } }`.
#[derive(Debug)]
pub struct StaticImageTable {
    entries: HashMap<String, String>,
}

impl StaticImageTable {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::parse(&data)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let raw: HashMap<String, ImageEntry> = serde_json::from_slice(data)
            .map_err(|e| Error::Configuration(format!("invalid image table: {e}")))?;

        let entries = raw
            .into_iter()
            .map(|(id, entry)| (id, entry.reference))
            .collect();

        Ok(Self { entries })
    }

    /// Built-in table used when no file is configured.
    #[must_use]
    pub fn builtin() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            "helloweb".to_owned(),
            "docker.io/renatofq/helloweb:latest".to_owned(),
        );
        Self { entries }
    }
}

impl ImageResolver for StaticImageTable {
    fn resolve(&self, id: &str) -> Result<String> {
        self.entries
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_table() {
        let data = br#"
        {
          "helloweb" : {
            "ref" : "docker.io/renatofq/helloweb:latest"
          },
          "helloworld" : {
            "ref" : "docker.io/renatofq/helloworld:latest"
          }
        }
        "#;

        let table = StaticImageTable::parse(data).unwrap();
        assert_eq!(
            table.resolve("helloweb").unwrap(),
            "docker.io/renatofq/helloweb:latest"
        );
        assert_eq!(
            table.resolve("helloworld").unwrap(),
            "docker.io/renatofq/helloworld:latest"
        );
    }

    #[test]
    fn unknown_id_is_not_found() {
        let table = StaticImageTable::builtin();
        assert!(matches!(table.resolve("missing"), Err(Error::NotFound(_))));
    }

    #[test]
    fn malformed_table_is_configuration_error() {
        assert!(matches!(
            StaticImageTable::parse(b"[1, 2]"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{ "web": { "ref": "docker.io/library/nginx:1.27" } }"#)
            .unwrap();

        let table = StaticImageTable::load(file.path()).unwrap();
        assert_eq!(table.resolve("web").unwrap(), "docker.io/library/nginx:1.27");
    }
}
