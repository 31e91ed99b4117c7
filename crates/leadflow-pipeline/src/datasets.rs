//! Known datasets, their cache keys and file names

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub const SAMPLE_RAW: &str = "sample_raw";
pub const STATUS_RAW: &str = "status_raw";
pub const SAMPLE_CLEAN: &str = "sample_clean";
pub const STATUS_CLEAN: &str = "status_clean";

/// The two record families of the lead dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Property listings (one row per lead)
    Sample,
    /// Status history of each property
    Status,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 2] = [DatasetKind::Sample, DatasetKind::Status];

    pub fn as_str(&self) -> &str {
        match self {
            DatasetKind::Sample => "sample",
            DatasetKind::Status => "status",
        }
    }

    /// Columns a raw table of this kind must carry.
    pub fn expected_columns(&self) -> &'static [&'static str] {
        match self {
            DatasetKind::Sample => &[
                "Id",
                "Precio_Solicitado",
                "Tipo_Inmueble",
                "Area",
                "Piso",
                "Garajes",
            ],
            DatasetKind::Status => &["Inmueble_ID", "Estado", "Fecha_Actualizacion"],
        }
    }

    /// Columns whose null rate is reported separately.
    pub fn critical_columns(&self) -> &'static [&'static str] {
        match self {
            DatasetKind::Sample => &["Id", "Precio_Solicitado", "Tipo_Inmueble"],
            DatasetKind::Status => &["Inmueble_ID", "Estado", "Fecha_Actualizacion"],
        }
    }

    pub fn raw_file(&self) -> &'static str {
        match self {
            DatasetKind::Sample => "muestra.csv",
            DatasetKind::Status => "estados.csv",
        }
    }

    pub fn clean_file(&self) -> &'static str {
        match self {
            DatasetKind::Sample => "CLMUESTRA.csv",
            DatasetKind::Status => "CLESTADOS.csv",
        }
    }

    pub fn cache_key(&self, stage: Stage) -> &'static str {
        match (self, stage) {
            (DatasetKind::Sample, Stage::Raw) => SAMPLE_RAW,
            (DatasetKind::Sample, Stage::Clean) => SAMPLE_CLEAN,
            (DatasetKind::Status, Stage::Raw) => STATUS_RAW,
            (DatasetKind::Status, Stage::Clean) => STATUS_CLEAN,
        }
    }

    /// Name of the cleaning task for this kind.
    pub fn task_name(&self) -> &'static str {
        match self {
            DatasetKind::Sample => "clean_sample",
            DatasetKind::Status => "clean_status",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "sample" | "muestra" | "clean_sample" => Some(DatasetKind::Sample),
            "status" | "estados" | "clean_status" => Some(DatasetKind::Status),
            _ => None,
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Raw,
    Clean,
}

/// A dataset the loader knows how to find
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSource {
    pub key: String,
    pub kind: DatasetKind,
    pub stage: Stage,
    pub path: PathBuf,
}

impl DatasetSource {
    pub fn new(kind: DatasetKind, stage: Stage, path: impl Into<PathBuf>) -> Self {
        Self {
            key: kind.cache_key(stage).to_string(),
            kind,
            stage,
            path: path.into(),
        }
    }

    pub fn is_raw(&self) -> bool {
        self.stage == Stage::Raw
    }
}

/// SQL table name for a cache key: the key without its stage suffix.
pub fn table_name_for_key(key: &str) -> &str {
    key.strip_suffix("_clean")
        .or_else(|| key.strip_suffix("_raw"))
        .unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        assert_eq!(table_name_for_key(SAMPLE_CLEAN), "sample");
        assert_eq!(table_name_for_key(STATUS_RAW), "status");
        assert_eq!(table_name_for_key("leads"), "leads");
    }

    #[test]
    fn test_kind_lookup() {
        assert_eq!(DatasetKind::from_name("Muestra"), Some(DatasetKind::Sample));
        assert_eq!(DatasetKind::from_name("clean_status"), Some(DatasetKind::Status));
        assert_eq!(DatasetKind::from_name("charts"), None);
        let source = DatasetSource::new(DatasetKind::Status, Stage::Clean, "x.csv");
        assert_eq!(source.key, STATUS_CLEAN);
        assert!(!source.is_raw());
    }
}
