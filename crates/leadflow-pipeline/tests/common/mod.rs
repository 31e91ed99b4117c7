//! Shared fixtures for pipeline integration tests
//!
//! [`LeadFixture`] writes raw `muestra.csv` / `estados.csv` files into a
//! temporary directory laid out the way [`DataPaths::under`] expects.

#![allow(dead_code)]

use leadflow_pipeline::{DataPaths, PipelineConfig, PipelineContext};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Once;
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// Test log output, controlled by RUST_LOG.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Builder for raw lead datasets on disk
#[derive(Debug, Clone)]
pub struct LeadFixture {
    sample_rows: usize,
    status_rows: usize,
    with_sample: bool,
    with_status: bool,
}

impl Default for LeadFixture {
    fn default() -> Self {
        Self {
            sample_rows: 100,
            status_rows: 50,
            with_sample: true,
            with_status: true,
        }
    }
}

impl LeadFixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_rows(mut self, rows: usize) -> Self {
        self.sample_rows = rows;
        self
    }

    pub fn status_rows(mut self, rows: usize) -> Self {
        self.status_rows = rows;
        self
    }

    pub fn without_sample(mut self) -> Self {
        self.with_sample = false;
        self
    }

    pub fn without_status(mut self) -> Self {
        self.with_status = false;
        self
    }

    /// Writes the files and returns the directory guard with its paths.
    pub fn write(&self) -> TestData {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let paths = DataPaths::under(dir.path());
        std::fs::create_dir_all(&paths.raw_dir).expect("Failed to create raw dir");

        if self.with_sample {
            std::fs::write(paths.raw_dir.join("muestra.csv"), sample_csv(self.sample_rows))
                .expect("Failed to write muestra.csv");
        }
        if self.with_status {
            std::fs::write(paths.raw_dir.join("estados.csv"), status_csv(self.status_rows))
                .expect("Failed to write estados.csv");
        }

        TestData { dir, paths }
    }
}

pub struct TestData {
    pub dir: TempDir,
    pub paths: DataPaths,
}

impl TestData {
    pub fn config(&self) -> PipelineConfig {
        PipelineConfig::default().with_paths(self.paths.clone())
    }

    pub fn context(&self) -> PipelineContext {
        PipelineContext::new(self.config())
    }

    pub fn sqlite_dsn(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path().display())
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("leads.db")
    }
}

/// Listings with a duplicated id every 20 rows, a missing price every 25
/// rows and a price outlier in the last row.
pub fn sample_csv(rows: usize) -> String {
    let mut csv =
        String::from("Id,Precio_Solicitado,Tipo_Inmueble,Area,Piso,Garajes,Ciudad,Zona\n");
    for i in 1..=rows {
        let id = if i % 20 == 0 { i - 1 } else { i };
        let price = if i % 25 == 0 {
            String::new()
        } else if i == rows {
            "999999999".to_string()
        } else {
            (250_000 + i * 1_000).to_string()
        };
        let kind = if i % 2 == 0 { " apartamento" } else { "CASA " };
        let _ = writeln!(csv, "{id},{price},{kind},{},{},{},bogota,norte", 50 + i, i % 12, i % 3);
    }
    csv
}

/// Status history with an empty status every 10 rows and one future date.
pub fn status_csv(rows: usize) -> String {
    let mut csv = String::from("Inmueble_ID,Estado,Fecha_Actualizacion\n");
    for i in 1..=rows {
        let status = if i % 10 == 0 { "" } else if i % 3 == 0 { "VENDIDO" } else { "activo" };
        let date = if i == 1 {
            "2099-01-01".to_string()
        } else {
            format!("2024-{:02}-{:02}", i % 12 + 1, i % 28 + 1)
        };
        let _ = writeln!(csv, "{i},{status},{date}");
    }
    csv
}
