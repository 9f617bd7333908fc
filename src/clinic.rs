use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

/// Manages per-clinic engines. Each clinic gets its own Engine + WAL +
/// compactor; clinics never share state. Clinic = the `x-medlipi-clinic`
/// request header.
pub struct ClinicRegistry {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl ClinicRegistry {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily create an engine for the given clinic.
    pub fn get_or_create(&self, clinic: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(clinic) {
            return Ok(engine.value().clone());
        }
        if clinic.len() > MAX_CLINIC_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "clinic name too long",
            ));
        }
        if self.engines.len() >= MAX_CLINICS {
            return Err(std::io::Error::other("too many clinics"));
        }

        // Sanitize clinic name to prevent path traversal
        let safe_name: String = clinic
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty clinic name",
            ));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, notify)?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        self.engines.insert(clinic.to_string(), engine.clone());
        metrics::gauge!(crate::observability::CLINICS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("medlipi_test_clinic").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn clinic_isolation() {
        let dir = test_data_dir("isolation");
        let registry = ClinicRegistry::new(dir, 1000);

        let eng_a = registry.get_or_create("clinic_a").unwrap();
        let eng_b = registry.get_or_create("clinic_b").unwrap();

        let session = Ulid::new();
        let doctor = Ulid::new();

        // Same session id in both clinics
        eng_a
            .create_session(session, doctor, Span::new(0, 3_600_000), 2)
            .await
            .unwrap();
        eng_b
            .create_session(session, doctor, Span::new(0, 3_600_000), 2)
            .await
            .unwrap();

        eng_a
            .book_serial(Ulid::new(), session, Ulid::new())
            .await
            .unwrap();

        // Clinic B's session is untouched
        assert!(eng_b.get_bookings(session).await.unwrap().is_empty());
        assert_eq!(eng_a.get_bookings(session).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clinic_lazy_creation() {
        let dir = test_data_dir("lazy");
        let registry = ClinicRegistry::new(dir.clone(), 1000);

        // No WAL files should exist yet
        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = registry.get_or_create("city_clinic").unwrap();

        assert!(dir.join("city_clinic.wal").exists());
    }

    #[tokio::test]
    async fn clinic_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let registry = ClinicRegistry::new(dir, 1000);

        let eng1 = registry.get_or_create("foo").unwrap();
        let eng2 = registry.get_or_create("foo").unwrap();

        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn clinic_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let registry = ClinicRegistry::new(dir.clone(), 1000);

        // Path traversal attempt
        let _eng = registry.get_or_create("../evil").unwrap();
        // Should create "evil.wal", not "../evil.wal"
        assert!(dir.join("evil.wal").exists());

        // Empty after sanitization
        let result = registry.get_or_create("../..");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn clinic_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let registry = ClinicRegistry::new(dir, 1000);

        let long_name = "x".repeat(MAX_CLINIC_NAME_LEN + 1);
        let result = registry.get_or_create(&long_name);
        assert!(result.is_err());
        let err = result.err().unwrap();
        assert!(err.to_string().contains("clinic name too long"));
    }

    #[tokio::test]
    async fn clinic_count_limit() {
        let dir = test_data_dir("count_limit");
        let registry = ClinicRegistry::new(dir, 1000);

        for i in 0..MAX_CLINICS {
            registry.get_or_create(&format!("c{i}")).unwrap();
        }
        let result = registry.get_or_create("one_more");
        assert!(result.is_err());
        let err = result.err().unwrap();
        assert!(err.to_string().contains("too many clinics"));
    }
}
