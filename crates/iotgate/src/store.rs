//! Device Store
//!
//! Storage seam used by the built-in command handlers. The gateway only
//! depends on the [`DeviceStore`] trait; [`MemoryStore`] keeps everything in
//! process so the gateway can run standalone.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from the device store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Company '{0}' is not registered. Register the company first.")]
    CompanyNotFound(String),

    #[error("Product '{0}' is not registered. Register the product first.")]
    ProductNotFound(String),

    #[error("IoT device '{0}' is not registered. Register the device first.")]
    DeviceNotFound(String),

    #[error("IoT device '{0}' already exists")]
    AlreadyExists(String),
}

/// A company is identified by its name together with its id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CompanyKey {
    pub name: String,
    pub id: String,
}

impl CompanyKey {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for CompanyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.name, self.id)
    }
}

/// A product line (name + version) owned by a company
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProductKey {
    pub company: CompanyKey,
    pub name: String,
    pub version: String,
}

impl ProductKey {
    pub fn new(company: CompanyKey, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            company,
            name: name.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for ProductKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{} ({})", self.name, self.version, self.company)
    }
}

/// Whether a registration created something new
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Existing,
}

/// A registered IoT device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
    pub iot_id: String,
    pub created_at: DateTime<Utc>,
    /// Fields supplied at registration beyond the identifying ones
    pub extra: Map<String, Value>,
}

/// One entry in a device's update log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateRecord {
    pub timestamp: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

/// Storage used by the built-in commands
pub trait DeviceStore: Send + Sync {
    /// Register a company. Registering twice is not an error.
    fn register_company(&self, company: &CompanyKey) -> Result<Registration, StoreError>;

    /// Register a product under an existing company. Idempotent.
    fn register_product(&self, product: &ProductKey) -> Result<Registration, StoreError>;

    /// Register a new device under an existing product
    fn register_device(
        &self,
        product: &ProductKey,
        iot_id: &str,
        extra: Map<String, Value>,
    ) -> Result<DeviceRecord, StoreError>;

    /// Append an entry to a registered device's update log
    fn record_update(
        &self,
        product: &ProductKey,
        iot_id: &str,
        fields: Map<String, Value>,
    ) -> Result<UpdateRecord, StoreError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Device {
    record: Option<DeviceRecord>,
    updates: Vec<UpdateRecord>,
}

#[derive(Debug, Default)]
struct Product {
    devices: HashMap<String, Device>,
}

#[derive(Debug, Default)]
struct Company {
    products: HashMap<(String, String), Product>,
}

/// In-process [`DeviceStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    companies: RwLock<HashMap<CompanyKey, Company>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn company_count(&self) -> usize {
        self.companies.read().len()
    }

    pub fn has_product(&self, product: &ProductKey) -> bool {
        self.companies
            .read()
            .get(&product.company)
            .is_some_and(|c| c.products.contains_key(&product_slot(product)))
    }

    /// Look up a registered device
    pub fn device(&self, product: &ProductKey, iot_id: &str) -> Option<DeviceRecord> {
        let companies = self.companies.read();
        companies
            .get(&product.company)?
            .products
            .get(&product_slot(product))?
            .devices
            .get(iot_id)?
            .record
            .clone()
    }

    /// Update log of a device, oldest first
    pub fn updates(&self, product: &ProductKey, iot_id: &str) -> Vec<UpdateRecord> {
        let companies = self.companies.read();
        companies
            .get(&product.company)
            .and_then(|c| c.products.get(&product_slot(product)))
            .and_then(|p| p.devices.get(iot_id))
            .map(|d| d.updates.clone())
            .unwrap_or_default()
    }
}

fn product_slot(product: &ProductKey) -> (String, String) {
    (product.name.clone(), product.version.clone())
}

impl DeviceStore for MemoryStore {
    fn register_company(&self, company: &CompanyKey) -> Result<Registration, StoreError> {
        let mut companies = self.companies.write();
        if companies.contains_key(company) {
            debug!("Company {} already registered", company);
            return Ok(Registration::Existing);
        }
        companies.insert(company.clone(), Company::default());
        info!("Registered company {}", company);
        Ok(Registration::Created)
    }

    fn register_product(&self, product: &ProductKey) -> Result<Registration, StoreError> {
        let mut companies = self.companies.write();
        let company = companies
            .get_mut(&product.company)
            .ok_or_else(|| StoreError::CompanyNotFound(product.company.to_string()))?;

        let slot = product_slot(product);
        if company.products.contains_key(&slot) {
            debug!("Product {} already registered", product);
            return Ok(Registration::Existing);
        }
        company.products.insert(slot, Product::default());
        info!("Registered product {}", product);
        Ok(Registration::Created)
    }

    fn register_device(
        &self,
        product: &ProductKey,
        iot_id: &str,
        extra: Map<String, Value>,
    ) -> Result<DeviceRecord, StoreError> {
        let mut companies = self.companies.write();
        let entry = companies
            .get_mut(&product.company)
            .and_then(|c| c.products.get_mut(&product_slot(product)))
            .ok_or_else(|| StoreError::ProductNotFound(product.to_string()))?;

        let device = entry.devices.entry(iot_id.to_string()).or_default();
        if device.record.is_some() {
            return Err(StoreError::AlreadyExists(iot_id.to_string()));
        }

        let record = DeviceRecord {
            iot_id: iot_id.to_string(),
            created_at: Utc::now(),
            extra,
        };
        device.record = Some(record.clone());
        info!("Registered IoT device {} for {}", iot_id, product);
        Ok(record)
    }

    fn record_update(
        &self,
        product: &ProductKey,
        iot_id: &str,
        fields: Map<String, Value>,
    ) -> Result<UpdateRecord, StoreError> {
        let mut companies = self.companies.write();
        let device = companies
            .get_mut(&product.company)
            .and_then(|c| c.products.get_mut(&product_slot(product)))
            .and_then(|p| p.devices.get_mut(iot_id))
            .filter(|d| d.record.is_some())
            .ok_or_else(|| StoreError::DeviceNotFound(iot_id.to_string()))?;

        let update = UpdateRecord {
            timestamp: Utc::now(),
            fields,
        };
        device.updates.push(update.clone());
        debug!("Logged update #{} for IoT device {}", device.updates.len(), iot_id);
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn acme_sensor() -> ProductKey {
        ProductKey::new(CompanyKey::new("acme", "42"), "sensor", "1.0")
    }

    #[test]
    fn test_register_company_is_idempotent() {
        let store = MemoryStore::new();
        let acme = CompanyKey::new("acme", "42");
        assert_eq!(store.register_company(&acme), Ok(Registration::Created));
        assert_eq!(store.register_company(&acme), Ok(Registration::Existing));
        assert_eq!(store.company_count(), 1);
    }

    #[test]
    fn test_product_requires_company() {
        let store = MemoryStore::new();
        let product = acme_sensor();
        assert_eq!(
            store.register_product(&product),
            Err(StoreError::CompanyNotFound("acme_42".into()))
        );

        store.register_company(&product.company).unwrap();
        assert_eq!(store.register_product(&product), Ok(Registration::Created));
        assert!(store.has_product(&product));
    }

    #[test]
    fn test_device_lifecycle() {
        let store = MemoryStore::new();
        let product = acme_sensor();

        let extra = json!({"location": "roof"}).as_object().cloned().unwrap();
        assert!(matches!(
            store.register_device(&product, "dev-1", extra.clone()),
            Err(StoreError::ProductNotFound(_))
        ));

        store.register_company(&product.company).unwrap();
        store.register_product(&product).unwrap();
        let record = store.register_device(&product, "dev-1", extra).unwrap();
        assert_eq!(record.extra["location"], "roof");
        assert_eq!(
            store.register_device(&product, "dev-1", Map::new()),
            Err(StoreError::AlreadyExists("dev-1".into()))
        );
        assert_eq!(store.device(&product, "dev-1"), Some(record));

        let fields = json!({"battery": 80}).as_object().cloned().unwrap();
        store.record_update(&product, "dev-1", fields).unwrap();
        assert_eq!(store.updates(&product, "dev-1").len(), 1);

        assert_eq!(
            store.record_update(&product, "dev-2", Map::new()),
            Err(StoreError::DeviceNotFound("dev-2".into()))
        );
    }
}
