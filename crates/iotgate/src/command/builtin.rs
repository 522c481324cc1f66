//! Built-in Device-Management Commands
//!
//! | Command            | Required fields                                               |
//! |--------------------|---------------------------------------------------------------|
//! | `Register Company` | company_name, company_id                                      |
//! | `Register Product` | company_name, company_id, product_name, product_version       |
//! | `Register IoT`     | iot_id, company_id, company_name, product_name, product_version |
//! | `Update IoT`       | same as `Register IoT`                                        |

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::registry::{CommandRegistry, Dependencies};
use super::{Command, CommandError, Request, Response};
use crate::store::{CompanyKey, DeviceStore, ProductKey};

pub const REGISTER_COMPANY: &str = "Register Company";
pub const REGISTER_PRODUCT: &str = "Register Product";
pub const REGISTER_IOT: &str = "Register IoT";
pub const UPDATE_IOT: &str = "Update IoT";

const DEVICE_FIELDS: [&str; 5] = [
    "iot_id",
    "company_id",
    "company_name",
    "product_name",
    "product_version",
];

/// Register the four built-in commands
pub fn register_builtins(registry: &CommandRegistry) {
    registry.add(REGISTER_COMPANY, |request, deps| {
        Box::new(RegisterCompany::new(request, deps))
    });
    registry.add(REGISTER_PRODUCT, |request, deps| {
        Box::new(RegisterProduct::new(request, deps))
    });
    registry.add(REGISTER_IOT, |request, deps| Box::new(RegisterIoT::new(request, deps)));
    registry.add(UPDATE_IOT, |request, deps| Box::new(UpdateIoT::new(request, deps)));
}

// ─────────────────────────────────────────────────────────────────────────────
// Field extraction
// ─────────────────────────────────────────────────────────────────────────────

fn require(
    data: &Map<String, Value>,
    field: &'static str,
    context: &'static str,
) -> Result<String, CommandError> {
    let value = data
        .get(field)
        .ok_or(CommandError::MissingField { field, context })?;
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        Value::Array(_) | Value::Object(_) => return Err(CommandError::InvalidField(field)),
    };
    if text.is_empty() {
        return Err(CommandError::EmptyField(field));
    }
    Ok(text)
}

struct DeviceIdentity {
    iot_id: String,
    product: ProductKey,
}

impl DeviceIdentity {
    fn extract(data: &Map<String, Value>, context: &'static str) -> Result<Self, CommandError> {
        let iot_id = require(data, "iot_id", context)?;
        let company_id = require(data, "company_id", context)?;
        let company_name = require(data, "company_name", context)?;
        let product_name = require(data, "product_name", context)?;
        let product_version = require(data, "product_version", context)?;
        Ok(Self {
            iot_id,
            product: ProductKey::new(
                CompanyKey::new(company_name, company_id),
                product_name,
                product_version,
            ),
        })
    }

    fn fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("iot_id".into(), self.iot_id.clone().into());
        fields.insert("company_id".into(), self.product.company.id.clone().into());
        fields.insert("company_name".into(), self.product.company.name.clone().into());
        fields.insert("product_name".into(), self.product.name.clone().into());
        fields.insert("product_version".into(), self.product.version.clone().into());
        fields
    }
}

fn is_identity_field(key: &str) -> bool {
    key == "command" || DEVICE_FIELDS.contains(&key)
}

// ─────────────────────────────────────────────────────────────────────────────
// Register Company
// ─────────────────────────────────────────────────────────────────────────────

pub struct RegisterCompany {
    data: Map<String, Value>,
    store: Arc<dyn DeviceStore>,
}

impl RegisterCompany {
    pub fn new(request: Request, deps: &Dependencies) -> Self {
        Self {
            data: request.envelope.data,
            store: Arc::clone(&deps.store),
        }
    }
}

impl Command for RegisterCompany {
    fn execute(self: Box<Self>) -> Result<Response, CommandError> {
        let name = require(&self.data, "company_name", "registration")?;
        let id = require(&self.data, "company_id", "registration")?;
        let company = CompanyKey::new(name, id);

        self.store.register_company(&company)?;
        info!("Company {} registered", company);

        Ok(
            Response::success(REGISTER_COMPANY, format!("{} company registered!", company))
                .with("company_name", company.name)
                .with("company_id", company.id),
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Register Product
// ─────────────────────────────────────────────────────────────────────────────

pub struct RegisterProduct {
    data: Map<String, Value>,
    store: Arc<dyn DeviceStore>,
}

impl RegisterProduct {
    pub fn new(request: Request, deps: &Dependencies) -> Self {
        Self {
            data: request.envelope.data,
            store: Arc::clone(&deps.store),
        }
    }
}

impl Command for RegisterProduct {
    fn execute(self: Box<Self>) -> Result<Response, CommandError> {
        const CONTEXT: &str = "product registration";
        let company_name = require(&self.data, "company_name", CONTEXT)?;
        let company_id = require(&self.data, "company_id", CONTEXT)?;
        let product_name = require(&self.data, "product_name", CONTEXT)?;
        let product_version = require(&self.data, "product_version", CONTEXT)?;

        let product = ProductKey::new(
            CompanyKey::new(company_name, company_id),
            product_name,
            product_version,
        );
        self.store.register_product(&product)?;
        info!("Product {} registered", product);

        Ok(Response::success(
            REGISTER_PRODUCT,
            format!("Product {} registered!", product.name),
        )
        .with("company_id", product.company.id)
        .with("company_name", product.company.name)
        .with("product_name", product.name)
        .with("product_version", product.version))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Register IoT
// ─────────────────────────────────────────────────────────────────────────────

pub struct RegisterIoT {
    data: Map<String, Value>,
    store: Arc<dyn DeviceStore>,
}

impl RegisterIoT {
    pub fn new(request: Request, deps: &Dependencies) -> Self {
        Self {
            data: request.envelope.data,
            store: Arc::clone(&deps.store),
        }
    }
}

impl Command for RegisterIoT {
    fn execute(self: Box<Self>) -> Result<Response, CommandError> {
        let identity = DeviceIdentity::extract(&self.data, "IoT registration")?;

        let extra: Map<String, Value> = self
            .data
            .iter()
            .filter(|(key, _)| !is_identity_field(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !extra.is_empty() {
            debug!("Extra data for IoT device {}: {:?}", identity.iot_id, extra);
        }

        let record =
            self.store
                .register_device(&identity.product, &identity.iot_id, extra)?;

        let mut response = Response::success(
            REGISTER_IOT,
            format!("{} IoT device registered!", identity.iot_id),
        );
        response.extra = identity.fields();
        response.extra.extend(record.extra);
        Ok(response)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Update IoT
// ─────────────────────────────────────────────────────────────────────────────

pub struct UpdateIoT {
    data: Map<String, Value>,
    store: Arc<dyn DeviceStore>,
}

impl UpdateIoT {
    pub fn new(request: Request, deps: &Dependencies) -> Self {
        Self {
            data: request.envelope.data,
            store: Arc::clone(&deps.store),
        }
    }
}

impl Command for UpdateIoT {
    fn execute(self: Box<Self>) -> Result<Response, CommandError> {
        let identity = DeviceIdentity::extract(&self.data, "IoT update")?;

        let mut fields = identity.fields();
        for (key, value) in &self.data {
            if is_identity_field(key) {
                continue;
            }
            match value {
                Value::Array(_) => {
                    warn!("Skipping array field '{}' in {} command", key, UPDATE_IOT);
                }
                Value::Object(_) => {
                    warn!("Skipping nested object field '{}' in {} command", key, UPDATE_IOT);
                }
                scalar => {
                    fields.insert(key.clone(), scalar.clone());
                }
            }
        }
        if fields.len() == DEVICE_FIELDS.len() {
            warn!(
                "No update fields provided for IoT device {}, logging identity and timestamp only",
                identity.iot_id
            );
        }

        let update = self
            .store
            .record_update(&identity.product, &identity.iot_id, fields)?;
        info!("Logged update for IoT device {}", identity.iot_id);

        let mut response = Response::success(
            UPDATE_IOT,
            format!("Update logged for IoT device {}!", identity.iot_id),
        );
        response.extra = update.fields;
        response
            .extra
            .insert("timestamp".into(), update.timestamp.to_rfc3339().into());
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Envelope, Status};
    use crate::net::testing::captured;
    use crate::store::{MemoryStore, StoreError};
    use serde_json::json;

    struct Fixture {
        registry: CommandRegistry,
        store: Arc<MemoryStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let registry = CommandRegistry::new(Dependencies::new(store.clone()));
            register_builtins(&registry);
            Self { registry, store }
        }

        fn run(&self, command: &str, data: Value) -> Result<Response, CommandError> {
            let (conn, _captured) = captured();
            let data = data.as_object().cloned().unwrap();
            let request = Request::new(conn, Envelope::new(command, data));
            self.registry.create(command, request).unwrap().execute()
        }
    }

    fn device(extra: Value) -> Value {
        let mut data = json!({
            "iot_id": "dev-1",
            "company_id": "42",
            "company_name": "acme",
            "product_name": "watch",
            "product_version": "3.0"
        });
        if let (Some(data), Some(extra)) = (data.as_object_mut(), extra.as_object()) {
            data.extend(extra.clone());
        }
        data
    }

    fn seed(fixture: &Fixture) {
        fixture
            .run(REGISTER_COMPANY, json!({"company_name": "acme", "company_id": "42"}))
            .unwrap();
        fixture
            .run(
                REGISTER_PRODUCT,
                json!({
                    "company_name": "acme",
                    "company_id": "42",
                    "product_name": "watch",
                    "product_version": "3.0"
                }),
            )
            .unwrap();
    }

    #[test]
    fn test_register_company() {
        let fixture = Fixture::new();
        let response = fixture
            .run(REGISTER_COMPANY, json!({"company_name": " acme ", "company_id": 42}))
            .unwrap();

        assert_eq!(response.status, Status::Success);
        assert_eq!(response.command.as_deref(), Some(REGISTER_COMPANY));
        assert_eq!(response.extra["company_name"], "acme");
        assert_eq!(response.extra["company_id"], "42");
        assert_eq!(fixture.store.company_count(), 1);
    }

    #[test]
    fn test_missing_and_empty_fields() {
        let fixture = Fixture::new();

        let err = fixture
            .run(REGISTER_COMPANY, json!({"company_id": "42"}))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error: 'company_name' is missing from registration data."
        );

        let err = fixture
            .run(REGISTER_COMPANY, json!({"company_name": "  ", "company_id": "42"}))
            .unwrap_err();
        assert_eq!(err.to_string(), "Error: 'company_name' cannot be empty.");

        let err = fixture
            .run(REGISTER_IOT, json!({"company_id": "42"}))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error: 'iot_id' is missing from IoT registration data."
        );
    }

    #[test]
    fn test_register_product_requires_company() {
        let fixture = Fixture::new();
        let err = fixture
            .run(
                REGISTER_PRODUCT,
                json!({
                    "company_name": "acme",
                    "company_id": "42",
                    "product_name": "watch",
                    "product_version": "3.0"
                }),
            )
            .unwrap_err();
        assert!(matches!(err, CommandError::Store(StoreError::CompanyNotFound(_))));
    }

    #[test]
    fn test_register_iot_keeps_extra_fields() {
        let fixture = Fixture::new();
        seed(&fixture);

        let response = fixture
            .run(REGISTER_IOT, device(json!({"location": "lab", "tags": ["a"]})))
            .unwrap();
        assert_eq!(response.message, "dev-1 IoT device registered!");
        assert_eq!(response.extra["location"], "lab");
        assert_eq!(response.extra["tags"], json!(["a"]));

        let product = ProductKey::new(CompanyKey::new("acme", "42"), "watch", "3.0");
        let record = fixture.store.device(&product, "dev-1").unwrap();
        assert_eq!(record.extra.len(), 2);

        let err = fixture.run(REGISTER_IOT, device(json!({}))).unwrap_err();
        assert!(matches!(err, CommandError::Store(StoreError::AlreadyExists(_))));
    }

    #[test]
    fn test_update_iot_records_scalars_only() {
        let fixture = Fixture::new();
        seed(&fixture);
        fixture.run(REGISTER_IOT, device(json!({}))).unwrap();

        let response = fixture
            .run(
                UPDATE_IOT,
                device(json!({
                    "battery": 81,
                    "online": true,
                    "note": null,
                    "readings": [1, 2],
                    "meta": {"a": 1}
                })),
            )
            .unwrap();

        assert_eq!(response.extra["battery"], 81);
        assert_eq!(response.extra["online"], true);
        assert_eq!(response.extra["note"], Value::Null);
        assert!(!response.extra.contains_key("readings"));
        assert!(!response.extra.contains_key("meta"));
        assert!(response.extra["timestamp"].is_string());

        let product = ProductKey::new(CompanyKey::new("acme", "42"), "watch", "3.0");
        let updates = fixture.store.updates(&product, "dev-1");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].fields["iot_id"], "dev-1");
    }

    #[test]
    fn test_update_unknown_device() {
        let fixture = Fixture::new();
        seed(&fixture);
        let err = fixture.run(UPDATE_IOT, device(json!({}))).unwrap_err();
        assert!(matches!(err, CommandError::Store(StoreError::DeviceNotFound(_))));
    }
}
