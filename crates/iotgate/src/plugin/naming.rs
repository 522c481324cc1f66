//! Command names for plugin entry types

use crate::command::{REGISTER_COMPANY, REGISTER_IOT, REGISTER_PRODUCT, UPDATE_IOT};

/// Entry types whose derived name would not match the built-in command
const OVERRIDES: &[(&str, &str)] = &[
    ("RegisterCompanyCommand", REGISTER_COMPANY),
    ("RegisterCompany", REGISTER_COMPANY),
    ("RegisterProductCommand", REGISTER_PRODUCT),
    ("RegisterProduct", REGISTER_PRODUCT),
    ("RegisterIoTCommand", REGISTER_IOT),
    ("RegisterIoT", REGISTER_IOT),
    ("UpdateIoTCommand", UPDATE_IOT),
    ("UpdateIoT", UPDATE_IOT),
];

/// Registry name for an entry type: drop `Command` and put a space before
/// every capital, so `SetTemperatureCommand` becomes `"Set Temperature"`.
///
/// Every occurrence of `Command` is dropped, not only the suffix, so
/// `CommandRelayCommand` is registered as `"Relay"`.
pub fn command_name(type_name: &str) -> String {
    if let Some((_, name)) = OVERRIDES.iter().find(|(ty, _)| *ty == type_name) {
        return (*name).to_string();
    }

    let base = type_name.replace("Command", "");
    let mut name = String::with_capacity(base.len() + 4);
    for c in base.chars() {
        if c.is_uppercase() {
            name.push(' ');
        }
        name.push(c);
    }
    name.trim().to_string()
}
