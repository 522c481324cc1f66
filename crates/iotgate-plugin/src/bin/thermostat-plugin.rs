//! Example plugin: thermostat set points
//!
//! Install by copying `demos/thermostat.plugin` and this binary into the
//! gateway's plugin directory.

use std::collections::HashMap;

use iotgate_plugin::{PluginRequest, Reply, ReplyStatus, serve};
use parking_lot::Mutex;
use serde_json::Value;

/// Set points keyed by device id
#[derive(Default)]
struct Thermostat {
    set_points: Mutex<HashMap<String, f64>>,
}

impl Thermostat {
    fn handle(&self, request: &PluginRequest) -> Reply {
        let Some(device) = request.data.get("iot_id").and_then(Value::as_str) else {
            return Reply::error("Error: 'iot_id' is missing from thermostat data.");
        };

        match request.entry.as_str() {
            "SetTemperatureCommand" => {
                let Some(celsius) = request.data.get("celsius").and_then(Value::as_f64) else {
                    return Reply::error("Error: 'celsius' must be a number.");
                };
                self.set_points.lock().insert(device.to_string(), celsius);
                Reply::success(format!("Set point for {} updated!", device))
                    .with("iot_id", device)
                    .with("celsius", celsius)
            }
            "ReadTemperatureCommand" => match self.set_points.lock().get(device) {
                Some(celsius) => Reply::success(format!("Set point for {}", device))
                    .with("iot_id", device)
                    .with("celsius", *celsius),
                None => Reply::error(format!("No set point recorded for {}", device)),
            },
            other => Reply::error(format!("Unsupported entry '{}'", other)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let thermostat = Thermostat::default();

    serve(move |request: PluginRequest, log| {
        let reply = thermostat.handle(&request);
        match reply.status {
            ReplyStatus::Success => log.info(format!("{}: {}", request.command, reply.message)),
            ReplyStatus::Error => log.warn(format!("{}: {}", request.command, reply.message)),
        }
        reply
    })
    .await?;

    Ok(())
}
