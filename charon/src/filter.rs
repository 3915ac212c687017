//! CEL-based device filter applied to the publish pipeline.
//!
//! The expression sees `name`, `kind` and the attribute map as `attributes`
//! (keyed by the attribute's short name, without the qualifier prefix).
//! Evaluation errors keep the device; a non-boolean result drops it.

use std::collections::HashMap;

use anyhow::{Context as AnyhowContext, Result};
use cel::{Context, Program};
use tracing::{debug, warn};

use crate::device::{AttrValue, Device};

pub struct DeviceFilter {
    program: Option<Program>,
    expression: String,
}

impl DeviceFilter {
    /// the identity filter
    pub fn none() -> Self {
        DeviceFilter {
            program: None,
            expression: String::new(),
        }
    }

    /// compile a user-supplied expression
    pub fn compile(expression: &str) -> Result<Self> {
        let program = Program::compile(expression)
            .with_context(|| format!("failed to compile device filter {:?}", expression))?;
        Ok(DeviceFilter {
            program: Some(program),
            expression: expression.to_string(),
        })
    }

    /// Keep the devices matching the predicate.
    pub fn apply(&self, devices: Vec<Device>) -> Vec<Device> {
        let Some(program) = &self.program else {
            return devices;
        };
        devices
            .into_iter()
            .filter(|device| self.matches(program, device))
            .collect()
    }

    fn matches(&self, program: &Program, device: &Device) -> bool {
        let mut context = Context::default();

        // expose attributes under their short names so expressions read as
        // `attributes.mtu`, not `attributes["charon.dev/mtu"]`
        let attributes: HashMap<String, AttrValue> = device
            .attributes
            .iter()
            .map(|(key, value)| {
                let short = key.rsplit('/').next().unwrap_or(key).to_string();
                (short, value.clone())
            })
            .collect();

        if let Err(err) = context.add_variable("name", device.name.clone()) {
            warn!("device filter: failed to bind name: {}", err);
            return true;
        }
        if let Err(err) = context.add_variable("kind", device.kind.to_string()) {
            warn!("device filter: failed to bind kind: {}", err);
            return true;
        }
        if let Err(err) = context.add_variable("attributes", attributes) {
            warn!("device filter: failed to bind attributes: {}", err);
            return true;
        }

        match program.execute(&context) {
            Ok(cel::Value::Bool(keep)) => keep,
            Ok(other) => {
                debug!(
                    "device filter {:?} returned non-boolean {:?} for {}, dropping",
                    self.expression, other, device.name
                );
                false
            }
            Err(err) => {
                // an expression that cannot be evaluated must not hide devices
                warn!(
                    "device filter {:?} failed for {}: {}, keeping",
                    self.expression, device.name, err
                );
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, attr};

    fn device(name: &str, mtu: i64, rdma: bool) -> Device {
        let mut dev = Device::new(name, DeviceKind::Network);
        dev.set(attr::MTU, mtu);
        dev.set(attr::RDMA, rdma);
        dev
    }

    #[test]
    fn test_none_is_identity() {
        let devices = vec![device("eth0", 1500, false), device("eth1", 9000, true)];
        let kept = DeviceFilter::none().apply(devices.clone());
        assert_eq!(kept.len(), devices.len());
    }

    #[test]
    fn test_attribute_predicate() {
        let filter = DeviceFilter::compile("attributes.mtu >= 9000").unwrap();
        let kept = filter.apply(vec![device("eth0", 1500, false), device("eth1", 9000, true)]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "eth1");
    }

    #[test]
    fn test_name_and_bool_predicate() {
        let filter = DeviceFilter::compile("attributes.rdma && name.startsWith(\"eth\")").unwrap();
        let kept = filter.apply(vec![device("eth0", 1500, false), device("eth1", 9000, true)]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "eth1");
    }

    #[test]
    fn test_non_boolean_drops() {
        let filter = DeviceFilter::compile("attributes.mtu").unwrap();
        let kept = filter.apply(vec![device("eth0", 1500, false)]);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_evaluation_error_keeps() {
        // references an attribute no device carries
        let filter = DeviceFilter::compile("attributes.noSuchKey == 7").unwrap();
        let kept = filter.apply(vec![device("eth0", 1500, false)]);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_compile_error_reported() {
        assert!(DeviceFilter::compile("attributes.mtu >=").is_err());
    }
}
