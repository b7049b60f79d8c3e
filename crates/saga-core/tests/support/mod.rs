#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use saga_core::{ServiceError, ServiceInvoker, StateMachineEngine};
use serde_json::{json, Value};

/// Servicio de pruebas: registra cada llamada y falla según la entrada.
#[derive(Clone, Default)]
pub struct DemoService {
    calls: Arc<Mutex<Vec<String>>>,
    counters: Arc<Mutex<HashMap<String, u64>>>,
}

impl DemoService {
    pub fn calls(&self) -> Vec<String> { self.calls.lock().unwrap().clone() }

    pub fn count(&self, method: &str) -> usize { self.calls().iter().filter(|c| c.as_str() == method).count() }

    fn bump(&self, key: &str) -> u64 {
        let mut counters = self.counters.lock().unwrap();
        let c = counters.entry(key.to_string()).or_insert(0);
        *c += 1;
        *c
    }
}

impl ServiceInvoker for DemoService {
    fn invoke(&self, method: &str, input: &Value) -> Result<Value, ServiceError> {
        self.calls.lock().unwrap().push(method.to_string());
        match method {
            "foo" => Ok(json!({ "value": input.get("a").cloned().unwrap_or(json!(1)) })),
            "bar" => {
                if input.get("barFail").and_then(Value::as_bool).unwrap_or(false) {
                    return Err(ServiceError::new("BarFailed", "bar always fails"));
                }
                // Falla las primeras `barFailTimes` llamadas.
                let fail_times = input.get("barFailTimes").and_then(Value::as_u64).unwrap_or(0);
                if self.bump("bar") <= fail_times {
                    return Err(ServiceError::new("BarFailed", "bar transient failure"));
                }
                Ok(json!({ "ok": true }))
            }
            "item" => {
                let element = input.get("element").cloned().unwrap_or(Value::Null);
                if input.get("failAt") == Some(&element) {
                    return Err(ServiceError::new("ItemFailed", format!("element {element} rejected")));
                }
                Ok(json!({ "done": element }))
            }
            "slow" => {
                let ms = input.get("sleepMs").and_then(Value::as_u64).unwrap_or(50);
                std::thread::sleep(Duration::from_millis(ms));
                Ok(json!({ "slept": ms }))
            }
            "unknown" => Err(ServiceError::unknown("Timeout", "remote side did not answer")),
            m if m.starts_with("compensate") => Ok(json!({ "compensated": m })),
            "compensationFails" => Err(ServiceError::new("CompensationFailed", "cannot undo")),
            other => Err(ServiceError::new("NoSuchMethod", other.to_string())),
        }
    }
}

pub fn engine_with(service: &DemoService) -> StateMachineEngine {
    let _ = pretty_env_logger::try_init();
    StateMachineEngine::in_memory().service("demo", service.clone()).build()
}
