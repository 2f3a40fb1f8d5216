//! Shared helpers: WAT policy guests, requests and configuration.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Once;

use serde_json::{Value, json};
use warden::config::Settings;
use warden::policy::{OperationType, RuleScope, RuleWithOperations};
use warden::{AdmissionRequest, PolicySpec, ResourceLimits};

static INIT: Once = Once::new();

/// Route logs to the test harness; `RUST_LOG` selects what is shown.
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// What a guest does when asked to perform an operation.
#[derive(Clone, Debug)]
pub enum Behavior {
    /// Answer with this document
    Respond(String),
    /// Answer with the payload it received
    Echo,
    /// Hit `unreachable`
    Trap,
    /// Never return
    Spin,
}

impl Behavior {
    pub fn accept() -> Self {
        Behavior::Respond(json!({"accepted": true}).to_string())
    }

    pub fn reject(message: &str, code: u16) -> Self {
        Behavior::Respond(json!({"accepted": false, "message": message, "code": code}).to_string())
    }

    pub fn respond(value: Value) -> Self {
        Behavior::Respond(value.to_string())
    }

    pub fn valid_settings() -> Self {
        Behavior::Respond(json!({"valid": true}).to_string())
    }

    pub fn invalid_settings(message: &str) -> Self {
        Behavior::Respond(json!({"valid": false, "message": message}).to_string())
    }

    /// WAT instructions answering the call; canned responses live at `offset`.
    fn body(&self, offset: usize) -> String {
        match self {
            Behavior::Respond(response) => format!(
                "(call $guest_response (i32.const {offset}) (i32.const {}))",
                response.len()
            ),
            Behavior::Echo => {
                "(call $guest_response (i32.const 65600) (local.get $msg_len))".to_string()
            }
            Behavior::Trap => "unreachable".to_string(),
            Behavior::Spin => "(loop $spin (br $spin))".to_string(),
        }
    }

    fn data(&self, offset: usize) -> String {
        match self {
            Behavior::Respond(response) => {
                let escaped = response.replace('\\', "\\\\").replace('"', "\\\"");
                format!(r#"(data (i32.const {offset}) "{escaped}")"#)
            }
            _ => String::new(),
        }
    }
}

const SETTINGS_OFFSET: usize = 0;
const VALIDATE_OFFSET: usize = 4096;

/// A waPC guest telling operations apart by the length of their name:
/// `validate_settings` (17 bytes) or `validate` (anything else).
///
/// The request is loaded with the operation at 65536 and the payload at 65600.
pub fn guest(validate: &Behavior, settings: &Behavior) -> String {
    format!(
        r#"(module
    (import "wapc" "__guest_request" (func $guest_request (param i32 i32)))
    (import "wapc" "__guest_response" (func $guest_response (param i32 i32)))
    (memory (export "memory") 4)
    {settings_data}
    {validate_data}
    (func (export "__guest_call") (param $op_len i32) (param $msg_len i32) (result i32)
        (call $guest_request (i32.const 65536) (i32.const 65600))
        (if (i32.eq (local.get $op_len) (i32.const 17))
            (then
                {settings_body}
                (return (i32.const 1))))
        {validate_body}
        (i32.const 1)))"#,
        settings_data = settings.data(SETTINGS_OFFSET),
        validate_data = validate.data(VALIDATE_OFFSET),
        settings_body = settings.body(SETTINGS_OFFSET),
        validate_body = validate.body(VALIDATE_OFFSET),
    )
}

/// Write a guest to `dir/<name>.wat` and return its `file://` reference.
pub fn write_guest(dir: &Path, name: &str, validate: &Behavior, settings: &Behavior) -> String {
    let path = dir.join(format!("{name}.wat"));
    std::fs::write(&path, guest(validate, settings)).expect("write guest module");
    format!("file://{}", path.display())
}

/// Rule matching pod creation.
pub fn pods_create() -> RuleWithOperations {
    RuleWithOperations {
        operations: vec![OperationType::Create],
        api_groups: vec![String::new()],
        api_versions: vec!["v1".to_string()],
        resources: vec!["pods".to_string()],
        scope: RuleScope::All,
    }
}

/// Protect-mode spec for `module` matching pod creation.
pub fn pod_policy(module: String) -> PolicySpec {
    PolicySpec {
        rules: vec![pods_create()],
        ..PolicySpec::new(module)
    }
}

/// Settings holding `policies`, in order.
pub fn settings(dir: &Path, policies: Vec<(&str, PolicySpec)>) -> Settings {
    Settings {
        policies_download_dir: dir.join("downloads"),
        limits: ResourceLimits::default(),
        forward_guest_output: false,
        policies: policies
            .into_iter()
            .map(|(name, spec)| (name.to_string(), spec))
            .collect(),
    }
}

/// A request creating a privileged pod in `default`.
pub fn pod_request() -> AdmissionRequest {
    serde_json::from_value(json!({
        "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
        "kind": {"group": "", "version": "v1", "kind": "Pod"},
        "resource": {"group": "", "version": "v1", "resource": "pods"},
        "name": "nginx",
        "namespace": "default",
        "operation": "CREATE",
        "userInfo": {"username": "alice", "groups": ["system:authenticated"]},
        "object": {
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "nginx", "namespace": "default"},
            "spec": {
                "containers": [{
                    "name": "nginx",
                    "image": "nginx",
                    "securityContext": {"privileged": true},
                }],
            },
        },
    }))
    .expect("valid admission request")
}

/// A request creating a service, which pod policies ignore.
pub fn service_request() -> AdmissionRequest {
    serde_json::from_value(json!({
        "uid": "b0b0b0b0-0000-0000-0000-000000000001",
        "kind": {"group": "", "version": "v1", "kind": "Service"},
        "resource": {"group": "", "version": "v1", "resource": "services"},
        "name": "web",
        "namespace": "default",
        "operation": "CREATE",
        "object": {"apiVersion": "v1", "kind": "Service", "metadata": {"name": "web"}},
    }))
    .expect("valid admission request")
}
