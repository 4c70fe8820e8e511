use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// JSON-RPC version carried on every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol version reported by `initialize`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Server name reported by `initialize`.
pub const SERVER_NAME: &str = "kvm-control";

/// Framing: one JSON object per line, terminated by `\n`. Lines longer than
/// this are rejected before parsing.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Method names accepted by the server, either directly or as the `name` of a
/// `tools/call` envelope.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const LIST_VMS: &str = "list_vms";
    pub const CREATE_VM: &str = "create_vm";
    pub const START_VM: &str = "start_vm";
    pub const STOP_VM: &str = "stop_vm";
    pub const REBOOT_VM: &str = "reboot_vm";
    pub const GET_VNC_PORTS: &str = "get_vnc_ports";
    pub const GET_VM_IP: &str = "get_vm_ip";

    /// Lifecycle tools, in the order `initialize` advertises them.
    pub const TOOLS: &[&str] = &[
        LIST_VMS,
        CREATE_VM,
        START_VM,
        STOP_VM,
        REBOOT_VM,
        GET_VNC_PORTS,
        GET_VM_IP,
    ];
}

/// JSON-RPC error codes. The -320xx range is server-defined.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const VM_NOT_FOUND: i64 = -32001;
    pub const VM_ALREADY_EXISTS: i64 = -32002;
    pub const INVALID_STATE: i64 = -32003;

    pub const POOL_EXHAUSTED: i64 = -32010;
    pub const CONNECTION_BROKEN: i64 = -32011;
    pub const UNAVAILABLE: i64 = -32012;

    pub const HYPERVISOR_ERROR: i64 = -32020;
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// A parsed inbound call. `id` is `None` for notifications, which are
/// executed but never answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Option<Value>,
    pub method: String,
    pub params: Value,
}

impl Request {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach the machine-readable error kind as `data.kind`.
    pub fn with_kind(mut self, kind: &str) -> Self {
        self.data = Some(serde_json::json!({ "kind": kind }));
        self
    }

    pub fn kind(&self) -> Option<&str> {
        self.data.as_ref()?.get("kind")?.as_str()
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// `tools/call` envelope: `{"name": "...", "arguments": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVmsParams {
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default)]
    pub connection: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VncPortsParams {
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default)]
    pub connection: Option<String>,
}

/// Parameters for `start_vm`, `reboot_vm` and `get_vm_ip`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmNameParams {
    pub name: String,
    #[serde(default)]
    pub connection: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopVmParams {
    pub name: String,
    /// Hard power-off instead of an ACPI shutdown request.
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub connection: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IgnitionParams {
    pub hostname: Option<String>,
    pub user: Option<String>,
    /// Path to an SSH public key file; `~` is expanded.
    pub ssh_key: Option<String>,
    pub timezone: Option<String>,
    pub locale: Option<String>,
    pub password_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVmParams {
    pub name: String,
    /// MiB.
    pub memory: Option<u64>,
    pub vcpus: Option<u32>,
    /// GiB.
    pub disk_size: Option<u64>,
    pub os_variant: Option<String>,
    pub master_image: Option<String>,
    pub cdrom: Option<String>,
    pub ignition: Option<IgnitionParams>,
    pub network: Option<String>,
    pub connection: Option<String>,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: Value,
    pub server_info: ServerInfo,
}

/// One row of `list_vms`. `memory` is in MiB.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmSummary {
    pub name: String,
    pub state: String,
    pub memory: u64,
    pub vcpus: u32,
}

/// Result of create/start/stop/reboot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmActionResult {
    pub name: String,
    pub state: String,
}

/// Result of `get_vm_ip`. `ip` is the first IPv4 address libvirt reports for
/// the domain's interfaces, or `None` when it has none (or is not running).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmAddress {
    pub name: String,
    pub ip: Option<std::net::Ipv4Addr>,
}

/// Result of `get_vnc_ports`: VM name to TCP port.
pub type VncPorts = BTreeMap<String, u16>;

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

/// Parse one framed line into a [`Request`].
///
/// On failure the returned [`Response`] is the error reply to send back:
/// `-32700` for malformed JSON, `-32600` for JSON that is not a request
/// object. The id is echoed when it could be recovered, `null` otherwise.
pub fn parse_request(line: &str) -> Result<Request, Response> {
    if line.len() > MAX_LINE_LENGTH {
        return Err(Response::failure(
            Value::Null,
            RpcError::new(codes::INVALID_REQUEST, "Invalid Request: line too long")
                .with_kind("invalid_request"),
        ));
    }

    let value: Value = serde_json::from_str(line).map_err(|e| {
        Response::failure(
            Value::Null,
            RpcError::new(codes::PARSE_ERROR, format!("Parse error: {e}"))
                .with_kind("parse_error"),
        )
    })?;

    let Value::Object(mut obj) = value else {
        return Err(invalid_request(Value::Null, "expected a JSON object"));
    };

    // An explicit `"id": null` still expects an answer; only a missing id
    // marks a notification.
    let id = obj.remove("id");
    let reply_id = id.clone().unwrap_or(Value::Null);

    if let Some(version) = obj.get("jsonrpc") {
        if version.as_str() != Some(JSONRPC_VERSION) {
            return Err(invalid_request(reply_id, "unsupported jsonrpc version"));
        }
    }

    let method = match obj.remove("method") {
        Some(Value::String(m)) if !m.is_empty() => m,
        Some(_) => return Err(invalid_request(reply_id, "method must be a non-empty string")),
        None => return Err(invalid_request(reply_id, "missing method")),
    };

    let params = match obj.remove("params") {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(p @ Value::Object(_)) => p,
        Some(_) => return Err(invalid_request(reply_id, "params must be an object")),
    };

    Ok(Request { id, method, params })
}

fn invalid_request(id: Value, detail: &str) -> Response {
    Response::failure(
        id,
        RpcError::new(codes::INVALID_REQUEST, format!("Invalid Request: {detail}"))
            .with_kind("invalid_request"),
    )
}

/// Encode a response as a single `\n`-terminated line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}
