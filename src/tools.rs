//! Tool declarations and tool-call resolution.
//!
//! A [`Tool`] declares an ordered list of typed [`ToolParameter`]s. The
//! order is carried as a `Vec` end to end and only turned into a JSON
//! Schema object at the serialization boundary ([`tool_schema`]), where
//! `serde_json`'s `preserve_order` map keeps properties in declaration
//! order.
//!
//! When the model emits tool calls, [`resolve_calls`] binds each call's
//! arguments against the declared parameters. Calls that name an unknown
//! tool, carry invalid JSON, or fail coercion become
//! [`MalformedToolCall`]s; they never abort the batch and are fed back to
//! the model with [`correction_prompt`].
//!
//! ```text
//! ToolCall ──▶ parse JSON ──▶ bind by declared order ──▶ coerce ──┬─▶ Valid
//!                                                                 └─▶ Malformed
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::fmt;

use crate::models::{Message, Role, ToolCall};

// ═══════════════════════════════════════════════════════════════════════
// Parameter types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    String,
    Integer,
    Float,
    Boolean,
}

impl Primitive {
    fn schema_type(&self) -> &'static str {
        match self {
            Primitive::String => "string",
            Primitive::Integer => "integer",
            Primitive::Float => "number",
            Primitive::Boolean => "boolean",
        }
    }

    fn coerce(&self, value: &Value) -> Option<ToolValue> {
        match self {
            Primitive::String => match value {
                Value::String(s) => Some(ToolValue::String(s.clone())),
                Value::Number(n) => Some(ToolValue::String(n.to_string())),
                Value::Bool(b) => Some(ToolValue::String(b.to_string())),
                _ => None,
            },
            Primitive::Integer => match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15).map(|f| f as i64))
                    .map(ToolValue::Integer),
                Value::String(s) => s.trim().parse::<i64>().ok().map(ToolValue::Integer),
                _ => None,
            },
            Primitive::Float => match value {
                Value::Number(n) => n.as_f64().map(ToolValue::Float),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(ToolValue::Float),
                _ => None,
            },
            Primitive::Boolean => match value {
                Value::Bool(b) => Some(ToolValue::Boolean(*b)),
                Value::String(s) if s.eq_ignore_ascii_case("true") => Some(ToolValue::Boolean(true)),
                Value::String(s) if s.eq_ignore_ascii_case("false") => Some(ToolValue::Boolean(false)),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    String,
    Integer,
    Float,
    Boolean,
    Array(Primitive),
}

impl DataType {
    pub fn json_schema(&self) -> Value {
        match self {
            DataType::Array(item) => json!({ "type": "array", "items": { "type": item.schema_type() } }),
            scalar => json!({ "type": scalar.type_name() }),
        }
    }

    /// Schema-level type name, used in feedback messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Integer => "integer",
            DataType::Float => "number",
            DataType::Boolean => "boolean",
            DataType::Array(_) => "array",
        }
    }

    /// Coerce a model-supplied JSON value to this type.
    ///
    /// Lenient where models commonly slip: numeric strings for numbers,
    /// `"true"`/`"false"` for booleans, a JSON array encoded as a string.
    pub fn coerce(&self, value: &Value) -> Option<ToolValue> {
        match self {
            DataType::String => Primitive::String.coerce(value),
            DataType::Integer => Primitive::Integer.coerce(value),
            DataType::Float => Primitive::Float.coerce(value),
            DataType::Boolean => Primitive::Boolean.coerce(value),
            DataType::Array(item) => {
                let parsed;
                let items = match value {
                    Value::Array(items) => items,
                    Value::String(s) => {
                        parsed = serde_json::from_str::<Value>(s).ok()?;
                        parsed.as_array()?
                    }
                    _ => return None,
                };
                items
                    .iter()
                    .map(|v| item.coerce(v))
                    .collect::<Option<Vec<_>>>()
                    .map(ToolValue::Array)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolParameter {
    pub name: String,
    pub description: String,
    pub datatype: DataType,
    pub required: bool,
}

impl ToolParameter {
    pub fn required(name: &str, description: &str, datatype: DataType) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            datatype,
            required: true,
        }
    }

    pub fn optional(name: &str, description: &str, datatype: DataType) -> Self {
        Self {
            required: false,
            ..Self::required(name, description, datatype)
        }
    }
}

/// A bound, coerced argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Array(Vec<ToolValue>),
}

impl ToolValue {
    pub fn to_json(&self) -> Value {
        match self {
            ToolValue::String(s) => Value::String(s.clone()),
            ToolValue::Integer(i) => json!(i),
            ToolValue::Float(f) => json!(f),
            ToolValue::Boolean(b) => Value::Bool(*b),
            ToolValue::Array(items) => Value::Array(items.iter().map(ToolValue::to_json).collect()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ToolValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ToolValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ToolValue::Float(f) => Some(*f),
            ToolValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ToolValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for ToolValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolValue::String(s) => f.write_str(s),
            ToolValue::Integer(i) => write!(f, "{}", i),
            ToolValue::Float(x) => write!(f, "{}", x),
            ToolValue::Boolean(b) => write!(f, "{}", b),
            ToolValue::Array(_) => write!(f, "{}", self.to_json()),
        }
    }
}

/// Arguments bound to a tool's parameters, in declaration order.
/// Optional parameters the model omitted are absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArguments {
    values: Vec<(String, ToolValue)>,
}

impl BoundArguments {
    pub fn get(&self, name: &str) -> Option<&ToolValue> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ToolValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (name, value) in &self.values {
            map.insert(name.clone(), value.to_json());
        }
        Value::Object(map)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Tool Trait
// ═══════════════════════════════════════════════════════════════════════

/// A callable capability offered to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Lowercase identifier with underscores, e.g. `"get_weather"`.
    fn name(&self) -> &str;

    /// One-line description the model uses to decide whether to call it.
    fn description(&self) -> &str;

    /// Declared parameters, in order.
    fn parameters(&self) -> &[ToolParameter];

    /// Run the tool with validated arguments. The returned value becomes
    /// the tool-result turn.
    async fn execute(&self, args: BoundArguments) -> Result<Value>;
}

type Callback = Box<dyn Fn(&BoundArguments) -> Result<Value> + Send + Sync>;

/// A tool backed by a native closure.
pub struct FnTool {
    name: String,
    description: String,
    parameters: Vec<ToolParameter>,
    callback: Callback,
}

impl FnTool {
    pub fn new<F>(name: &str, description: &str, parameters: Vec<ToolParameter>, callback: F) -> Self
    where
        F: Fn(&BoundArguments) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &[ToolParameter] {
        &self.parameters
    }

    async fn execute(&self, args: BoundArguments) -> Result<Value> {
        (self.callback)(&args)
    }
}

/// OpenAI function-calling schema. Properties and `required` follow
/// declaration order.
pub fn tool_schema(tool: &dyn Tool) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in tool.parameters() {
        let mut schema = param.datatype.json_schema();
        if let Some(obj) = schema.as_object_mut() {
            obj.insert("description".to_string(), Value::String(param.description.clone()));
        }
        properties.insert(param.name.clone(), schema);
        if param.required {
            required.push(Value::String(param.name.clone()));
        }
    }

    json!({
        "type": "function",
        "function": {
            "name": tool.name(),
            "description": tool.description(),
            "parameters": {
                "type": "object",
                "properties": Value::Object(properties),
                "required": required,
            }
        }
    })
}

/// Bind a JSON argument value to declared parameters.
///
/// Objects bind by name. Arrays bind by position, matching the declared
/// order. `null` counts as missing. Keys the tool does not declare are
/// ignored.
pub fn bind_arguments(parameters: &[ToolParameter], args: &Value) -> Result<BoundArguments, String> {
    match args {
        Value::Object(_) | Value::Array(_) => {}
        Value::Null if parameters.iter().all(|p| !p.required) => {}
        other => {
            return Err(format!(
                "arguments must be a JSON object, got {}",
                json_type_name(other)
            ))
        }
    }

    let mut bound = BoundArguments::default();
    for (i, param) in parameters.iter().enumerate() {
        match lookup(args, i, &param.name) {
            None if param.required => {
                return Err(format!("missing required parameter '{}'", param.name));
            }
            None => {}
            Some(raw) => match param.datatype.coerce(raw) {
                Some(value) => bound.values.push((param.name.clone(), value)),
                None => {
                    return Err(format!(
                        "parameter '{}' must be of type '{}', got {}",
                        param.name,
                        param.datatype.type_name(),
                        raw
                    ));
                }
            },
        }
    }
    Ok(bound)
}

fn lookup<'a>(args: &'a Value, position: usize, name: &str) -> Option<&'a Value> {
    let value = match args {
        Value::Object(map) => map.get(name),
        Value::Array(items) => items.get(position),
        _ => None,
    };
    value.filter(|v| !v.is_null())
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Schemas for every registered tool, in registration order.
    pub fn schemas(&self) -> Vec<Value> {
        self.tools.iter().map(|t| tool_schema(t.as_ref())).collect()
    }

    /// Execute a resolved call and wrap the result as a `tool` turn.
    ///
    /// Tool failures become an `{"error": ...}` result rather than an
    /// error, so the turn continues.
    pub async fn execute(&self, call: &ToolCall, args: BoundArguments) -> Message {
        let content = match self.find(&call.name) {
            Some(tool) => match tool.execute(args).await {
                Ok(Value::String(s)) => s,
                Ok(value) => value.to_string(),
                Err(e) => {
                    tracing::warn!(tool = %call.name, error = %e, "tool execution failed");
                    json!({ "error": e.to_string() }).to_string()
                }
            },
            None => json!({ "error": format!("unknown tool '{}'", call.name) }).to_string(),
        };

        let mut message = Message::ended(Role::Tool, content);
        message.tool_call_id = Some(call.id.clone());
        message
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Resolution
// ═══════════════════════════════════════════════════════════════════════

/// A call the model got wrong.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedToolCall {
    /// Zero-based position of the call in the model's response.
    pub index: usize,
    pub tool_name: Option<String>,
    /// Argument text exactly as the model produced it.
    pub raw_arguments: String,
    pub reason: String,
}

impl MalformedToolCall {
    pub fn feedback(&self) -> String {
        let tool = self
            .tool_name
            .as_deref()
            .map(|n| format!("'{}'", n))
            .unwrap_or_else(|| "(unnamed tool)".to_string());
        format!(
            "Tool call #{} to {} was malformed: {}. Arguments received: {}",
            self.index, tool, self.reason, self.raw_arguments
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Valid {
        index: usize,
        call: ToolCall,
        args: BoundArguments,
    },
    Malformed(MalformedToolCall),
}

/// Resolve every call independently; malformed calls do not affect the others.
pub fn resolve_calls(calls: &[ToolCall], registry: &ToolRegistry) -> Vec<Resolution> {
    calls
        .iter()
        .enumerate()
        .map(|(index, call)| {
            let malformed = |reason: String| {
                Resolution::Malformed(MalformedToolCall {
                    index,
                    tool_name: Some(call.name.clone()).filter(|n| !n.is_empty()),
                    raw_arguments: call.arguments.clone(),
                    reason,
                })
            };

            let Some(tool) = registry.find(&call.name) else {
                return malformed(format!("unknown tool '{}'", call.name));
            };

            let raw = call.arguments.trim();
            let parsed = if raw.is_empty() {
                Value::Object(Map::new())
            } else {
                match serde_json::from_str::<Value>(raw) {
                    Ok(v) => v,
                    Err(e) => return malformed(format!("arguments are not valid JSON ({})", e)),
                }
            };

            match bind_arguments(tool.parameters(), &parsed) {
                Ok(args) => Resolution::Valid {
                    index,
                    call: call.clone(),
                    args,
                },
                Err(reason) => malformed(reason),
            }
        })
        .collect()
}

/// Feedback turn asking the model to retry its malformed calls.
pub fn correction_prompt(malformed: &[MalformedToolCall]) -> String {
    let mut prompt = String::from("Some of your tool calls could not be executed:\n");
    for call in malformed {
        prompt.push_str("- ");
        prompt.push_str(&call.feedback());
        prompt.push('\n');
    }
    prompt.push_str(
        "Retry these calls with corrected JSON arguments that match the declared parameter names and types.",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weather_tool() -> FnTool {
        FnTool::new(
            "get_weather",
            "Current weather for a city",
            vec![
                ToolParameter::required("city", "City name", DataType::String),
                ToolParameter::required("days", "Forecast days", DataType::Integer),
                ToolParameter::optional("metric", "Use metric units", DataType::Boolean),
            ],
            |args| {
                Ok(json!({
                    "city": args.get("city").and_then(|v| v.as_str()),
                    "days": args.get("days").and_then(|v| v.as_i64()),
                }))
            },
        )
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(weather_tool()));
        registry
    }

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: format!("call_{}", name),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    #[test]
    fn schema_preserves_declaration_order() {
        let mut params = Vec::new();
        // Names that would sort differently than declared.
        for name in ["zeta", "alpha", "mike", "bravo"] {
            params.push(ToolParameter::required(name, name, DataType::String));
        }
        let tool = FnTool::new("ordered", "d", params, |_| Ok(Value::Null));
        let schema = tool_schema(&tool);

        let props: Vec<&String> = schema["function"]["parameters"]["properties"]
            .as_object()
            .unwrap()
            .keys()
            .collect();
        assert_eq!(props, vec!["zeta", "alpha", "mike", "bravo"]);
        assert_eq!(
            schema["function"]["parameters"]["required"],
            json!(["zeta", "alpha", "mike", "bravo"])
        );
    }

    #[test]
    fn schema_types() {
        assert_eq!(DataType::Float.json_schema(), json!({"type": "number"}));
        assert_eq!(
            DataType::Array(Primitive::Integer).json_schema(),
            json!({"type": "array", "items": {"type": "integer"}})
        );
    }

    #[test]
    fn schema_then_bind_round_trips_every_datatype() {
        let cases: Vec<(DataType, ToolValue, &str)> = vec![
            (DataType::String, ToolValue::String("Oslo".into()), "Oslo"),
            (DataType::Integer, ToolValue::Integer(-42), "-42"),
            (DataType::Float, ToolValue::Float(2.5), "2.5"),
            (DataType::Boolean, ToolValue::Boolean(true), "true"),
            (
                DataType::Array(Primitive::String),
                ToolValue::Array(vec![ToolValue::String("a".into()), ToolValue::String("b".into())]),
                r#"["a","b"]"#,
            ),
            (
                DataType::Array(Primitive::Integer),
                ToolValue::Array(vec![ToolValue::Integer(1), ToolValue::Integer(2)]),
                "[1,2]",
            ),
            (
                DataType::Array(Primitive::Float),
                ToolValue::Array(vec![ToolValue::Float(0.5), ToolValue::Float(1.25)]),
                "[0.5,1.25]",
            ),
            (
                DataType::Array(Primitive::Boolean),
                ToolValue::Array(vec![ToolValue::Boolean(false), ToolValue::Boolean(true)]),
                "[false,true]",
            ),
        ];

        let params: Vec<ToolParameter> = cases
            .iter()
            .enumerate()
            .map(|(i, (dt, _, _))| ToolParameter::required(&format!("p{}", i), "", *dt))
            .collect();
        let tool = FnTool::new("all_types", "d", params.clone(), |_| Ok(Value::Null));

        // Build a well-formed argument object from the generated schema.
        let schema = tool_schema(&tool);
        let mut args = Map::new();
        for (name, (_, value, _)) in schema["function"]["parameters"]["properties"]
            .as_object()
            .unwrap()
            .keys()
            .zip(cases.iter())
        {
            args.insert(name.clone(), value.to_json());
        }

        let bound = bind_arguments(&params, &Value::Object(args)).unwrap();
        assert_eq!(bound.len(), cases.len());
        for ((name, value), (_, expected, text)) in bound.iter().zip(cases.iter()) {
            assert_eq!(value, expected, "parameter {}", name);
            assert_eq!(value.to_string(), *text, "parameter {}", name);
        }
    }

    #[test]
    fn positional_arguments_bind_by_declared_order() {
        let tool = weather_tool();
        let bound = bind_arguments(tool.parameters(), &json!(["Bergen", 3])).unwrap();
        assert_eq!(bound.get("city"), Some(&ToolValue::String("Bergen".into())));
        assert_eq!(bound.get("days"), Some(&ToolValue::Integer(3)));
        assert_eq!(bound.get("metric"), None);
    }

    #[test]
    fn lenient_coercions() {
        assert_eq!(DataType::Integer.coerce(&json!("7")), Some(ToolValue::Integer(7)));
        assert_eq!(DataType::Integer.coerce(&json!(7.0)), Some(ToolValue::Integer(7)));
        assert_eq!(DataType::Integer.coerce(&json!(7.5)), None);
        assert_eq!(DataType::Boolean.coerce(&json!("TRUE")), Some(ToolValue::Boolean(true)));
        assert_eq!(
            DataType::Array(Primitive::Integer).coerce(&json!("[1, 2]")),
            Some(ToolValue::Array(vec![ToolValue::Integer(1), ToolValue::Integer(2)]))
        );
        assert_eq!(DataType::String.coerce(&json!({"a": 1})), None);
    }

    #[test]
    fn non_numeric_integer_is_malformed() {
        let calls = vec![call("get_weather", r#"{"city":"Oslo","days":"abc"}"#)];
        let resolved = resolve_calls(&calls, &registry());

        let Resolution::Malformed(bad) = &resolved[0] else {
            panic!("expected malformed call");
        };
        assert_eq!(bad.index, 0);
        assert_eq!(bad.tool_name.as_deref(), Some("get_weather"));

        let feedback = bad.feedback();
        assert!(feedback.contains("#0"));
        assert!(feedback.contains("get_weather"));
        assert!(feedback.contains(r#"{"city":"Oslo","days":"abc"}"#));
        assert!(feedback.contains("days"));
    }

    #[test]
    fn malformed_calls_do_not_abort_batch() {
        let calls = vec![
            call("get_weather", "{not json"),
            call("get_weather", r#"{"city":"Oslo","days":2}"#),
            call("launch_rockets", "{}"),
            call("get_weather", r#"{"days":2}"#),
        ];
        let resolved = resolve_calls(&calls, &registry());
        assert_eq!(resolved.len(), 4);
        assert!(matches!(&resolved[0], Resolution::Malformed(m) if m.reason.contains("not valid JSON")));
        assert!(matches!(&resolved[1], Resolution::Valid { index: 1, .. }));
        assert!(matches!(&resolved[2], Resolution::Malformed(m) if m.reason.contains("unknown tool")));
        assert!(matches!(&resolved[3], Resolution::Malformed(m) if m.reason.contains("missing required parameter 'city'")));

        let malformed: Vec<MalformedToolCall> = resolved
            .into_iter()
            .filter_map(|r| match r {
                Resolution::Malformed(m) => Some(m),
                _ => None,
            })
            .collect();
        let prompt = correction_prompt(&malformed);
        assert!(prompt.contains("Tool call #0"));
        assert!(prompt.contains("Tool call #2"));
        assert!(prompt.contains("Tool call #3"));
    }

    #[tokio::test]
    async fn execution_produces_tool_turn() {
        let registry = registry();
        let calls = vec![call("get_weather", r#"{"city":"Oslo","days":"2"}"#)];
        let Resolution::Valid { call, args, .. } = resolve_calls(&calls, &registry).remove(0) else {
            panic!("expected valid call");
        };

        let message = registry.execute(&call, args).await;
        assert_eq!(message.role, Role::Tool);
        assert_eq!(message.tool_call_id.as_deref(), Some("call_get_weather"));
        let body: Value = serde_json::from_str(&message.text).unwrap();
        assert_eq!(body, json!({"city": "Oslo", "days": 2}));
    }

    #[tokio::test]
    async fn failing_tool_reports_error_result() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(FnTool::new("boom", "fails", vec![], |_| {
            anyhow::bail!("disk full")
        })));
        let message = registry
            .execute(&call("boom", "{}"), BoundArguments::default())
            .await;
        assert!(message.text.contains("disk full"));
    }
}
