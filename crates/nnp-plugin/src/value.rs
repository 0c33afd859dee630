//! Values crossing the host/script boundary.
//!
//! Every capability receives its arguments as [`ScriptValue`]s and returns
//! one. Anything outside this closed set (userdata, coroutines) is rejected
//! at the boundary instead of leaking into host code.

use std::collections::{BTreeMap, HashMap};

use mlua::{FromLua, Function, IntoLua, Lua, Value};

use crate::error::PluginError;

/// Deepest table nesting accepted from a script.
const MAX_TABLE_DEPTH: usize = 32;

/// A value passed between host and script.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ScriptValue {
    #[default]
    Absent,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    /// A script string that is not valid UTF-8.
    Bytes(Vec<u8>),
    Table(ScriptTable),
    Callable(Function),
}

/// A script table split into its sequence part and its keyed part.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScriptTable {
    pub array: Vec<ScriptValue>,
    pub fields: BTreeMap<String, ScriptValue>,
}

// ─── ScriptValue ────────────────────────────────────────────────────

impl ScriptValue {
    /// Script-side type name, used in argument errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Absent => "nil",
            ScriptValue::Boolean(_) => "boolean",
            ScriptValue::Integer(_) | ScriptValue::Number(_) => "number",
            ScriptValue::String(_) | ScriptValue::Bytes(_) => "string",
            ScriptValue::Table(_) => "table",
            ScriptValue::Callable(_) => "function",
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, ScriptValue::Absent)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// String form of strings and numbers, as the script would coerce them.
    pub fn coerce_string(&self) -> Option<String> {
        match self {
            ScriptValue::String(s) => Some(s.clone()),
            ScriptValue::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            ScriptValue::Integer(i) => Some(i.to_string()),
            ScriptValue::Number(n) => Some(number_to_string(*n)),
            _ => None,
        }
    }

    /// Raw bytes of strings, and of numbers in their string form.
    pub fn coerce_bytes(&self) -> Option<Vec<u8>> {
        match self {
            ScriptValue::Bytes(b) => Some(b.clone()),
            other => other.coerce_string().map(String::into_bytes),
        }
    }

    fn from_lua_value(value: Value, depth: usize) -> mlua::Result<Self> {
        match value {
            Value::Nil => Ok(ScriptValue::Absent),
            Value::Boolean(b) => Ok(ScriptValue::Boolean(b)),
            Value::Integer(i) => Ok(ScriptValue::Integer(i)),
            Value::Number(n) => Ok(ScriptValue::Number(n)),
            Value::String(s) => Ok(ScriptValue::from(s.as_bytes().to_vec())),
            Value::Table(t) => Ok(ScriptValue::Table(ScriptTable::from_lua_table(t, depth)?)),
            Value::Function(f) => Ok(ScriptValue::Callable(f)),
            other => Err(mlua::Error::external(PluginError::InvalidArgument(format!(
                "unsupported value of type {}",
                other.type_name()
            )))),
        }
    }
}

/// Integral numbers print without a fractional part, like Lua integers.
fn number_to_string(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 9.0e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl FromLua for ScriptValue {
    fn from_lua(value: Value, _lua: &Lua) -> mlua::Result<Self> {
        ScriptValue::from_lua_value(value, 0)
    }
}

impl IntoLua for ScriptValue {
    fn into_lua(self, lua: &Lua) -> mlua::Result<Value> {
        match self {
            ScriptValue::Absent => Ok(Value::Nil),
            ScriptValue::Boolean(b) => Ok(Value::Boolean(b)),
            ScriptValue::Integer(i) => Ok(Value::Integer(i)),
            ScriptValue::Number(n) => {
                if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
                    Ok(Value::Integer(n as i64))
                } else {
                    Ok(Value::Number(n))
                }
            }
            ScriptValue::String(s) => Ok(Value::String(lua.create_string(&s)?)),
            ScriptValue::Bytes(b) => Ok(Value::String(lua.create_string(&b)?)),
            ScriptValue::Table(t) => t.into_lua(lua),
            ScriptValue::Callable(f) => Ok(Value::Function(f)),
        }
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Boolean(b)
    }
}

impl From<i64> for ScriptValue {
    fn from(i: i64) -> Self {
        ScriptValue::Integer(i)
    }
}

impl From<f64> for ScriptValue {
    fn from(n: f64) -> Self {
        ScriptValue::Number(n)
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::String(s.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        ScriptValue::String(s)
    }
}

impl From<Option<String>> for ScriptValue {
    fn from(s: Option<String>) -> Self {
        s.map_or(ScriptValue::Absent, ScriptValue::String)
    }
}

impl From<Vec<u8>> for ScriptValue {
    fn from(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => ScriptValue::String(text),
            Err(e) => ScriptValue::Bytes(e.into_bytes()),
        }
    }
}

impl From<ScriptTable> for ScriptValue {
    fn from(t: ScriptTable) -> Self {
        ScriptValue::Table(t)
    }
}

// ─── ScriptTable ────────────────────────────────────────────────────

impl ScriptTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sequence of strings.
    pub fn from_strings<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            array: items
                .into_iter()
                .map(|s| ScriptValue::String(s.into()))
                .collect(),
            fields: BTreeMap::new(),
        }
    }

    /// A keyed table of strings.
    pub fn from_string_map(map: &HashMap<String, String>) -> Self {
        Self {
            array: Vec::new(),
            fields: map
                .iter()
                .map(|(k, v)| (k.clone(), ScriptValue::String(v.clone())))
                .collect(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<ScriptValue>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&ScriptValue> {
        self.fields.get(key)
    }

    pub fn string_field(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(ScriptValue::as_str)
    }

    pub fn callable_field(&self, key: &str) -> Option<&Function> {
        match self.field(key) {
            Some(ScriptValue::Callable(f)) => Some(f),
            _ => None,
        }
    }

    /// Keyed entries with a string form. Tables, functions and booleans
    /// are dropped; sequence entries are ignored.
    pub fn to_string_map(&self) -> HashMap<String, String> {
        self.fields
            .iter()
            .filter_map(|(k, v)| v.coerce_string().map(|s| (k.clone(), s)))
            .collect()
    }

    fn from_lua_table(table: mlua::Table, depth: usize) -> mlua::Result<Self> {
        if depth >= MAX_TABLE_DEPTH {
            return Err(mlua::Error::external(PluginError::InvalidArgument(format!(
                "table nesting deeper than {MAX_TABLE_DEPTH}"
            ))));
        }

        let len = table.raw_len();
        let mut array = vec![ScriptValue::Absent; len];
        let mut fields = BTreeMap::new();

        for pair in table.pairs::<Value, Value>() {
            let (key, value) = pair?;
            let value = ScriptValue::from_lua_value(value, depth + 1)?;
            match key {
                Value::Integer(i) if i >= 1 && (i as usize) <= len => {
                    array[i as usize - 1] = value;
                }
                Value::String(s) => {
                    fields.insert(s.to_string_lossy(), value);
                }
                Value::Integer(i) => {
                    fields.insert(i.to_string(), value);
                }
                Value::Number(n) => {
                    fields.insert(number_to_string(n), value);
                }
                Value::Boolean(b) => {
                    fields.insert(b.to_string(), value);
                }
                other => {
                    tracing::debug!(key_type = other.type_name(), "dropping table key");
                }
            }
        }

        Ok(Self { array, fields })
    }
}

impl FromLua for ScriptTable {
    fn from_lua(value: Value, _lua: &Lua) -> mlua::Result<Self> {
        match value {
            Value::Table(t) => ScriptTable::from_lua_table(t, 0),
            other => Err(mlua::Error::external(PluginError::InvalidArgument(format!(
                "expected table, got {}",
                other.type_name()
            )))),
        }
    }
}

impl IntoLua for ScriptTable {
    fn into_lua(self, lua: &Lua) -> mlua::Result<Value> {
        let table = lua.create_table_with_capacity(self.array.len(), self.fields.len())?;
        for (i, value) in self.array.into_iter().enumerate() {
            table.raw_set(i + 1, value)?;
        }
        for (key, value) in self.fields {
            table.raw_set(key, value)?;
        }
        Ok(Value::Table(table))
    }
}

// ─── Argument validation ────────────────────────────────────────────

/// Positional arguments of one capability call.
///
/// Accessors take 1-based positions and a short description used in the
/// error message, e.g. `fs.read: argument #1 (path) expected string, got nil`.
#[derive(Debug)]
pub struct Arguments {
    function: &'static str,
    values: Vec<ScriptValue>,
}

impl Arguments {
    pub fn new(function: &'static str, values: Vec<ScriptValue>) -> Self {
        Self { function, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Argument at position `n`; `None` when it was not passed.
    pub fn get(&self, n: usize) -> Option<&ScriptValue> {
        n.checked_sub(1).and_then(|i| self.values.get(i))
    }

    fn is_absent(&self, n: usize) -> bool {
        self.get(n).map_or(true, ScriptValue::is_absent)
    }

    /// The `InvalidArgument` error for a wrong type at position `n`.
    pub fn mismatch(&self, n: usize, what: &str, expected: &str) -> PluginError {
        let got = self.get(n).map_or("nil", ScriptValue::type_name);
        PluginError::InvalidArgument(format!(
            "{}: argument #{n} ({what}) expected {expected}, got {got}",
            self.function
        ))
    }

    /// Required string. Numbers are accepted in their string form.
    pub fn string(&self, n: usize, what: &str) -> Result<String, PluginError> {
        self.get(n)
            .and_then(ScriptValue::coerce_string)
            .ok_or_else(|| self.mismatch(n, what, "string"))
    }

    /// Required string as raw bytes, unchanged from the script.
    pub fn bytes(&self, n: usize, what: &str) -> Result<Vec<u8>, PluginError> {
        self.get(n)
            .and_then(ScriptValue::coerce_bytes)
            .ok_or_else(|| self.mismatch(n, what, "string"))
    }

    pub fn opt_string(&self, n: usize, what: &str) -> Result<Option<String>, PluginError> {
        if self.is_absent(n) {
            return Ok(None);
        }
        self.string(n, what).map(Some)
    }

    pub fn table(&self, n: usize, what: &str) -> Result<&ScriptTable, PluginError> {
        match self.get(n) {
            Some(ScriptValue::Table(t)) => Ok(t),
            _ => Err(self.mismatch(n, what, "table")),
        }
    }

    pub fn callable(&self, n: usize, what: &str) -> Result<Function, PluginError> {
        match self.get(n) {
            Some(ScriptValue::Callable(f)) => Ok(f.clone()),
            _ => Err(self.mismatch(n, what, "function")),
        }
    }

    pub fn opt_integer(&self, n: usize, what: &str) -> Result<Option<i64>, PluginError> {
        match self.get(n) {
            None | Some(ScriptValue::Absent) => Ok(None),
            Some(ScriptValue::Integer(i)) => Ok(Some(*i)),
            Some(ScriptValue::Number(v)) if v.fract() == 0.0 => Ok(Some(*v as i64)),
            _ => Err(self.mismatch(n, what, "integer")),
        }
    }

    /// All arguments from position `n` on, in string form.
    ///
    /// Booleans become `"true"`/`"false"`; other non-string values become `""`.
    pub fn strings_from(&self, n: usize) -> Vec<String> {
        self.values
            .iter()
            .skip(n.saturating_sub(1))
            .map(|v| match v {
                ScriptValue::Boolean(b) => b.to_string(),
                other => other.coerce_string().unwrap_or_default(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(lua: &Lua, src: &str) -> ScriptValue {
        lua.load(src).eval::<ScriptValue>().unwrap()
    }

    // ── Lua → ScriptValue ───────────────────────────────────────────

    #[test]
    fn test_scalars_from_lua() {
        let lua = Lua::new();
        assert_eq!(eval(&lua, "return nil"), ScriptValue::Absent);
        assert_eq!(eval(&lua, "return true"), ScriptValue::Boolean(true));
        assert_eq!(eval(&lua, "return 42"), ScriptValue::Integer(42));
        assert_eq!(eval(&lua, "return 1.5"), ScriptValue::Number(1.5));
        assert_eq!(eval(&lua, "return 'hi'"), ScriptValue::from("hi"));
    }

    #[test]
    fn test_large_integer_keeps_precision() {
        let lua = Lua::new();
        let value = eval(&lua, "return 9007199254740993");
        assert_eq!(value, ScriptValue::Integer(9_007_199_254_740_993));
        assert_eq!(value.coerce_string().as_deref(), Some("9007199254740993"));

        let f: Function = lua
            .load("return function(v) return v - 9007199254740992 end")
            .eval()
            .unwrap();
        assert_eq!(f.call::<i64>(value).unwrap(), 1);
    }

    #[test]
    fn test_non_utf8_string_kept_as_bytes() {
        let lua = Lua::new();
        let value = eval(&lua, r#"return "\255\0\1""#);
        assert_eq!(value, ScriptValue::Bytes(vec![255, 0, 1]));
        assert_eq!(value.type_name(), "string");
        assert_eq!(value.coerce_bytes(), Some(vec![255, 0, 1]));

        let f: Function = lua
            .load(r#"return function(s) return s == "\255\0\1" end"#)
            .eval()
            .unwrap();
        assert!(f.call::<bool>(value).unwrap());
    }

    #[test]
    fn test_table_from_lua_splits_array_and_fields() {
        let lua = Lua::new();
        let value = eval(&lua, "return { 'a', 'b', name = 'x', [10] = 'y' }");
        let ScriptValue::Table(t) = value else {
            panic!("expected table, got {value:?}");
        };
        assert_eq!(t.array, vec![ScriptValue::from("a"), ScriptValue::from("b")]);
        assert_eq!(t.string_field("name"), Some("x"));
        assert_eq!(t.string_field("10"), Some("y"));
    }

    #[test]
    fn test_function_from_lua_is_callable() {
        let lua = Lua::new();
        let value = eval(&lua, "return function(x) return x * 2 end");
        let ScriptValue::Callable(f) = value else {
            panic!("expected function, got {value:?}");
        };
        assert_eq!(f.call::<i64>(21).unwrap(), 42);
    }

    #[test]
    fn test_coroutine_rejected() {
        let lua = Lua::new();
        let result = lua
            .load("return coroutine.create(function() end)")
            .eval::<ScriptValue>();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("unsupported value of type thread"));
    }

    #[test]
    fn test_deep_nesting_rejected() {
        let lua = Lua::new();
        let result = lua
            .load("local t = {} for _ = 1, 40 do t = { t } end return t")
            .eval::<ScriptValue>();
        assert!(result.unwrap_err().to_string().contains("nesting"));
    }

    // ── ScriptValue → Lua ───────────────────────────────────────────

    #[test]
    fn test_integral_numbers_become_integers() {
        let lua = Lua::new();
        let f: Function = lua.load("return function(v) return math.type(v) end").eval().unwrap();
        assert_eq!(f.call::<String>(ScriptValue::Number(3.0)).unwrap(), "integer");
        assert_eq!(f.call::<String>(ScriptValue::Number(3.5)).unwrap(), "float");
    }

    #[test]
    fn test_table_into_lua() {
        let lua = Lua::new();
        let table = ScriptTable::from_strings(["x", "y"]).with_field("name", "demo");
        let f: Function = lua
            .load("return function(t) return #t .. ':' .. t[2] .. ':' .. t.name end")
            .eval()
            .unwrap();
        assert_eq!(f.call::<String>(table).unwrap(), "2:y:demo");
    }

    // ── ScriptTable helpers ─────────────────────────────────────────

    #[test]
    fn test_to_string_map_coerces_numbers() {
        let table = ScriptTable::new()
            .with_field("a", "1")
            .with_field("b", 2.0)
            .with_field("c", true)
            .with_field("d", ScriptTable::new())
            .with_field("e", 9_007_199_254_740_993i64);
        let map = table.to_string_map();
        assert_eq!(map.len(), 3);
        assert_eq!(map["a"], "1");
        assert_eq!(map["b"], "2");
        assert_eq!(map["e"], "9007199254740993");
    }

    #[test]
    fn test_from_string_map() {
        let mut map = HashMap::new();
        map.insert("theme".to_string(), "dark".to_string());
        let table = ScriptTable::from_string_map(&map);
        assert_eq!(table.string_field("theme"), Some("dark"));
        assert!(table.array.is_empty());
    }

    // ── Arguments ───────────────────────────────────────────────────

    #[test]
    fn test_arguments_string() {
        let args = Arguments::new("fs.read", vec!["a.txt".into(), ScriptValue::Number(7.0)]);
        assert_eq!(args.string(1, "path").unwrap(), "a.txt");
        assert_eq!(args.string(2, "n").unwrap(), "7");
    }

    #[test]
    fn test_arguments_bytes() {
        let args = Arguments::new(
            "fs.write",
            vec![vec![0xffu8, b'a'].into(), "caf\u{e9}".into(), 12i64.into()],
        );
        assert_eq!(args.bytes(1, "contents").unwrap(), vec![0xff, b'a']);
        assert_eq!(args.bytes(2, "contents").unwrap(), "caf\u{e9}".as_bytes());
        assert_eq!(args.bytes(3, "contents").unwrap(), b"12");
        assert!(args.bytes(4, "contents").is_err());
    }

    #[test]
    fn test_arguments_missing_string_message() {
        let args = Arguments::new("fs.read", vec![]);
        let err = args.string(1, "path").unwrap_err();
        assert!(matches!(err, PluginError::InvalidArgument(_)));
        assert_eq!(
            err.to_string(),
            "invalid argument: fs.read: argument #1 (path) expected string, got nil"
        );
    }

    #[test]
    fn test_arguments_optional_values() {
        let args = Arguments::new("ui.select", vec![ScriptTable::new().into()]);
        assert!(args.table(1, "items").is_ok());
        assert_eq!(args.opt_integer(2, "default").unwrap(), None);
        assert_eq!(args.opt_string(3, "label").unwrap(), None);

        let args = Arguments::new("ui.select", vec![ScriptTable::new().into(), 3i64.into()]);
        assert_eq!(args.opt_integer(2, "default").unwrap(), Some(3));

        let args = Arguments::new("ui.select", vec![ScriptTable::new().into(), 1.5.into()]);
        assert!(args.opt_integer(2, "default").is_err());
    }

    #[test]
    fn test_arguments_callable_mismatch() {
        let args = Arguments::new("plugin.on", vec!["ready".into(), "oops".into()]);
        let err = args.callable(2, "handler").unwrap_err();
        assert!(err.to_string().contains("expected function, got string"));
    }

    #[test]
    fn test_arguments_strings_from() {
        let args = Arguments::new(
            "plugin.call",
            vec![
                "other".into(),
                "fn".into(),
                "x".into(),
                ScriptValue::Number(2.0),
                true.into(),
                ScriptValue::Absent,
            ],
        );
        assert_eq!(args.strings_from(3), vec!["x", "2", "true", ""]);
        assert_eq!(args.len(), 6);
    }
}
