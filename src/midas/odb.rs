//! Access to the MIDAS Online DataBase
//!
//! The ODB is a tree of typed keys. Values cross this interface as
//! [`serde_json::Value`], in the same shape the `mhttpd` JSON-RPC API uses: numbers
//! for numeric keys, booleans for `TID_BOOL`, strings for `TID_STRING`, arrays for
//! array keys and objects for directories.
//!
//! Paths are `/`-separated and may end with an element index, e.g.
//! `/Equipment/EPICS/Variables/Measured[3]`.

use std::{fmt::Display, io};

use serde_json::Value;
use thiserror::Error;

/// MIDAS status: success
pub const SUCCESS: i64 = 1;
/// MIDAS status: key already exists
pub const DB_KEY_EXIST: i64 = 311;
/// MIDAS status: key not found
pub const DB_NO_KEY: i64 = 312;

/// MIDAS key data types
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Tid {
    Byte = 1,
    SByte = 2,
    Char = 3,
    Word = 4,
    Short = 5,
    DWord = 6,
    Int = 7,
    Bool = 8,
    Float = 9,
    Double = 10,
    Bitfield = 11,
    String = 12,
    Array = 13,
    Struct = 14,
    Key = 15,
    Link = 16,
    Int64 = 17,
    UInt64 = 18,
}

impl TryFrom<u32> for Tid {
    type Error = u32;
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Tid::Byte,
            2 => Tid::SByte,
            3 => Tid::Char,
            4 => Tid::Word,
            5 => Tid::Short,
            6 => Tid::DWord,
            7 => Tid::Int,
            8 => Tid::Bool,
            9 => Tid::Float,
            10 => Tid::Double,
            11 => Tid::Bitfield,
            12 => Tid::String,
            13 => Tid::Array,
            14 => Tid::Struct,
            15 => Tid::Key,
            16 => Tid::Link,
            17 => Tid::Int64,
            18 => Tid::UInt64,
            other => return Err(other),
        })
    }
}

impl Tid {
    /// Size in bytes of one element, or 0 for variable-sized types
    pub fn size(&self) -> usize {
        match self {
            Tid::Byte | Tid::SByte | Tid::Char => 1,
            Tid::Word | Tid::Short => 2,
            Tid::DWord | Tid::Int | Tid::Bool | Tid::Float | Tid::Bitfield => 4,
            Tid::Double | Tid::Int64 | Tid::UInt64 => 8,
            Tid::String | Tid::Array | Tid::Struct | Tid::Key | Tid::Link => 0,
        }
    }

    /// The value a freshly created element of this type holds
    pub fn default_value(&self) -> Value {
        match self {
            Tid::Bool => Value::Bool(false),
            Tid::String | Tid::Link => Value::String(String::new()),
            Tid::Float | Tid::Double => Value::from(0.0),
            Tid::Key => Value::Object(Default::default()),
            _ => Value::from(0),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Tid::Byte => "BYTE",
            Tid::SByte => "SBYTE",
            Tid::Char => "CHAR",
            Tid::Word => "WORD",
            Tid::Short => "SHORT",
            Tid::DWord => "DWORD",
            Tid::Int => "INT",
            Tid::Bool => "BOOL",
            Tid::Float => "FLOAT",
            Tid::Double => "DOUBLE",
            Tid::Bitfield => "BITFIELD",
            Tid::String => "STRING",
            Tid::Array => "ARRAY",
            Tid::Struct => "STRUCT",
            Tid::Key => "KEY",
            Tid::Link => "LINK",
            Tid::Int64 => "INT64",
            Tid::UInt64 => "UINT64",
        }
    }
}

impl Display for Tid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Message log categories
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageType {
    /// `MT_ERROR`
    Error = 1,
}

#[derive(Error, Debug)]
pub enum OdbError {
    #[error("ODB key {0} not found")]
    NoKey(String),
    #[error("ODB key {path} is not a {expected}")]
    TypeMismatch { path: String, expected: &'static str },
    #[error("Invalid ODB path: {0}")]
    InvalidPath(String),
    #[error("{method} on {path} failed with MIDAS status {status}")]
    Status {
        method: &'static str,
        path: String,
        status: i64,
    },
    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Split an optional trailing `[index]` from an ODB path
pub fn split_index(path: &str) -> Result<(&str, Option<usize>), OdbError> {
    match path.strip_suffix(']').and_then(|p| p.rsplit_once('[')) {
        None => Ok((path, None)),
        Some((base, index)) => index
            .trim()
            .parse()
            .map(|i| (base, Some(i)))
            .map_err(|_| OdbError::InvalidPath(path.to_owned())),
    }
}

/// Interpret an ODB value as a float, as mhttpd encodes them
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => match s.as_str() {
            "NaN" => Some(f64::NAN),
            "Infinity" => Some(f64::INFINITY),
            "-Infinity" => Some(f64::NEG_INFINITY),
            s => match s.strip_prefix("0x") {
                Some(hex) => i64::from_str_radix(hex, 16).ok().map(|v| v as f64),
                None => s.trim().parse().ok(),
            },
        },
        _ => None,
    }
}

/// Encode a float the way mhttpd does, spelling out non-finite values
pub fn float_to_value(value: f64) -> Value {
    if value.is_nan() {
        Value::from("NaN")
    } else if value.is_infinite() {
        Value::from(if value > 0.0 { "Infinity" } else { "-Infinity" })
    } else {
        Value::from(value)
    }
}

/// Interpret an ODB value as a BOOL
pub fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => match s.as_str() {
            "y" | "Y" | "yes" | "true" | "1" => Some(true),
            "n" | "N" | "no" | "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_array<'a>(path: &str, value: &'a Value) -> Result<&'a [Value], OdbError> {
    let items = match value {
        Value::Array(items) => items.as_slice(),
        // Single-element arrays are indistinguishable from scalars
        scalar => std::slice::from_ref(scalar),
    };
    if items.iter().any(Value::is_object) {
        return Err(OdbError::TypeMismatch {
            path: path.to_owned(),
            expected: "array",
        });
    }
    Ok(items)
}

/// Client access to an ODB
///
/// The methods mirror the `mhttpd` JSON-RPC calls they are implemented with.
#[allow(async_fn_in_trait)]
pub trait Odb {
    /// Read a key or directory. Missing keys are [`OdbError::NoKey`].
    async fn get(&self, path: &str) -> Result<Value, OdbError>;

    /// Write an existing key, or one element of it
    async fn set(&self, path: &str, value: Value) -> Result<(), OdbError>;

    /// Create a key, and any missing parent directories
    ///
    /// Creating a key that already exists is not an error.
    async fn create(
        &self,
        path: &str,
        tid: Tid,
        array_length: usize,
        string_length: usize,
    ) -> Result<(), OdbError>;

    /// Change the number of elements of an array key
    async fn resize(&self, path: &str, new_length: usize) -> Result<(), OdbError>;

    /// Send a message to the MIDAS message log
    async fn msg(&self, msg_type: MessageType, routine: &str, message: &str)
    -> Result<(), OdbError>;

    async fn exists(&self, path: &str) -> Result<bool, OdbError> {
        match self.get(path).await {
            Ok(_) => Ok(true),
            Err(OdbError::NoKey(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read a key, creating it with `default` first if it does not exist
    async fn get_or_init(
        &self,
        path: &str,
        tid: Tid,
        default: Value,
        string_length: usize,
    ) -> Result<Value, OdbError> {
        match self.get(path).await {
            Ok(value) => Ok(value),
            Err(OdbError::NoKey(_)) => {
                let length = default.as_array().map(Vec::len).unwrap_or(1);
                self.create(path, tid, length, string_length).await?;
                self.set(path, default.clone()).await?;
                Ok(default)
            }
            Err(e) => Err(e),
        }
    }

    /// Write a key, creating it first if needed
    async fn set_or_create(
        &self,
        path: &str,
        tid: Tid,
        value: Value,
        string_length: usize,
    ) -> Result<(), OdbError> {
        if !self.exists(path).await? {
            let length = value.as_array().map(Vec::len).unwrap_or(1);
            self.create(path, tid, length, string_length).await?;
        }
        self.set(path, value).await
    }

    async fn get_i64(&self, path: &str) -> Result<i64, OdbError> {
        let value = self.get(path).await?;
        value_as_f64(&value)
            .map(|v| v as i64)
            .ok_or(OdbError::TypeMismatch {
                path: path.to_owned(),
                expected: "number",
            })
    }

    async fn get_bool(&self, path: &str) -> Result<bool, OdbError> {
        let value = self.get(path).await?;
        value_as_bool(&value).ok_or(OdbError::TypeMismatch {
            path: path.to_owned(),
            expected: "BOOL",
        })
    }

    async fn get_string(&self, path: &str) -> Result<String, OdbError> {
        match self.get(path).await? {
            Value::String(s) => Ok(s),
            _ => Err(OdbError::TypeMismatch {
                path: path.to_owned(),
                expected: "STRING",
            }),
        }
    }

    async fn get_f32_array(&self, path: &str) -> Result<Vec<f32>, OdbError> {
        let value = self.get(path).await?;
        as_array(path, &value)?
            .iter()
            .map(|v| value_as_f64(v).map(|f| f as f32))
            .collect::<Option<_>>()
            .ok_or(OdbError::TypeMismatch {
                path: path.to_owned(),
                expected: "FLOAT array",
            })
    }

    async fn get_bool_array(&self, path: &str) -> Result<Vec<bool>, OdbError> {
        let value = self.get(path).await?;
        as_array(path, &value)?
            .iter()
            .map(value_as_bool)
            .collect::<Option<_>>()
            .ok_or(OdbError::TypeMismatch {
                path: path.to_owned(),
                expected: "BOOL array",
            })
    }

    async fn get_string_array(&self, path: &str) -> Result<Vec<String>, OdbError> {
        let value = self.get(path).await?;
        as_array(path, &value)?
            .iter()
            .map(|v| v.as_str().map(str::to_owned))
            .collect::<Option<_>>()
            .ok_or(OdbError::TypeMismatch {
                path: path.to_owned(),
                expected: "STRING array",
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn indexed_paths() {
        assert_eq!(split_index("/A/B").unwrap(), ("/A/B", None));
        assert_eq!(split_index("/A/B[3]").unwrap(), ("/A/B", Some(3)));
        assert!(split_index("/A/B[x]").is_err());
    }

    #[test]
    fn mhttpd_value_encodings() {
        assert_eq!(value_as_f64(&json!(1.5)), Some(1.5));
        assert_eq!(value_as_f64(&json!("0x10")), Some(16.0));
        assert!(value_as_f64(&json!("NaN")).unwrap().is_nan());
        assert_eq!(float_to_value(f64::NEG_INFINITY), json!("-Infinity"));
        assert_eq!(value_as_f64(&float_to_value(f64::INFINITY)), Some(f64::INFINITY));
        assert_eq!(value_as_bool(&json!(true)), Some(true));
        assert_eq!(value_as_bool(&json!(0)), Some(false));
        assert_eq!(value_as_bool(&json!({})), None);
    }

    #[test]
    fn tid_codes() {
        assert_eq!(Tid::try_from(9), Ok(Tid::Float));
        assert_eq!(Tid::Float as u32, 9);
        assert_eq!(Tid::Float.size(), 4);
        assert_eq!(Tid::try_from(99), Err(99));
    }
}
