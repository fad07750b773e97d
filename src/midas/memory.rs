//! An ODB held in process memory
//!
//! Used when running without an experiment (`--offline`) and in tests. Keys are
//! matched case-insensitively, as MIDAS does. The tree can be seeded from an ODB
//! JSON save file; the `<name>/key` metadata entries in such a file supply key
//! types and are not stored as values.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use serde_json::{Map, Value};
use tracing::debug;

use super::odb::{MessageType, Odb, OdbError, Tid, split_index};

/// A message sent to the MIDAS message log
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedMessage {
    pub msg_type: MessageType,
    pub routine: String,
    pub message: String,
}

#[derive(Debug, Default)]
struct Tree {
    root: Map<String, Value>,
    /// Key types, by lowercased path
    types: HashMap<String, Tid>,
    messages: Vec<LoggedMessage>,
}

/// Shared handle to an in-memory ODB. Clones refer to the same tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryOdb {
    inner: Arc<Mutex<Tree>>,
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn type_key(segments: &[&str]) -> String {
    segments.join("/").to_lowercase()
}

fn child_key(dir: &Map<String, Value>, name: &str) -> Option<String> {
    dir.keys().find(|k| k.eq_ignore_ascii_case(name)).cloned()
}

fn find<'a>(root: &'a Map<String, Value>, segments: &[&str]) -> Option<&'a Value> {
    let (last, parents) = segments.split_last()?;
    let mut dir = root;
    for seg in parents {
        dir = dir.get(&child_key(dir, seg)?)?.as_object()?;
    }
    dir.get(&child_key(dir, last)?)
}

fn find_mut<'a>(root: &'a mut Map<String, Value>, segments: &[&str]) -> Option<&'a mut Value> {
    let (last, parents) = segments.split_last()?;
    let mut dir = root;
    for seg in parents {
        let key = child_key(dir, seg)?;
        dir = dir.get_mut(&key)?.as_object_mut()?;
    }
    let key = child_key(dir, last)?;
    dir.get_mut(&key)
}

/// Default for a new array element, from the key type or the existing elements
fn element_default(tid: Option<Tid>, existing: &[Value]) -> Value {
    if let Some(tid) = tid {
        return tid.default_value();
    }
    match existing.first() {
        Some(Value::Bool(_)) => Value::Bool(false),
        Some(Value::String(_)) => Value::String(String::new()),
        Some(Value::Number(n)) if n.is_f64() => Value::from(0.0),
        _ => Value::from(0),
    }
}

/// Separate values from `/key` metadata in an ODB JSON save
fn import_dir(
    dir: Map<String, Value>,
    prefix: &[&str],
    types: &mut HashMap<String, Tid>,
) -> Map<String, Value> {
    let mut out = Map::new();
    for (name, value) in dir {
        if name.starts_with('/') {
            continue;
        }
        if let Some(key_name) = name.strip_suffix("/key") {
            let tid = value
                .get("type")
                .and_then(Value::as_u64)
                .and_then(|t| Tid::try_from(t as u32).ok());
            if let Some(tid) = tid {
                let mut path = prefix.to_vec();
                path.push(key_name);
                types.insert(type_key(&path), tid);
            }
            continue;
        }
        if name.contains('/') {
            continue;
        }
        let value = match value {
            Value::Object(sub) => {
                let mut path = prefix.to_vec();
                path.push(&name);
                Value::Object(import_dir(sub, &path, types))
            }
            other => other,
        };
        out.insert(name, value);
    }
    out
}

impl MemoryOdb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object, such as an ODB JSON save
    pub fn from_json(value: Value) -> Result<Self, OdbError> {
        let Value::Object(root) = value else {
            return Err(OdbError::TypeMismatch {
                path: "/".to_owned(),
                expected: "directory",
            });
        };
        let mut types = HashMap::new();
        let root = import_dir(root, &[], &mut types);
        Ok(MemoryOdb {
            inner: Arc::new(Mutex::new(Tree {
                root,
                types,
                messages: Vec::new(),
            })),
        })
    }

    /// Load an ODB JSON save file
    pub fn load(path: &Path) -> Result<Self, OdbError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(serde_json::from_str(&text)?)
    }

    /// Everything sent to the message log so far
    pub fn messages(&self) -> Vec<LoggedMessage> {
        self.lock().messages.clone()
    }

    /// A copy of the whole tree
    pub fn snapshot(&self) -> Value {
        Value::Object(self.lock().root.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        // A panic while holding the lock cannot leave the tree half-written
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Odb for MemoryOdb {
    async fn get(&self, path: &str) -> Result<Value, OdbError> {
        let (base, index) = split_index(path)?;
        let segs = segments(base);
        let tree = self.lock();
        if segs.is_empty() {
            return Ok(Value::Object(tree.root.clone()));
        }
        let value = find(&tree.root, &segs).ok_or_else(|| OdbError::NoKey(path.to_owned()))?;
        match (index, value) {
            (None, v) => Ok(v.clone()),
            (Some(i), Value::Array(items)) => items
                .get(i)
                .cloned()
                .ok_or_else(|| OdbError::NoKey(path.to_owned())),
            (Some(0), v) if !v.is_object() => Ok(v.clone()),
            _ => Err(OdbError::NoKey(path.to_owned())),
        }
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), OdbError> {
        let (base, index) = split_index(path)?;
        let segs = segments(base);
        let mut tree = self.lock();
        let tid = tree.types.get(&type_key(&segs)).copied();
        let node =
            find_mut(&mut tree.root, &segs).ok_or_else(|| OdbError::NoKey(path.to_owned()))?;
        let Some(index) = index else {
            *node = value;
            return Ok(());
        };
        if node.is_object() {
            return Err(OdbError::TypeMismatch {
                path: path.to_owned(),
                expected: "array",
            });
        }
        if !node.is_array() {
            let first = node.take();
            *node = Value::Array(vec![first]);
        }
        if let Value::Array(items) = node {
            // Writing past the end extends the array
            if index >= items.len() {
                let fill = element_default(tid, items);
                items.resize(index + 1, fill);
            }
            items[index] = value;
        }
        Ok(())
    }

    async fn create(
        &self,
        path: &str,
        tid: Tid,
        array_length: usize,
        _string_length: usize,
    ) -> Result<(), OdbError> {
        let segs = segments(path);
        let Some((last, parents)) = segs.split_last() else {
            return Err(OdbError::InvalidPath(path.to_owned()));
        };
        let mut tree = self.lock();
        let mut dir = &mut tree.root;
        for seg in parents {
            let key = child_key(dir, seg).unwrap_or_else(|| seg.to_string());
            dir = dir
                .entry(key)
                .or_insert_with(|| Value::Object(Map::new()))
                .as_object_mut()
                .ok_or_else(|| OdbError::TypeMismatch {
                    path: path.to_owned(),
                    expected: "directory",
                })?;
        }
        if child_key(dir, last).is_some() {
            return Ok(());
        }
        let value = match (tid, array_length) {
            (Tid::Key, _) => Value::Object(Map::new()),
            (tid, n) if n > 1 => Value::Array(vec![tid.default_value(); n]),
            (tid, _) => tid.default_value(),
        };
        debug!("Creating ODB key {path} as {tid}[{array_length}]");
        dir.insert(last.to_string(), value);
        tree.types.insert(type_key(&segs), tid);
        Ok(())
    }

    async fn resize(&self, path: &str, new_length: usize) -> Result<(), OdbError> {
        let segs = segments(path);
        let mut tree = self.lock();
        let tid = tree.types.get(&type_key(&segs)).copied();
        let node =
            find_mut(&mut tree.root, &segs).ok_or_else(|| OdbError::NoKey(path.to_owned()))?;
        match node {
            Value::Object(_) => Err(OdbError::TypeMismatch {
                path: path.to_owned(),
                expected: "array",
            }),
            Value::Array(items) => {
                let fill = element_default(tid, items);
                items.resize(new_length, fill);
                Ok(())
            }
            scalar => {
                if new_length != 1 {
                    let first = scalar.take();
                    let fill = element_default(tid, std::slice::from_ref(&first));
                    let mut items = vec![first];
                    items.resize(new_length, fill);
                    *scalar = Value::Array(items);
                }
                Ok(())
            }
        }
    }

    async fn msg(
        &self,
        msg_type: MessageType,
        routine: &str,
        message: &str,
    ) -> Result<(), OdbError> {
        debug!("Message log ({msg_type:?}): [{routine}] {message}");
        self.lock().messages.push(LoggedMessage {
            msg_type,
            routine: routine.to_owned(),
            message: message.to_owned(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_and_read_back() {
        let odb = MemoryOdb::new();
        odb.create("/Equipment/EPICS/Settings/Names", Tid::String, 5, 32)
            .await
            .unwrap();
        assert_eq!(
            odb.get_string_array("/equipment/epics/settings/names")
                .await
                .unwrap(),
            vec![String::new(); 5]
        );
        odb.set("/Equipment/EPICS/Settings/Names[1]", json!("Beam current"))
            .await
            .unwrap();
        assert_eq!(
            odb.get("/Equipment/EPICS/Settings/Names[1]").await.unwrap(),
            json!("Beam current")
        );
        assert!(matches!(
            odb.get("/Equipment/EPICS/Settings/Missing").await,
            Err(OdbError::NoKey(_))
        ));
        assert!(matches!(
            odb.set("/Nowhere", json!(1)).await,
            Err(OdbError::NoKey(_))
        ));
    }

    #[tokio::test]
    async fn defaults_do_not_overwrite() {
        let odb = MemoryOdb::new();
        let v = odb
            .get_or_init("/Settings/Update interval", Tid::Int, json!(10), 0)
            .await
            .unwrap();
        assert_eq!(v, json!(10));
        odb.set("/Settings/Update interval", json!(250)).await.unwrap();
        let v = odb
            .get_or_init("/Settings/Update interval", Tid::Int, json!(10), 0)
            .await
            .unwrap();
        assert_eq!(v, json!(250));
    }

    #[tokio::test]
    async fn resize_arrays() {
        let odb = MemoryOdb::new();
        odb.create("/Variables/Measured", Tid::Float, 2, 0)
            .await
            .unwrap();
        odb.set("/Variables/Measured", json!([1.5, 2.5])).await.unwrap();
        odb.resize("/Variables/Measured", 4).await.unwrap();
        assert_eq!(
            odb.get_f32_array("/Variables/Measured").await.unwrap(),
            vec![1.5, 2.5, 0.0, 0.0]
        );
        odb.resize("/Variables/Measured", 1).await.unwrap();
        assert_eq!(
            odb.get_f32_array("/Variables/Measured").await.unwrap(),
            vec![1.5]
        );
        // Writing past the end grows the array
        odb.set("/Variables/Measured[2]", json!(7.0)).await.unwrap();
        assert_eq!(
            odb.get_f32_array("/Variables/Measured").await.unwrap(),
            vec![1.5, 0.0, 7.0]
        );
    }

    #[tokio::test]
    async fn import_odb_save() {
        let odb = MemoryOdb::from_json(json!({
            "/MIDAS version": "2.1",
            "Equipment": {
                "EPICS": {
                    "Settings": {
                        "Enabled/key": {"type": 8, "num_values": 2},
                        "Enabled": [true, false],
                    }
                }
            }
        }))
        .unwrap();
        assert!(!odb.exists("/MIDAS version").await.unwrap());
        assert_eq!(
            odb.get_bool_array("/Equipment/EPICS/Settings/Enabled")
                .await
                .unwrap(),
            vec![true, false]
        );
        odb.resize("/Equipment/EPICS/Settings/Enabled", 3)
            .await
            .unwrap();
        assert_eq!(
            odb.get("/Equipment/EPICS/Settings/Enabled[2]").await.unwrap(),
            json!(false)
        );
    }

    #[tokio::test]
    async fn message_log() {
        let odb = MemoryOdb::new();
        odb.msg(MessageType::Error, "epics_init", "Unable to initialize EPICS")
            .await
            .unwrap();
        let messages = odb.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].routine, "epics_init");
    }
}
