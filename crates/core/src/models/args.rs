//! 任务参数
//!
//! 任务参数是字符串到JSON兼容值的映射。调用方通过 [`TaskArgs::get`]
//! 将参数按目标类型反序列化，内部统一经由 `serde_json` 往返转换。

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::{SchedulerError, SchedulerResult};

/// JSON兼容的参数值
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// 持久化后以数字数组形式保存，读回时为 `List`
    Bytes(Vec<u8>),
    List(Vec<ArgValue>),
    Object(BTreeMap<String, ArgValue>),
}

impl From<Value> for ArgValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => ArgValue::Null,
            Value::Bool(b) => ArgValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ArgValue::Int(i),
                None => ArgValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => ArgValue::String(s),
            Value::Array(items) => ArgValue::List(items.into_iter().map(ArgValue::from).collect()),
            Value::Object(map) => ArgValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, ArgValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&ArgValue> for Value {
    fn from(value: &ArgValue) -> Self {
        match value {
            ArgValue::Null => Value::Null,
            ArgValue::Bool(b) => Value::Bool(*b),
            ArgValue::Int(i) => Value::from(*i),
            ArgValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ArgValue::String(s) => Value::String(s.clone()),
            ArgValue::Bytes(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
            ArgValue::List(items) => Value::Array(items.iter().map(Value::from).collect()),
            ArgValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl Serialize for ArgValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Value::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ArgValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(ArgValue::from)
    }
}

/// 任务参数集合
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskArgs(BTreeMap<String, ArgValue>);

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从JSON对象构造参数集合
    pub fn from_json(value: Value) -> SchedulerResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(
                map.into_iter()
                    .map(|(k, v)| (k, ArgValue::from(v)))
                    .collect(),
            )),
            other => Err(SchedulerError::invalid_params(format!(
                "任务参数必须是JSON对象: {other}"
            ))),
        }
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v)))
                .collect(),
        )
    }

    /// 按目标类型读取参数
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> SchedulerResult<T> {
        let value = self
            .0
            .get(key)
            .ok_or_else(|| SchedulerError::invalid_params(format!("缺少参数: {key}")))?;
        serde_json::from_value(Value::from(value)).map_err(|e| {
            SchedulerError::invalid_params(format!("参数 {key} 类型不匹配: {e}"))
        })
    }

    pub fn insert<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> SchedulerResult<()> {
        let value = serde_json::to_value(value)?;
        self.0.insert(key.into(), ArgValue::from(value));
        Ok(())
    }

    pub fn insert_value(&mut self, key: impl Into<String>, value: ArgValue) {
        self.0.insert(key.into(), value);
    }

    pub fn raw(&self, key: &str) -> Option<&ArgValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_get() {
        let args = TaskArgs::from_json(json!({
            "nodeSerialNumbers": ["sn-1", "sn-2"],
            "nodeIDs": [1, 2],
            "retry": true,
        }))
        .unwrap();

        let sns: Vec<String> = args.get("nodeSerialNumbers").unwrap();
        assert_eq!(sns, vec!["sn-1", "sn-2"]);
        let ids: Vec<i64> = args.get("nodeIDs").unwrap();
        assert_eq!(ids, vec![1, 2]);
        assert!(args.get::<bool>("retry").unwrap());
    }

    #[test]
    fn test_missing_and_mismatched_arguments() {
        let args = TaskArgs::from_json(json!({"count": "three"})).unwrap();
        assert!(matches!(
            args.get::<i64>("count"),
            Err(SchedulerError::InvalidTaskParams(_))
        ));
        assert!(matches!(
            args.get::<i64>("absent"),
            Err(SchedulerError::InvalidTaskParams(_))
        ));
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(TaskArgs::from_json(json!([1, 2, 3])).is_err());
    }

    #[test]
    fn test_bytes_read_back_as_vec() {
        let mut args = TaskArgs::new();
        args.insert_value("blob", ArgValue::Bytes(vec![0x1f, 0x8b, 0x08]));

        let text = serde_json::to_string(&args).unwrap();
        let restored: TaskArgs = serde_json::from_str(&text).unwrap();
        let blob: Vec<u8> = restored.get("blob").unwrap();
        assert_eq!(blob, vec![0x1f, 0x8b, 0x08]);
        assert!(matches!(restored.raw("blob"), Some(ArgValue::List(_))));
    }

    #[test]
    fn test_nested_struct_argument() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Peer {
            ip: String,
            sn: String,
        }

        let mut args = TaskArgs::new();
        args.insert(
            "peerInfo",
            Peer {
                ip: "10.0.0.8".into(),
                sn: "sn-8".into(),
            },
        )
        .unwrap();
        let peer: Peer = args.get("peerInfo").unwrap();
        assert_eq!(peer.ip, "10.0.0.8");
        assert!(matches!(args.raw("peerInfo"), Some(ArgValue::Object(_))));
    }
}
