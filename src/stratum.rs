//src/stratum.rs

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod jobs;
pub mod protocol;
pub mod server;
pub mod variable_difficulty;
pub mod worker_stats;

/// JSON-RPC message id. The wire contract only admits numeric ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub u64);

impl From<u64> for Id {
    fn from(id: u64) -> Self {
        Id(id)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    pub method: Box<str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Inbound frames must carry a numeric id, a method and an array of params.
    pub fn is_well_formed(&self) -> bool {
        self.id.is_some()
            && !self.method.is_empty()
            && self.params.as_ref().map_or(false, Value::is_array)
    }
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub id: Id,
    pub result: Value,
    pub error: Value,
}

impl Response {
    pub fn ok<T: Serialize>(id: Id, result: T) -> Result<Self> {
        Ok(Response {
            id,
            result: serde_json::to_value(result)?,
            error: Value::Null,
        })
    }

    pub fn err(id: Id, code: u64, message: Box<str>) -> Result<Self> {
        Ok(Response {
            id,
            result: Value::Null,
            error: serde_json::to_value((code, message, Value::Null))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_request() {
        let req: Request =
            serde_json::from_str(r#"{"id":1,"method":"mining.subscribe","params":["GodMiner"]}"#)
                .unwrap();
        assert_eq!(req.id, Some(Id(1)));
        assert_eq!(&*req.method, "mining.subscribe");
        assert!(req.is_well_formed());
    }

    #[test]
    fn rejects_missing_id_or_params() {
        let req: Request =
            serde_json::from_str(r#"{"method":"mining.subscribe","params":[]}"#).unwrap();
        assert!(!req.is_well_formed());

        let req: Request = serde_json::from_str(r#"{"id":2,"method":"mining.subscribe"}"#).unwrap();
        assert!(!req.is_well_formed());

        let req: Request =
            serde_json::from_str(r#"{"id":2,"method":"mining.subscribe","params":{}}"#).unwrap();
        assert!(!req.is_well_formed());
    }

    #[test]
    fn error_response_is_wire_triple() {
        let res = Response::err(Id(7), 21, "Job not found".into()).unwrap();
        let encoded = serde_json::to_value(&res).unwrap();
        assert_eq!(encoded["error"][0], 21);
        assert_eq!(encoded["error"][1], "Job not found");
        assert!(encoded["error"][2].is_null());
        assert!(encoded["result"].is_null());
    }

    #[test]
    fn notification_omits_id() {
        let req = Request {
            id: None,
            method: "mining.notify".into(),
            params: Some(serde_json::json!(["ab12"])),
        };
        let encoded = serde_json::to_string(&req).unwrap();
        assert!(!encoded.contains("\"id\""));
    }
}
