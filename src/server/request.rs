//! Request sequences
//!
//! A request is a type header, zero or more payload messages and a
//! `{"final": true}` terminator, each on its own line.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;

use crate::error::ProtocolError;
use crate::types::{BufferSnapshot, Plan, RewardObservation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Query,
    Predict,
    Reward,
    LoadModel,
}

impl MessageType {
    fn from_header(header: &Value) -> Result<Self, ProtocolError> {
        let name = header.get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;

        match name {
            "query" => Ok(MessageType::Query),
            "predict" => Ok(MessageType::Predict),
            "reward" => Ok(MessageType::Reward),
            "load model" => Ok(MessageType::LoadModel),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Query => "query",
            MessageType::Predict => "predict",
            MessageType::Reward => "reward",
            MessageType::LoadModel => "load model",
        }
    }
}

/// A fully decoded request
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Choose among candidate plans
    Query { arms: Vec<Plan>, buffers: BufferSnapshot },
    /// Predict the reward of one plan
    Predict { plan: Plan, buffers: BufferSnapshot },
    /// Record an observed execution
    Reward { plan: Plan, buffers: BufferSnapshot, observation: RewardObservation },
    /// Offer a saved model to the serving gate
    LoadModel { path: PathBuf },
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::Query { .. } => MessageType::Query,
            Request::Predict { .. } => MessageType::Predict,
            Request::Reward { .. } => MessageType::Reward,
            Request::LoadModel { .. } => MessageType::LoadModel,
        }
    }
}

#[derive(Deserialize)]
struct LoadModelPayload {
    path: PathBuf,
}

fn is_terminator(message: &Value) -> bool {
    message.get("final").and_then(Value::as_bool) == Some(true)
}

/// Collects messages until the terminator, then decodes the request
#[derive(Debug, Default)]
pub struct RequestAssembler {
    kind: Option<MessageType>,
    payload: Vec<Value>,
}

impl RequestAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one message. Returns the request once the terminator arrives.
    pub fn push(&mut self, message: Value) -> Result<Option<Request>, ProtocolError> {
        if is_terminator(&message) {
            let kind = self.kind.take().ok_or(ProtocolError::EmptySequence)?;
            let payload = std::mem::take(&mut self.payload);
            return decode(kind, payload).map(Some);
        }

        match self.kind {
            None => self.kind = Some(MessageType::from_header(&message)?),
            Some(_) => self.payload.push(message),
        }
        Ok(None)
    }
}

fn decode(kind: MessageType, mut payload: Vec<Value>) -> Result<Request, ProtocolError> {
    let malformed = |reason: String| ProtocolError::MalformedPayload {
        kind: kind.as_str(),
        reason,
    };
    let expect_len = |payload: &[Value], expected: usize| {
        if payload.len() == expected {
            Ok(())
        } else {
            Err(malformed(format!("expected {} messages, got {}", expected, payload.len())))
        }
    };

    match kind {
        MessageType::Query => {
            let buffers = payload.pop()
                .ok_or_else(|| malformed("missing buffer snapshot".to_string()))?;
            let arms = payload.into_iter()
                .map(|plan| parse(kind, plan))
                .collect::<Result<Vec<Plan>, _>>()?;
            Ok(Request::Query { arms, buffers: parse(kind, buffers)? })
        }
        MessageType::Predict => {
            expect_len(&payload, 2)?;
            let mut items = payload.into_iter();
            Ok(Request::Predict {
                plan: parse(kind, next(&mut items))?,
                buffers: parse(kind, next(&mut items))?,
            })
        }
        MessageType::Reward => {
            expect_len(&payload, 3)?;
            let mut items = payload.into_iter();
            Ok(Request::Reward {
                plan: parse(kind, next(&mut items))?,
                buffers: parse(kind, next(&mut items))?,
                observation: parse(kind, next(&mut items))?,
            })
        }
        MessageType::LoadModel => {
            expect_len(&payload, 1)?;
            let body: LoadModelPayload = parse(kind, next(&mut payload.into_iter()))?;
            Ok(Request::LoadModel { path: body.path })
        }
    }
}

// Length is checked before this is called
fn next(items: &mut impl Iterator<Item = Value>) -> Value {
    items.next().unwrap_or(Value::Null)
}

fn parse<T: DeserializeOwned>(kind: MessageType, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::MalformedPayload {
        kind: kind.as_str(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan() -> Value {
        json!({"Plan": {"Node Type": "Seq Scan", "Relation Name": "title", "Total Cost": 1.0, "Plan Rows": 1.0}})
    }

    fn assemble(messages: Vec<Value>) -> Result<Option<Request>, ProtocolError> {
        let mut assembler = RequestAssembler::new();
        let mut last = Ok(None);
        for message in messages {
            last = assembler.push(message);
            if last.is_err() {
                break;
            }
        }
        last
    }

    #[test]
    fn test_query_sequence() {
        let request = assemble(vec![
            json!({"type": "query"}),
            plan(),
            plan(),
            json!({"title": 3}),
            json!({"final": true}),
        ]).unwrap().unwrap();

        match request {
            Request::Query { arms, buffers } => {
                assert_eq!(arms.len(), 2);
                assert_eq!(buffers.get("title"), Some(&3));
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_reward_sequence() {
        let request = assemble(vec![
            json!({"type": "reward"}),
            plan(),
            json!({}),
            json!({"reward": 42.5, "pid": 7}),
            json!({"final": true}),
        ]).unwrap().unwrap();

        assert_eq!(request.message_type(), MessageType::Reward);
        if let Request::Reward { observation, .. } = request {
            assert_eq!(observation, RewardObservation { reward: 42.5, pid: 7 });
        }
    }

    #[test]
    fn test_load_model_sequence() {
        let request = assemble(vec![
            json!({"type": "load model"}),
            json!({"path": "/tmp/model"}),
            json!({"final": true}),
        ]).unwrap().unwrap();
        assert_eq!(request, Request::LoadModel { path: PathBuf::from("/tmp/model") });
    }

    #[test]
    fn test_incomplete_sequence_yields_nothing() {
        assert!(assemble(vec![json!({"type": "predict"}), plan()]).unwrap().is_none());
    }

    #[test]
    fn test_header_errors() {
        assert!(matches!(assemble(vec![json!({"final": true})]), Err(ProtocolError::EmptySequence)));
        assert!(matches!(assemble(vec![json!({"kind": "query"})]), Err(ProtocolError::MissingType)));
        assert!(matches!(
            assemble(vec![json!({"type": "train"})]),
            Err(ProtocolError::UnknownType(t)) if t == "train"
        ));
    }

    #[test]
    fn test_payload_errors() {
        let wrong_count = assemble(vec![json!({"type": "predict"}), plan(), json!({"final": true})]);
        assert!(matches!(wrong_count, Err(ProtocolError::MalformedPayload { kind: "predict", .. })));

        let bad_observation = assemble(vec![
            json!({"type": "reward"}), plan(), json!({}), json!({"reward": "fast"}), json!({"final": true}),
        ]);
        assert!(matches!(bad_observation, Err(ProtocolError::MalformedPayload { kind: "reward", .. })));

        let no_buffers = assemble(vec![json!({"type": "query"}), json!({"final": true})]);
        assert!(matches!(no_buffers, Err(ProtocolError::MalformedPayload { kind: "query", .. })));
    }
}
