//! Payload codec: work item to bytes and back.

use std::{collections::HashMap, sync::Arc};

use bincode::{config::Configuration, error::DecodeError, Decode, Encode};
use bytes::Bytes;

use crate::{
    error::{CodecError, DeserializationError},
    job::{Job, Perform},
};

/// A decoded work item together with the type tag it was stored under.
pub struct Decoded {
    pub job_type: String,
    pub item: Arc<dyn Perform>,
}

impl Decoded {
    pub fn name(&self) -> String {
        self.item
            .display_name()
            .unwrap_or_else(|| self.job_type.clone())
    }
}

pub trait PayloadCodec: Send + Sync + 'static {
    fn decode(&self, payload: &[u8]) -> Result<Decoded, DeserializationError>;
}

pub trait EncodeJob<J>: Send + Sync + 'static {
    fn encode(&self, job: &J) -> Result<Bytes, CodecError>;
}

#[derive(Encode, Decode)]
struct Envelope {
    job_type: String,
    body: Vec<u8>,
}

type DecodeFn = fn(&[u8], Configuration) -> Result<Arc<dyn Perform>, DecodeError>;

fn decode_body<J: Job>(
    body: &[u8],
    config: Configuration,
) -> Result<Arc<dyn Perform>, DecodeError> {
    let (job, _) = bincode::decode_from_slice::<J, _>(body, config)?;
    Ok(Arc::new(job))
}

/// Bincode codec over a registry of job types.
///
/// Every job type a worker should run must be registered on that worker's
/// codec; payloads of unknown types fail to load.
#[derive(Clone)]
pub struct BincodeCodec {
    decoders: HashMap<&'static str, DecodeFn>,
    bincode_config: Configuration,
}

impl BincodeCodec {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
            bincode_config: bincode::config::standard(),
        }
    }

    pub fn register<J: Job>(mut self) -> Self {
        self.decoders.insert(J::NAME, decode_body::<J>);
        self
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.decoders.contains_key(job_type)
    }
}

impl Default for BincodeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl<J: Job> EncodeJob<J> for BincodeCodec {
    fn encode(&self, job: &J) -> Result<Bytes, CodecError> {
        if !self.is_registered(J::NAME) {
            return Err(CodecError::UnregisteredJobType(J::NAME));
        }
        let envelope = Envelope {
            job_type: J::NAME.to_string(),
            body: bincode::encode_to_vec(job, self.bincode_config)?,
        };
        Ok(bincode::encode_to_vec(&envelope, self.bincode_config)?.into())
    }
}

impl PayloadCodec for BincodeCodec {
    fn decode(&self, payload: &[u8]) -> Result<Decoded, DeserializationError> {
        let (envelope, _): (Envelope, usize) =
            bincode::decode_from_slice(payload, self.bincode_config)
                .map_err(DeserializationError::Envelope)?;

        let decode = self
            .decoders
            .get(envelope.job_type.as_str())
            .ok_or_else(|| DeserializationError::UnknownJobType(envelope.job_type.clone()))?;

        let item = decode(&envelope.body, self.bincode_config).map_err(|error| {
            DeserializationError::Body {
                job_type: envelope.job_type.clone(),
                error,
            }
        })?;

        Ok(Decoded {
            job_type: envelope.job_type,
            item,
        })
    }
}
