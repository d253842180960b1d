//! SASL frame bodies from Part 5.3

use hematite_codec::{Binary, Symbol, Value};

use crate::binding::{field, optional, Composite, Error as BindError, FieldValue, ListDecoder, Multiple};

/// 5.3.3.6 SASL outcome codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslCode {
    /// Authentication succeeded
    Ok = 0,
    /// Failed due to bad credentials
    Auth = 1,
    /// Failed due to a system error
    Sys = 2,
    /// Failed due to unrecoverable server error
    SysPerm = 3,
    /// Failed due to transient server error
    SysTemp = 4,
}

impl FieldValue for SaslCode {
    fn into_value(self) -> Value {
        Value::UByte(self as u8)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match u8::from_value(value)? {
            0 => Ok(SaslCode::Ok),
            1 => Ok(SaslCode::Auth),
            2 => Ok(SaslCode::Sys),
            3 => Ok(SaslCode::SysPerm),
            4 => Ok(SaslCode::SysTemp),
            other => Err(Value::UByte(other)),
        }
    }
}

/// 5.3.3.1 SASL Mechanisms: advertised by the server
#[derive(Debug, Clone, PartialEq)]
pub struct SaslMechanisms {
    /// Mechanisms the server supports, at least one
    pub sasl_server_mechanisms: Multiple<Symbol>,
}

impl Composite for SaslMechanisms {
    const NAME: &'static str = "amqp:sasl-mechanisms:list";
    const CODE: u64 = 0x0000_0000_0000_0040;

    fn to_list(&self) -> Vec<Value> {
        vec![field(self.sasl_server_mechanisms.clone())]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            sasl_server_mechanisms: decoder.mandatory("sasl-server-mechanisms")?,
        })
    }
}

/// 5.3.3.2 SASL Init: the client's mechanism selection
#[derive(Debug, Clone, PartialEq)]
pub struct SaslInit {
    /// Selected mechanism
    pub mechanism: Symbol,

    /// Mechanism-specific first response
    pub initial_response: Option<Binary>,

    /// Name the client sought
    pub hostname: Option<String>,
}

impl Composite for SaslInit {
    const NAME: &'static str = "amqp:sasl-init:list";
    const CODE: u64 = 0x0000_0000_0000_0041;

    fn to_list(&self) -> Vec<Value> {
        vec![
            field(self.mechanism.clone()),
            optional(self.initial_response.clone()),
            optional(self.hostname.clone()),
        ]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            mechanism: decoder.mandatory("mechanism")?,
            initial_response: decoder.optional("initial-response")?,
            hostname: decoder.optional("hostname")?,
        })
    }
}

/// 5.3.3.3 SASL Challenge
#[derive(Debug, Clone, PartialEq)]
pub struct SaslChallenge {
    /// Mechanism-specific challenge data
    pub challenge: Binary,
}

impl Composite for SaslChallenge {
    const NAME: &'static str = "amqp:sasl-challenge:list";
    const CODE: u64 = 0x0000_0000_0000_0042;

    fn to_list(&self) -> Vec<Value> {
        vec![field(self.challenge.clone())]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            challenge: decoder.mandatory("challenge")?,
        })
    }
}

/// 5.3.3.4 SASL Response
#[derive(Debug, Clone, PartialEq)]
pub struct SaslResponse {
    /// Mechanism-specific response data
    pub response: Binary,
}

impl Composite for SaslResponse {
    const NAME: &'static str = "amqp:sasl-response:list";
    const CODE: u64 = 0x0000_0000_0000_0043;

    fn to_list(&self) -> Vec<Value> {
        vec![field(self.response.clone())]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            response: decoder.mandatory("response")?,
        })
    }
}

/// 5.3.3.5 SASL Outcome: the server's verdict
#[derive(Debug, Clone, PartialEq)]
pub struct SaslOutcome {
    /// The verdict
    pub code: SaslCode,

    /// Additional data, mechanism-specific
    pub additional_data: Option<Binary>,
}

impl Composite for SaslOutcome {
    const NAME: &'static str = "amqp:sasl-outcome:list";
    const CODE: u64 = 0x0000_0000_0000_0044;

    fn to_list(&self) -> Vec<Value> {
        vec![field(self.code), optional(self.additional_data.clone())]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            code: decoder.mandatory("code")?,
            additional_data: decoder.optional("additional-data")?,
        })
    }
}

/// Any body a SASL frame may carry
#[derive(Debug, Clone, PartialEq)]
pub enum SaslFrameBody {
    /// Server mechanism advertisement
    Mechanisms(SaslMechanisms),
    /// Client selection
    Init(SaslInit),
    /// Server challenge
    Challenge(SaslChallenge),
    /// Client response
    Response(SaslResponse),
    /// Server verdict
    Outcome(SaslOutcome),
}

impl SaslFrameBody {
    /// Serializes the body to its described-list value
    pub fn to_value(&self) -> Value {
        match self {
            SaslFrameBody::Mechanisms(b) => b.to_value(),
            SaslFrameBody::Init(b) => b.to_value(),
            SaslFrameBody::Challenge(b) => b.to_value(),
            SaslFrameBody::Response(b) => b.to_value(),
            SaslFrameBody::Outcome(b) => b.to_value(),
        }
    }

    /// Dispatches a decoded value on its descriptor
    pub fn from_value(value: Value) -> Result<Self, BindError> {
        let descriptor = match value.as_described() {
            Some(described) => described.descriptor.clone(),
            None => {
                return Err(BindError::NotComposite {
                    expected: "sasl frame body",
                })
            }
        };
        if SaslMechanisms::descriptor_matches(&descriptor) {
            <SaslMechanisms as Composite>::from_value(value).map(SaslFrameBody::Mechanisms)
        } else if SaslInit::descriptor_matches(&descriptor) {
            <SaslInit as Composite>::from_value(value).map(SaslFrameBody::Init)
        } else if SaslChallenge::descriptor_matches(&descriptor) {
            <SaslChallenge as Composite>::from_value(value).map(SaslFrameBody::Challenge)
        } else if SaslResponse::descriptor_matches(&descriptor) {
            <SaslResponse as Composite>::from_value(value).map(SaslFrameBody::Response)
        } else if SaslOutcome::descriptor_matches(&descriptor) {
            <SaslOutcome as Composite>::from_value(value).map(SaslFrameBody::Outcome)
        } else {
            Err(BindError::UnknownDescriptor(descriptor.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sasl_bodies_round_trip() {
        let bodies = [
            SaslFrameBody::Mechanisms(SaslMechanisms {
                sasl_server_mechanisms: vec![Symbol::new("PLAIN"), Symbol::new("ANONYMOUS")].into(),
            }),
            SaslFrameBody::Init(SaslInit {
                mechanism: Symbol::new("PLAIN"),
                initial_response: Some(Binary(vec![0, b'u', 0, b'p'])),
                hostname: None,
            }),
            SaslFrameBody::Challenge(SaslChallenge {
                challenge: Binary::from("c"),
            }),
            SaslFrameBody::Response(SaslResponse {
                response: Binary::from("r"),
            }),
            SaslFrameBody::Outcome(SaslOutcome {
                code: SaslCode::Ok,
                additional_data: None,
            }),
        ];
        for body in bodies {
            let value = body.to_value();
            assert_eq!(SaslFrameBody::from_value(value).unwrap(), body);
        }
    }
}
