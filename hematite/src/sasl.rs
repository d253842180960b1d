//! SASL pre-handshake: an opaque security layer that runs its own
//! header and frame exchange, then yields the byte stream (pipelined
//! remainder included) to the AMQP transport behind it.
//!
//! Mechanisms carried: PLAIN (authzid NUL authcid NUL passwd against a
//! passwords table) and ANONYMOUS.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use hematite_codec::{Binary, Symbol};
use hematite_types::sasl::{
    SaslCode, SaslFrameBody, SaslInit, SaslMechanisms, SaslOutcome,
};
use thiserror::Error;
use tokio_util::codec::Decoder;

use crate::frames::{self, decode_sasl, sasl_frame, FrameCodec};
use crate::transport::{ProtocolHeader, PROTO_HEADER_SIZE};

/// SASL negotiation failures
#[derive(Debug, Error)]
pub enum SaslError {
    /// The peer's header is not the SASL header
    #[error("bad sasl protocol header {0:02x?}")]
    BadProtocolHeader([u8; 8]),

    /// The peer picked a mechanism we did not offer
    #[error("unsupported sasl mechanism {0}")]
    UnsupportedMechanism(Symbol),

    /// The exchange ran out of order
    #[error("unexpected sasl frame")]
    UnexpectedFrame,

    /// The server's verdict was not ok
    #[error("authentication failed: {0}")]
    AuthenticationFailed(u8),

    /// Framing failure underneath the exchange
    #[error(transparent)]
    Framing(#[from] frames::Error),
}

fn parse_plain(response: &[u8]) -> Option<(String, String)> {
    let mut parts = response.split(|b| *b == 0);
    let _authzid = parts.next()?;
    let authcid = String::from_utf8(parts.next()?.to_vec()).ok()?;
    let passwd = String::from_utf8(parts.next()?.to_vec()).ok()?;
    parts.next().is_none().then_some((authcid, passwd))
}

#[derive(Debug, PartialEq)]
enum Phase {
    Header,
    Init,
    Done,
}

/// Server side of the exchange, sans-IO
#[derive(Debug)]
pub struct SaslServer {
    mechanisms: Vec<String>,
    passwords: HashMap<String, String>,
    phase: Phase,
    input: BytesMut,
    output: BytesMut,
    codec: FrameCodec,
    /// The verdict, once issued
    pub outcome: Option<SaslCode>,
}

impl SaslServer {
    /// A server offering `mechanisms`, checking PLAIN against
    /// `passwords`; our header and mechanism advertisement are queued
    /// immediately
    pub fn new(mechanisms: Vec<String>, passwords: HashMap<String, String>) -> Self {
        let mut output = BytesMut::new();
        let header: [u8; 8] = ProtocolHeader::sasl().into();
        output.extend_from_slice(&header);

        let mut server = Self {
            mechanisms,
            passwords,
            phase: Phase::Header,
            input: BytesMut::new(),
            output,
            codec: FrameCodec::new(),
            outcome: None,
        };
        let advertised = server
            .mechanisms
            .iter()
            .map(|m| Symbol::new(m.as_str()))
            .collect::<Vec<_>>();
        let body = SaslFrameBody::Mechanisms(SaslMechanisms {
            sasl_server_mechanisms: advertised.into(),
        });
        let frame = sasl_frame(&body);
        use tokio_util::codec::Encoder;
        server
            .codec
            .encode(frame, &mut server.output)
            .expect("frame encoding is infallible");
        server
    }

    fn verdict(&self, init: &SaslInit) -> SaslCode {
        match init.mechanism.as_str() {
            "ANONYMOUS" if self.mechanisms.iter().any(|m| m == "ANONYMOUS") => SaslCode::Ok,
            "PLAIN" if self.mechanisms.iter().any(|m| m == "PLAIN") => {
                let response = init
                    .initial_response
                    .as_ref()
                    .map(|b| &b[..])
                    .unwrap_or(&[]);
                match parse_plain(response) {
                    Some((user, pass)) => match self.passwords.get(&user) {
                        Some(expected) if *expected == pass => SaslCode::Ok,
                        _ => SaslCode::Auth,
                    },
                    None => SaslCode::Auth,
                }
            }
            _ => SaslCode::Auth,
        }
    }

    /// Feeds received bytes; once the outcome is queued the exchange is
    /// done and leftover bytes belong to the next layer
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), SaslError> {
        self.input.extend_from_slice(bytes);
        if self.phase == Phase::Header {
            if self.input.len() < PROTO_HEADER_SIZE {
                return Ok(());
            }
            let mut header = [0u8; 8];
            header.copy_from_slice(&self.input.split_to(PROTO_HEADER_SIZE));
            match ProtocolHeader::try_from(header) {
                Ok(parsed) if parsed == ProtocolHeader::sasl() => self.phase = Phase::Init,
                _ => return Err(SaslError::BadProtocolHeader(header)),
            }
        }
        while self.phase == Phase::Init {
            let Some(frame) = self.codec.decode(&mut self.input)? else {
                break;
            };
            match decode_sasl(&frame)? {
                SaslFrameBody::Init(init) => {
                    let code = self.verdict(&init);
                    let body = SaslFrameBody::Outcome(SaslOutcome {
                        code,
                        additional_data: None,
                    });
                    use tokio_util::codec::Encoder;
                    self.codec
                        .encode(sasl_frame(&body), &mut self.output)
                        .expect("frame encoding is infallible");
                    self.outcome = Some(code);
                    self.phase = Phase::Done;
                }
                _ => return Err(SaslError::UnexpectedFrame),
            }
        }
        Ok(())
    }

    /// True once the verdict has been issued
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Bytes queued for the socket
    pub fn take_output(&mut self) -> Bytes {
        self.output.split().freeze()
    }

    /// Pipelined bytes beyond the SASL exchange
    pub fn take_remaining_input(&mut self) -> Bytes {
        self.input.split().freeze()
    }
}

/// Client-side mechanism selection
#[derive(Debug, Clone)]
pub enum SaslProfile {
    /// No identity
    Anonymous,

    /// Username and password
    Plain {
        /// Authentication identity
        username: String,
        /// Password
        password: String,
    },
}

impl SaslProfile {
    fn mechanism(&self) -> &'static str {
        match self {
            SaslProfile::Anonymous => "ANONYMOUS",
            SaslProfile::Plain { .. } => "PLAIN",
        }
    }

    fn initial_response(&self) -> Option<Binary> {
        match self {
            SaslProfile::Anonymous => None,
            SaslProfile::Plain { username, password } => {
                let mut response = Vec::with_capacity(username.len() + password.len() + 2);
                response.push(0);
                response.extend_from_slice(username.as_bytes());
                response.push(0);
                response.extend_from_slice(password.as_bytes());
                Some(Binary(response))
            }
        }
    }
}

/// Client side of the exchange, sans-IO
#[derive(Debug)]
pub struct SaslClient {
    profile: SaslProfile,
    phase: Phase,
    input: BytesMut,
    output: BytesMut,
    codec: FrameCodec,
    /// The server's verdict, once received
    pub outcome: Option<SaslCode>,
}

impl SaslClient {
    /// A client that will offer `profile`; our header is queued
    /// immediately
    pub fn new(profile: SaslProfile) -> Self {
        let mut output = BytesMut::new();
        let header: [u8; 8] = ProtocolHeader::sasl().into();
        output.extend_from_slice(&header);
        Self {
            profile,
            phase: Phase::Header,
            input: BytesMut::new(),
            output,
            codec: FrameCodec::new(),
            outcome: None,
        }
    }

    /// Feeds received bytes; authentication failure surfaces as
    /// [`SaslError::AuthenticationFailed`]
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), SaslError> {
        self.input.extend_from_slice(bytes);
        if self.phase == Phase::Header {
            if self.input.len() < PROTO_HEADER_SIZE {
                return Ok(());
            }
            let mut header = [0u8; 8];
            header.copy_from_slice(&self.input.split_to(PROTO_HEADER_SIZE));
            match ProtocolHeader::try_from(header) {
                Ok(parsed) if parsed == ProtocolHeader::sasl() => self.phase = Phase::Init,
                _ => return Err(SaslError::BadProtocolHeader(header)),
            }
        }
        while self.phase == Phase::Init {
            let Some(frame) = self.codec.decode(&mut self.input)? else {
                break;
            };
            match decode_sasl(&frame)? {
                SaslFrameBody::Mechanisms(mechanisms) => {
                    let offered = self.profile.mechanism();
                    if !mechanisms
                        .sasl_server_mechanisms
                        .iter()
                        .any(|m| m.as_str() == offered)
                    {
                        return Err(SaslError::UnsupportedMechanism(Symbol::new(offered)));
                    }
                    let body = SaslFrameBody::Init(SaslInit {
                        mechanism: Symbol::new(offered),
                        initial_response: self.profile.initial_response(),
                        hostname: None,
                    });
                    use tokio_util::codec::Encoder;
                    self.codec
                        .encode(sasl_frame(&body), &mut self.output)
                        .expect("frame encoding is infallible");
                }
                SaslFrameBody::Outcome(outcome) => {
                    self.outcome = Some(outcome.code);
                    self.phase = Phase::Done;
                    if outcome.code != SaslCode::Ok {
                        return Err(SaslError::AuthenticationFailed(outcome.code as u8));
                    }
                }
                _ => return Err(SaslError::UnexpectedFrame),
            }
        }
        Ok(())
    }

    /// True once the verdict has been received
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Bytes queued for the socket
    pub fn take_output(&mut self) -> Bytes {
        self.output.split().freeze()
    }

    /// Pipelined bytes beyond the SASL exchange
    pub fn take_remaining_input(&mut self) -> Bytes {
        self.input.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump(client: &mut SaslClient, server: &mut SaslServer) -> Result<(), SaslError> {
        for _ in 0..4 {
            let bytes = client.take_output();
            server.feed(&bytes)?;
            let bytes = server.take_output();
            client.feed(&bytes)?;
        }
        Ok(())
    }

    fn passwords() -> HashMap<String, String> {
        HashMap::from([("alice".to_string(), "secret".to_string())])
    }

    #[test]
    fn plain_succeeds_with_good_credentials() {
        let mut server = SaslServer::new(vec!["PLAIN".into()], passwords());
        let mut client = SaslClient::new(SaslProfile::Plain {
            username: "alice".into(),
            password: "secret".into(),
        });
        pump(&mut client, &mut server).unwrap();
        assert_eq!(server.outcome, Some(SaslCode::Ok));
        assert_eq!(client.outcome, Some(SaslCode::Ok));
    }

    #[test]
    fn plain_rejects_bad_password() {
        let mut server = SaslServer::new(vec!["PLAIN".into()], passwords());
        let mut client = SaslClient::new(SaslProfile::Plain {
            username: "alice".into(),
            password: "wrong".into(),
        });
        let err = pump(&mut client, &mut server).unwrap_err();
        assert!(matches!(err, SaslError::AuthenticationFailed(1)));
        assert_eq!(server.outcome, Some(SaslCode::Auth));
    }

    #[test]
    fn anonymous_succeeds_when_offered() {
        let mut server = SaslServer::new(vec!["ANONYMOUS".into()], HashMap::new());
        let mut client = SaslClient::new(SaslProfile::Anonymous);
        pump(&mut client, &mut server).unwrap();
        assert_eq!(client.outcome, Some(SaslCode::Ok));
    }

    #[test]
    fn client_balks_at_missing_mechanism() {
        let mut server = SaslServer::new(vec!["PLAIN".into()], passwords());
        let mut client = SaslClient::new(SaslProfile::Anonymous);
        let err = pump(&mut client, &mut server).unwrap_err();
        assert!(matches!(err, SaslError::UnsupportedMechanism(_)));
    }

    #[test]
    fn pipelined_amqp_bytes_survive_the_exchange() {
        let mut server = SaslServer::new(vec!["ANONYMOUS".into()], HashMap::new());
        let mut client = SaslClient::new(SaslProfile::Anonymous);
        pump(&mut client, &mut server).unwrap();

        // the client pipelines its AMQP header behind the exchange
        server.feed(b"AMQP\x00\x01\x00\x00").unwrap();
        assert_eq!(&server.take_remaining_input()[..], b"AMQP\x00\x01\x00\x00");
    }
}
