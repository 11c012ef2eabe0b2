//! SASL negotiation layered in front of the AMQP handshake
//!
//! When enabled, a complete SASL exchange (header, mechanisms, init,
//! optional challenge rounds, outcome) must finish before the transport
//! moves on to the AMQP protocol header. The negotiator is half-driven by
//! the application: the transport feeds it frames, the application picks
//! mechanisms and verdicts.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::condition::{Condition, ErrorCondition};
use crate::frame::{Frame, SaslBody};

/// Outcome code carried in sasl-outcome
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SaslCode {
    /// Authentication succeeded
    Ok,
    /// Authentication failed due to bad credentials
    Auth,
    /// Authentication failed due to a transient system error
    Sys,
    /// Authentication failed due to a permanent system error
    SysPerm,
    /// Authentication failed due to a temporary system error
    SysTemp,
}

impl SaslCode {
    pub(crate) fn from_wire(code: u8) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Auth,
            2 => Self::Sys,
            3 => Self::SysPerm,
            _ => Self::SysTemp,
        }
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Auth => 1,
            Self::Sys => 2,
            Self::SysPerm => 3,
            Self::SysTemp => 4,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SaslRole {
    Client,
    Server,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SaslState {
    /// Waiting for mechanisms (client) or for the application to offer
    /// them (server)
    Idle,
    /// Client: mechanisms arrived, waiting for the application to pick
    /// Server: mechanisms offered, waiting for init
    Negotiating,
    /// Init sent/received; challenge rounds may follow
    Stepping,
    /// Outcome sent or received
    Done,
}

/// One side of a SASL exchange
pub struct Sasl {
    role: SaslRole,
    state: SaslState,
    pending: VecDeque<SaslBody>,
    remote_mechanisms: Vec<String>,
    chosen_mechanism: Option<String>,
    init_response: Option<Bytes>,
    challenge: Option<Bytes>,
    outcome: Option<SaslCode>,
}

impl Sasl {
    /// The initiating side: waits for the server's mechanism list
    pub fn client() -> Self {
        Self::new(SaslRole::Client)
    }

    /// The accepting side: offers mechanisms and judges the init
    pub fn server() -> Self {
        Self::new(SaslRole::Server)
    }

    fn new(role: SaslRole) -> Self {
        Self {
            role,
            state: SaslState::Idle,
            pending: VecDeque::new(),
            remote_mechanisms: Vec::new(),
            chosen_mechanism: None,
            init_response: None,
            challenge: None,
            outcome: None,
        }
    }

    /// Server only: advertise the supported mechanisms
    pub fn offer(&mut self, mechanisms: &[&str]) {
        assert_eq!(self.role, SaslRole::Server, "only a server offers mechanisms");
        if self.state != SaslState::Idle {
            return;
        }
        self.state = SaslState::Negotiating;
        self.pending.push_back(SaslBody::Mechanisms(
            mechanisms.iter().map(|m| m.to_string()).collect(),
        ));
    }

    /// Mechanisms the peer advertised, once its sasl-mechanisms arrived
    pub fn remote_mechanisms(&self) -> &[String] {
        &self.remote_mechanisms
    }

    /// Mechanism the client selected in its sasl-init
    pub fn chosen_mechanism(&self) -> Option<&str> {
        self.chosen_mechanism.as_deref()
    }

    /// Initial response the client carried in its sasl-init
    pub fn init_response(&self) -> Option<&[u8]> {
        self.init_response.as_deref()
    }

    /// Client only: select ANONYMOUS
    pub fn anonymous(&mut self) {
        self.init("ANONYMOUS", None);
    }

    /// Client only: select PLAIN with the given credentials
    pub fn plain(&mut self, username: &str, password: &str) {
        let mut response = Vec::with_capacity(username.len() + password.len() + 2);
        response.push(0);
        response.extend_from_slice(username.as_bytes());
        response.push(0);
        response.extend_from_slice(password.as_bytes());
        self.init("PLAIN", Some(response.into()));
    }

    /// Client only: select an arbitrary mechanism with an optional initial
    /// response
    pub fn init(&mut self, mechanism: &str, initial_response: Option<Bytes>) {
        assert_eq!(self.role, SaslRole::Client, "only a client sends sasl-init");
        if self.state == SaslState::Done || self.chosen_mechanism.is_some() {
            return;
        }
        self.chosen_mechanism = Some(mechanism.to_string());
        self.state = SaslState::Stepping;
        self.pending.push_back(SaslBody::Init {
            mechanism: mechanism.to_string(),
            initial_response,
            hostname: None,
        });
    }

    /// Server only: send a challenge for the current round
    pub fn challenge(&mut self, data: Bytes) {
        assert_eq!(self.role, SaslRole::Server, "only a server challenges");
        if self.state == SaslState::Stepping {
            self.pending.push_back(SaslBody::Challenge(data));
        }
    }

    /// Client only: answer the pending challenge
    pub fn respond(&mut self, data: Bytes) {
        assert_eq!(self.role, SaslRole::Client, "only a client responds");
        if self.state == SaslState::Stepping && self.challenge.take().is_some() {
            self.pending.push_back(SaslBody::Response(data));
        }
    }

    /// The pending challenge data, if the server issued one
    pub fn pending_challenge(&self) -> Option<&[u8]> {
        self.challenge.as_deref()
    }

    /// Server only: conclude the exchange with a verdict
    pub fn done(&mut self, code: SaslCode) {
        assert_eq!(self.role, SaslRole::Server, "only a server concludes");
        if self.state == SaslState::Done {
            return;
        }
        self.state = SaslState::Done;
        self.outcome = Some(code);
        self.pending.push_back(SaslBody::Outcome {
            code: code.to_wire(),
            additional_data: None,
        });
    }

    /// Verdict of the exchange, once known on this side
    pub fn outcome(&self) -> Option<SaslCode> {
        self.outcome
    }

    /// Whether the exchange has concluded (successfully or not)
    pub fn is_done(&self) -> bool {
        self.state == SaslState::Done
    }

    pub(crate) fn poll_frame(&mut self) -> Option<Frame> {
        self.pending.pop_front().map(Frame::sasl)
    }

    pub(crate) fn handle(&mut self, body: SaslBody) -> Result<(), ErrorCondition> {
        match (self.role, body) {
            (SaslRole::Client, SaslBody::Mechanisms(mechs)) => {
                if self.state != SaslState::Idle {
                    return Err(violation("sasl-mechanisms received twice"));
                }
                trace!(?mechs, "mechanisms offered");
                self.remote_mechanisms = mechs;
                self.state = SaslState::Negotiating;
                Ok(())
            }
            (SaslRole::Client, SaslBody::Challenge(data)) => {
                if self.state != SaslState::Stepping {
                    return Err(violation("sasl-challenge before sasl-init"));
                }
                self.challenge = Some(data);
                Ok(())
            }
            (SaslRole::Client, SaslBody::Outcome { code, .. }) => {
                let code = SaslCode::from_wire(code);
                debug!(?code, "sasl outcome");
                self.outcome = Some(code);
                self.state = SaslState::Done;
                Ok(())
            }
            (SaslRole::Server, SaslBody::Init { mechanism, initial_response, .. }) => {
                if self.state != SaslState::Negotiating {
                    return Err(violation("sasl-init out of order"));
                }
                trace!(%mechanism, "init received");
                self.chosen_mechanism = Some(mechanism);
                self.init_response = initial_response;
                self.state = SaslState::Stepping;
                Ok(())
            }
            (SaslRole::Server, SaslBody::Response(data)) => {
                if self.state != SaslState::Stepping {
                    return Err(violation("sasl-response without a challenge round"));
                }
                self.init_response = Some(data);
                Ok(())
            }
            _ => Err(violation("sasl frame inappropriate for this role")),
        }
    }
}

fn violation(description: &'static str) -> ErrorCondition {
    ErrorCondition::new(Condition::ILLEGAL_STATE, description)
}
