// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces of the collaborators this crate is built on top of.
//!
//! The anonymous delivery network is not part of this crate: the exchange layer talks to it
//! exclusively through [`Transport`], and the network hands inbound ciphertext back through
//! [`CiphertextHandler`] registrations. Registration and deregistration must be atomic with
//! respect to concurrent lookups, so a message never observes a half-registered handler.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use capsule_core::{EphemeralAddress, RecipientId, RoundId};
use thiserror::Error;

use crate::crypto::{Fingerprint, Mac};

/// One inbound message handed over by the transport.
#[derive(Clone, Debug)]
pub struct Delivered {
    /// Routing fingerprint the message was sent under.
    pub fingerprint: Fingerprint,

    /// The encrypted payload.
    pub payload: Vec<u8>,

    /// Detached authentication tag over the payload.
    pub mac: Mac,

    /// Delivery round the message arrived on.
    pub round: RoundId,
}

/// Service under which unsolicited messages reach a listener.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Service {
    /// Identity the service listens on.
    pub identifier: RecipientId,

    /// Tag distinguishing services of the same identity.
    pub tag: String,
}

/// Time-windowed reception identity registered with the transport for the lifetime of one
/// exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EphemeralIdentity {
    /// The content-addressed reception identity.
    pub id: RecipientId,

    /// The pseudonymous address the identity is reachable under.
    pub address: EphemeralAddress,

    /// Start of the address validity window, in nanoseconds since the Unix epoch.
    pub valid_from: u64,

    /// End of the address validity window, in nanoseconds since the Unix epoch.
    pub valid_to: u64,
}

/// Delivery outcome of one transport round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundResult {
    /// The round completed and its messages were delivered.
    Succeeded,

    /// The round failed.
    Failed,

    /// The round outcome was not known within the deadline.
    TimedOut,
}

/// Handler invoked by the transport for every message matching a registered fingerprint or
/// service.
///
/// The transport delivers inbound ciphertext on independent concurrent tasks, one per message;
/// implementations must be safe to call from any of them.
pub trait CiphertextHandler: Send + Sync {
    /// Process one delivered message addressed to `receiver`.
    fn process(&self, message: Delivered, receiver: RecipientId);
}

/// Anonymous delivery network consumed by the exchange layer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Maximum payload length of a single wire message. All codec sizes derive from this.
    fn max_message_length(&self) -> usize;

    /// Hand one message over for delivery, returning the round it was sent on.
    async fn send(
        &self,
        recipient: RecipientId,
        fingerprint: Fingerprint,
        service: Option<Service>,
        payload: Vec<u8>,
        mac: Mac,
    ) -> Result<RoundId, TransportError>;

    /// Route inbound messages carrying `fingerprint` for `receiver` to the handler.
    fn register_fingerprint(
        &self,
        receiver: RecipientId,
        fingerprint: Fingerprint,
        handler: Arc<dyn CiphertextHandler>,
    ) -> Result<(), TransportError>;

    /// Remove a single fingerprint registration of `receiver`.
    fn delete_fingerprint(&self, receiver: &RecipientId, fingerprint: &Fingerprint);

    /// Remove every fingerprint registered for `receiver`.
    fn delete_fingerprints(&self, receiver: &RecipientId);

    /// Route inbound messages addressed to the service to the handler.
    fn register_service(
        &self,
        service: Service,
        handler: Arc<dyn CiphertextHandler>,
    ) -> Result<(), TransportError>;

    /// Remove a service registration.
    fn delete_service(&self, service: &Service);

    /// Start picking up messages for an ephemeral reception identity.
    fn register_identity(&self, identity: EphemeralIdentity);

    /// Stop picking up messages for a reception identity.
    fn delete_identity(&self, id: &RecipientId);

    /// Wait for the delivery outcome of a round, up to `timeout`.
    async fn round_result(&self, round: RoundId, timeout: Duration) -> RoundResult;
}

/// Errors surfaced by the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The fingerprint is already routed to a handler.
    #[error("fingerprint {0} is already registered")]
    FingerprintInUse(Fingerprint),

    /// The service is already routed to a handler.
    #[error("service {tag:?} is already registered for {identifier}")]
    ServiceInUse {
        identifier: RecipientId,
        tag: String,
    },

    /// The message could not be handed over for delivery.
    #[error("failed to send message: {0}")]
    SendFailed(String),
}
