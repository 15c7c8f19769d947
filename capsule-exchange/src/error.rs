// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use capsule_core::RecipientId;
use thiserror::Error;

use crate::address::AddressError;
use crate::crypto::RngError;
use crate::message::MessageError;
use crate::traits::TransportError;

/// Errors from running a single-use exchange, on either side.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The payload does not fit the wire capacity of the operation.
    #[error("payload of {size} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// An exchange under this reception identity is already in flight.
    #[error("an exchange for reception identity {0} is already pending")]
    ExchangeExists(RecipientId),

    /// No response arrived within the configured timeout.
    #[error("waiting for a response timed out after {0:?}")]
    Timeout(Duration),

    /// The request has already been responded to.
    #[error("cannot respond to a single-use request that has already been responded to")]
    AlreadyResponded,

    /// At least one part of a multi-part send could not be handed to the transport.
    #[error("{0} part(s) failed to send; the send cannot be retried partially")]
    PartSendsFailed(usize),

    /// Delivery confirmation failed for at least one round of a multi-part send.
    #[error(
        "{failed} round(s) failed and {timed_out} round(s) timed out; \
         the send cannot be retried partially"
    )]
    RoundsFailed { failed: usize, timed_out: usize },

    /// The exchange state was dropped before a result was produced.
    #[error("exchange was dropped before completion")]
    Dropped,

    /// The random number generator failed; fatal to this attempt.
    #[error(transparent)]
    Rng(#[from] RngError),

    /// No acceptable ephemeral address could be generated.
    #[error(transparent)]
    Address(#[from] AddressError),

    /// A wire message could not be built.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// The transport rejected an operation.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
