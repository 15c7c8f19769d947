// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;
use std::time::{Duration, Instant};

use capsule_core::{RecipientId, RoundId};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::address::{make_ids, unix_nanos};
use crate::crypto::{Cypher, PublicKey, Rng, Role, SecretKey};
use crate::error::ExchangeError;
use crate::message::{Request, RequestPayload, request_contents_size};
use crate::pending::{Exchange, PendingExchanges, complete, spawn_timeout};
use crate::traits::{CiphertextHandler, Delivered, EphemeralIdentity, Service, Transport};

/// A contact able to receive single-use requests: a long-lived reception identity together with
/// its static public key.
#[derive(Clone, Debug)]
pub struct Contact {
    /// Identity the contact listens on.
    pub id: RecipientId,

    /// Static public key of the contact.
    pub public_key: PublicKey,
}

impl Contact {
    pub fn new(id: RecipientId, public_key: PublicKey) -> Self {
        Self { id, public_key }
    }
}

/// Parameters of one outbound request.
#[derive(Clone, Copy, Debug)]
pub struct RequestParams {
    /// How long to wait for the full response before the exchange times out.
    pub timeout: Duration,

    /// Number of reply parts the exchange is prepared to collect.
    pub max_response_parts: u8,

    /// Width of the ephemeral address space in bits.
    pub address_bits: u8,
}

impl Default for RequestParams {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_response_parts: 8,
            address_bits: 16,
        }
    }
}

/// Fully collated reply to a single-use request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// The reassembled response payload.
    pub payload: Vec<u8>,

    /// Delivery rounds the response parts arrived on.
    pub rounds: Vec<RoundId>,
}

/// One-shot completion callback of an outbound exchange.
///
/// Fires exactly once per successfully started exchange, from whichever concurrent context
/// resolves it first: full collation, or the timeout.
pub type ResponseCallback = Box<dyn FnOnce(Result<Response, ExchangeError>) + Send + 'static>;

/// Client side of the single-use exchange protocol.
///
/// A transmitter holds no per-exchange state of its own; everything an exchange needs lives in
/// the pending-exchange registry and dies with the exchange.
pub struct Transmitter {
    transport: Arc<dyn Transport>,
    rng: Arc<Rng>,
    pending: Arc<PendingExchanges>,
}

impl Transmitter {
    pub fn new(transport: Arc<dyn Transport>, rng: Arc<Rng>) -> Self {
        Self {
            transport,
            rng,
            pending: Arc::new(PendingExchanges::new()),
        }
    }

    /// Maximum request payload this transmitter can send. Requests are single-part by design,
    /// so this is the capacity of one wire message.
    pub fn max_request_size(&self) -> usize {
        request_contents_size(self.transport.max_message_length())
    }

    /// Send an anonymous single-use request and wait for the collated response.
    ///
    /// The suspending face of [`Transmitter::request_with_callback`]: the same mechanism,
    /// bridged through a one-shot channel.
    pub async fn request(
        &self,
        recipient: &Contact,
        tag: &str,
        payload: &[u8],
        params: RequestParams,
    ) -> Result<Response, ExchangeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let callback: ResponseCallback = Box::new(move |result| {
            let _ = reply_tx.send(result);
        });

        self.request_with_callback(recipient, tag, payload, params, callback)
            .await?;

        reply_rx.await.map_err(|_| ExchangeError::Dropped)?
    }

    /// Send an anonymous single-use request; the callback fires exactly once with the collated
    /// response or an error.
    ///
    /// Generates an ephemeral keypair and a fresh reception identity, pre-registers one
    /// fingerprint per expected response part so arriving ciphertext routes straight to this
    /// exchange, and arms a timeout racing the collection. Returns the delivery round of the
    /// request and the reception identity the response will arrive under.
    pub async fn request_with_callback(
        &self,
        recipient: &Contact,
        tag: &str,
        payload: &[u8],
        params: RequestParams,
        callback: ResponseCallback,
    ) -> Result<(RoundId, EphemeralIdentity), ExchangeError> {
        let started = Instant::now();

        let max_message_length = self.transport.max_message_length();
        let max_contents = request_contents_size(max_message_length);
        if payload.len() > max_contents {
            return Err(ExchangeError::PayloadTooLarge {
                size: payload.len(),
                max: max_contents,
            });
        }

        // Fresh keypair per exchange: the public key travels in the clear, the private half
        // never leaves this function.
        let secret_key = SecretKey::generate(&self.rng)?;
        let public_key = secret_key.public_key();
        let shared_secret = secret_key.shared_secret(&recipient.public_key);

        let mut request = Request::new(max_message_length)?;
        let mut request_payload = RequestPayload::new(
            request.payload_size(),
            payload,
            params.max_response_parts,
        )?;

        let identity = make_ids(
            &mut request_payload,
            &public_key,
            params.address_bits,
            params.timeout,
            unix_nanos(),
            &self.rng,
        )?;

        let cypher = Cypher::derive(&shared_secret, 0, Role::Transmit);
        let (fingerprint, ciphertext, mac) = cypher.encrypt(request_payload.as_bytes());
        request.set_public_key(&public_key);
        request.set_payload(&ciphertext)?;

        let exchange = Arc::new(Exchange::new(
            &shared_secret,
            params.max_response_parts,
            callback,
        ));
        self.pending.insert(identity.id, exchange.clone())?;

        let processor: Arc<dyn CiphertextHandler> = Arc::new(ResponseProcessor {
            pending: self.pending.clone(),
            transport: self.transport.clone(),
            tag: tag.to_string(),
        });

        for response_cypher in exchange.cyphers() {
            if let Err(err) = self.transport.register_fingerprint(
                identity.id,
                response_cypher.fingerprint(),
                processor.clone(),
            ) {
                self.unwind(&identity.id);
                return Err(err.into());
            }
        }

        self.transport.register_identity(identity.clone());

        debug!(recipient = %recipient.id, tag, parts = params.max_response_parts,
            "sending single-use request");

        let service = Service {
            identifier: recipient.id,
            tag: tag.to_string(),
        };
        let round = match self
            .transport
            .send(
                recipient.id,
                fingerprint,
                Some(service),
                request.into_bytes(),
                mac,
            )
            .await
        {
            Ok(round) => round,
            Err(err) => {
                error!(recipient = %recipient.id, tag, %err,
                    "failed to send single-use request");
                self.unwind(&identity.id);
                return Err(err.into());
            }
        };

        debug!(recipient = %recipient.id, tag, %round, id = %identity.id,
            "sent single-use request");

        // Arm the timeout with whatever is left of the caller's budget after the send.
        let remaining = params.timeout.saturating_sub(started.elapsed());
        spawn_timeout(
            self.pending.clone(),
            self.transport.clone(),
            identity.id,
            remaining,
        );

        Ok((round, identity))
    }

    /// Tear down a partially registered exchange without firing its callback; the error goes
    /// back to the caller directly.
    fn unwind(&self, id: &RecipientId) {
        self.transport.delete_fingerprints(id);
        self.transport.delete_identity(id);
        if let Some(exchange) = self.pending.remove(id) {
            exchange.cancel_token().cancel();
            drop(exchange.take_callback());
        }
    }

    #[cfg(any(test, feature = "test_utils"))]
    pub fn pending_exchanges(&self) -> usize {
        self.pending.len()
    }
}

/// Routes one arriving response part into its exchange: consume the fingerprint, decrypt, feed
/// the collator, and resolve the exchange on full collation.
struct ResponseProcessor {
    pending: Arc<PendingExchanges>,
    transport: Arc<dyn Transport>,
    tag: String,
}

impl CiphertextHandler for ResponseProcessor {
    fn process(&self, message: Delivered, receiver: RecipientId) {
        let Some(exchange) = self.pending.get(&receiver) else {
            debug!(%receiver, "response part for a resolved exchange, dropping");
            return;
        };

        let Some(index) = exchange.fingerprints().index_of(&message.fingerprint) else {
            warn!(%receiver, fingerprint = %message.fingerprint,
                "response part with unknown fingerprint, dropping");
            return;
        };

        let Some(cypher) = exchange.cyphers().get(index as usize) else {
            return;
        };

        let plaintext = match cypher.decrypt(&message.payload, &message.mac) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!(%receiver, tag = %self.tag, %err, "dropping response part");
                return;
            }
        };

        // Consume the fingerprint only after authentication, so garbage cannot burn it.
        if exchange.fingerprints().pop(&message.fingerprint).is_none() {
            debug!(%receiver, "fingerprint consumed by a racing delivery, dropping");
            return;
        }

        exchange.rounds().record(message.round);

        match exchange.collator().collate(&plaintext) {
            Ok(Some(payload)) => {
                debug!(%receiver, tag = %self.tag, "response fully collated");
                let rounds = exchange.rounds().take();
                drop(exchange);
                complete(
                    &self.pending,
                    self.transport.as_ref(),
                    &receiver,
                    Ok(Response { payload, rounds }),
                );
            }
            Ok(None) => {}
            Err(err) => {
                warn!(%receiver, tag = %self.tag, %err, "failed to collate response part");
            }
        }
    }
}
