// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use capsule_core::{RecipientId, RoundId};
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::collator::{Collator, CollatorError};
use crate::crypto::{Cypher, CypherError, Fingerprint, PublicKey, Role, SecretKey, SharedSecret};
use crate::error::ExchangeError;
use crate::fingerprints::FingerprintMap;
use crate::message::{
    MessageError, Request, RequestPart, RequestPayload, ResponsePart,
    response_part_contents_size,
};
use crate::round::track_rounds;
use crate::traits::{CiphertextHandler, Delivered, Service, Transport, TransportError};

/// Capacity of the channel surfacing incoming requests to the embedding client.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Register a single-use request service under `(local_id, tag)`.
///
/// Inbound requests are decrypted, verified and surfaced on the returned channel as
/// [`IncomingRequest`] values; garbage and messages failing authentication are dropped with a
/// log line and never answered, so a misbehaving sender learns nothing. Dropping or stopping
/// the [`Listener`] deregisters the service.
pub fn listen(
    transport: Arc<dyn Transport>,
    tag: &str,
    local_id: RecipientId,
    secret_key: SecretKey,
) -> Result<(Listener, mpsc::Receiver<IncomingRequest>), ExchangeError> {
    let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);

    let service = Service {
        identifier: local_id,
        tag: tag.to_string(),
    };

    let handler = Arc::new(RequestListener {
        tag: tag.to_string(),
        local_id,
        secret_key,
        transport: transport.clone(),
        requests: requests_tx,
    });

    transport.register_service(service.clone(), handler)?;
    debug!(id = %local_id, tag, "listening for single-use requests");

    Ok((
        Listener {
            service,
            transport,
            stopped: AtomicBool::new(false),
        },
        requests_rx,
    ))
}

/// Handle on a registered request service.
pub struct Listener {
    service: Service,
    transport: Arc<dyn Transport>,
    stopped: AtomicBool,
}

impl Listener {
    /// Deregister the service. Safe to call more than once; also happens on drop.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.transport.delete_service(&self.service);
            // Also drop any request-part fingerprints of requests still being collated.
            self.transport.delete_fingerprints(&self.service.identifier);
            debug!(id = %self.service.identifier, tag = %self.service.tag, "stopped listening");
        }
    }

    /// The service this listener is registered under.
    pub fn service(&self) -> &Service {
        &self.service
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One decrypted single-use request, carrying the reply capability.
///
/// The shared secret lives only inside this value; once it is dropped the exchange is
/// unreachable for good.
pub struct IncomingRequest {
    partner: RecipientId,
    partner_public_key: PublicKey,
    shared_secret: SharedSecret,
    tag: String,
    max_response_parts: u8,
    payload: Vec<u8>,
    used: AtomicBool,
    transport: Arc<dyn Transport>,
}

impl IncomingRequest {
    /// The request payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Ephemeral reception identity the response goes back to.
    pub fn partner(&self) -> &RecipientId {
        &self.partner
    }

    /// Ephemeral public key the request arrived under.
    pub fn partner_public_key(&self) -> &PublicKey {
        &self.partner_public_key
    }

    /// Tag of the service the request was addressed to.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Number of reply parts the requester is prepared to collect.
    pub fn max_response_parts(&self) -> u8 {
        self.max_response_parts
    }

    /// Capacity of one reply part.
    pub fn max_response_part_size(&self) -> usize {
        response_part_contents_size(self.transport.max_message_length())
    }

    /// Maximum size of the entire reply payload.
    pub fn max_response_length(&self) -> usize {
        self.max_response_part_size() * usize::from(self.max_response_parts)
    }

    /// Send the reply. Splits `payload` into parts, encrypts each independently with its
    /// index-derived cypher, sends all parts concurrently and waits for delivery confirmation
    /// of every involved round.
    ///
    /// At most one response may ever reach the requester: a second call fails without sending
    /// any traffic. A failed call releases the guard again, since an aborted send leaves
    /// nothing collatable on the far end and the caller is expected to retry the whole reply.
    pub async fn respond(
        &self,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<RoundId>, ExchangeError> {
        if self
            .used
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ExchangeError::AlreadyResponded);
        }

        match self.send_response(payload, timeout).await {
            Ok(rounds) => Ok(rounds),
            Err(err) => {
                self.used.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    async fn send_response(
        &self,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<RoundId>, ExchangeError> {
        let max_length = self.max_response_length();
        if payload.len() > max_length {
            return Err(ExchangeError::PayloadTooLarge {
                size: payload.len(),
                max: max_length,
            });
        }

        let parts = partition_response(payload, self.max_response_part_size());

        debug!(partner = %self.partner, tag = %self.tag, parts = parts.len(),
            "sending single-use response");

        let num_parts = parts.len() as u8;
        let sends = parts.into_iter().enumerate().map(|(index, contents)| {
            let transport = self.transport.clone();
            let partner = self.partner;
            let cypher = Cypher::derive(&self.shared_secret, index as u64, Role::Response);

            async move {
                let mut part = ResponsePart::new(transport.max_message_length())?;
                part.set_part_number(index as u8);
                part.set_max_parts(num_parts);
                part.set_contents(&contents)?;

                let (fingerprint, ciphertext, mac) = cypher.encrypt(part.as_bytes());
                let round = transport
                    .send(partner, fingerprint, None, ciphertext, mac)
                    .await?;

                Ok::<RoundId, ExchangeError>(round)
            }
        });

        let mut rounds = Vec::new();
        let mut failures = 0;
        for result in join_all(sends).await {
            match result {
                Ok(round) => rounds.push(round),
                Err(err) => {
                    error!(partner = %self.partner, tag = %self.tag, %err,
                        "failed to send single-use response part");
                    failures += 1;
                }
            }
        }

        // A partially delivered response can never be collated; fail the whole call.
        if failures > 0 {
            return Err(ExchangeError::PartSendsFailed(failures));
        }

        track_rounds(self.transport.as_ref(), &rounds, timeout).await?;

        debug!(partner = %self.partner, tag = %self.tag, rounds = rounds.len(),
            "single-use response delivered");

        Ok(rounds)
    }
}

impl fmt::Debug for IncomingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingRequest")
            .field("partner", &self.partner)
            .field("tag", &self.tag)
            .field("max_response_parts", &self.max_response_parts)
            .field("payload_len", &self.payload.len())
            .field("used", &self.used.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Break a reply payload into per-part contents. An empty payload still yields one empty part,
/// so the requester receives an answer rather than a timeout.
fn partition_response(payload: &[u8], part_size: usize) -> Vec<Vec<u8>> {
    if payload.is_empty() {
        return vec![Vec::new()];
    }

    payload
        .chunks(part_size)
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Service handler decrypting inbound single-use requests.
struct RequestListener {
    tag: String,
    local_id: RecipientId,
    secret_key: SecretKey,
    transport: Arc<dyn Transport>,
    requests: mpsc::Sender<IncomingRequest>,
}

impl CiphertextHandler for RequestListener {
    fn process(&self, message: Delivered, _receiver: RecipientId) {
        if let Err(err) = self.handle(message) {
            // Never answer a message that fails verification; a decryption oracle would be
            // worth more to an attacker than the dropped request is to us.
            warn!(id = %self.local_id, tag = %self.tag, %err, "dropping single-use request");
        }
    }
}

impl RequestListener {
    fn handle(&self, message: Delivered) -> Result<(), ListenError> {
        let request = Request::unmarshal(&message.payload)?;
        let partner_public_key = request.public_key();

        // Both sides arrive at the same secret: they combine our static public key with their
        // ephemeral secret, we combine their ephemeral public key with our static secret.
        let shared_secret = self.secret_key.shared_secret(&partner_public_key);

        let cypher = Cypher::derive(&shared_secret, 0, Role::Transmit);
        let plaintext = cypher.decrypt(request.payload(), &message.mac)?;

        let payload = RequestPayload::unmarshal(&plaintext)?;
        let partner = RecipientId::derive(partner_public_key.as_bytes(), payload.as_bytes());

        let num_parts = payload.num_request_parts();
        if num_parts <= 1 {
            debug!(id = %self.local_id, tag = %self.tag, %partner, "received single-use request");
            return self.surface(
                partner,
                partner_public_key,
                shared_secret,
                payload.max_response_parts(),
                payload.contents().to_vec(),
            );
        }

        // The sender declared supplementary request parts; collate them before surfacing.
        debug!(id = %self.local_id, tag = %self.tag, %partner, num_parts,
            "received first part of a multi-part single-use request");
        self.collate_request_parts(partner, partner_public_key, shared_secret, payload)
    }

    fn surface(
        &self,
        partner: RecipientId,
        partner_public_key: PublicKey,
        shared_secret: SharedSecret,
        max_response_parts: u8,
        payload: Vec<u8>,
    ) -> Result<(), ListenError> {
        let request = IncomingRequest {
            partner,
            partner_public_key,
            shared_secret,
            tag: self.tag.clone(),
            max_response_parts,
            payload,
            used: AtomicBool::new(false),
            transport: self.transport.clone(),
        };

        self.requests
            .try_send(request)
            .map_err(|_| ListenError::Channel)
    }

    /// Provision for senders that split a request over several messages: register one
    /// fingerprint per remaining part and surface the request once everything arrived.
    fn collate_request_parts(
        &self,
        partner: RecipientId,
        partner_public_key: PublicKey,
        shared_secret: SharedSecret,
        payload: RequestPayload,
    ) -> Result<(), ListenError> {
        let num_parts = payload.num_request_parts();

        let collator = Collator::new(num_parts);
        collator.insert(0, num_parts, payload.contents())?;

        // Part numbers and derivation indices of supplementary parts start at 1; the first
        // part travelled inside the request payload itself.
        let cyphers: Vec<Cypher> = (1..u64::from(num_parts))
            .map(|index| Cypher::derive(&shared_secret, index, Role::RequestPart))
            .collect();

        let processor = Arc::new(RequestPartProcessor {
            tag: self.tag.clone(),
            partner,
            partner_public_key,
            shared_secret,
            max_response_parts: payload.max_response_parts(),
            num_parts,
            fingerprints: FingerprintMap::new(&cyphers),
            cyphers,
            collator,
            transport: self.transport.clone(),
            requests: self.requests.clone(),
        });

        for (registered, cypher) in processor.cyphers.iter().enumerate() {
            if let Err(err) = self.transport.register_fingerprint(
                self.local_id,
                cypher.fingerprint(),
                processor.clone(),
            ) {
                for cypher in &processor.cyphers[..registered] {
                    self.transport
                        .delete_fingerprint(&self.local_id, &cypher.fingerprint());
                }
                return Err(err.into());
            }
        }

        Ok(())
    }
}

/// Collates the supplementary parts of a multi-part request.
struct RequestPartProcessor {
    tag: String,
    partner: RecipientId,
    partner_public_key: PublicKey,
    shared_secret: SharedSecret,
    max_response_parts: u8,
    num_parts: u8,
    fingerprints: FingerprintMap,
    cyphers: Vec<Cypher>,
    collator: Collator,
    transport: Arc<dyn Transport>,
    requests: mpsc::Sender<IncomingRequest>,
}

impl CiphertextHandler for RequestPartProcessor {
    fn process(&self, message: Delivered, receiver: RecipientId) {
        if let Err(err) = self.handle(message, receiver) {
            warn!(tag = %self.tag, partner = %self.partner, %err,
                "dropping single-use request part");
        }
    }
}

impl RequestPartProcessor {
    fn handle(&self, message: Delivered, receiver: RecipientId) -> Result<(), ListenError> {
        let Some(index) = self.fingerprints.index_of(&message.fingerprint) else {
            return Err(ListenError::UnknownFingerprint(message.fingerprint));
        };

        let plaintext = self.cyphers[index as usize].decrypt(&message.payload, &message.mac)?;

        if self.fingerprints.pop(&message.fingerprint).is_none() {
            // A racing delivery of the same part got here first.
            return Ok(());
        }

        let part = RequestPart::unmarshal(&plaintext)?;
        let Some(payload) =
            self.collator
                .insert(part.part_number(), self.num_parts, part.contents())?
        else {
            return Ok(());
        };

        for cypher in self.cyphers.iter() {
            self.transport
                .delete_fingerprint(&receiver, &cypher.fingerprint());
        }

        debug!(tag = %self.tag, partner = %self.partner, num_parts = self.num_parts,
            "multi-part single-use request fully collated");

        let request = IncomingRequest {
            partner: self.partner,
            partner_public_key: self.partner_public_key,
            shared_secret: self.shared_secret.clone(),
            tag: self.tag.clone(),
            max_response_parts: self.max_response_parts,
            payload,
            used: AtomicBool::new(false),
            transport: self.transport.clone(),
        };

        self.requests
            .try_send(request)
            .map_err(|_| ListenError::Channel)
    }
}

/// Reasons an inbound message gets dropped at the listening boundary. Recovered locally: an
/// open network guarantees noise.
#[derive(Debug, Error)]
enum ListenError {
    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Cypher(#[from] CypherError),

    #[error(transparent)]
    Collator(#[from] CollatorError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("message carries unknown fingerprint {0}")]
    UnknownFingerprint(Fingerprint),

    #[error("request channel is closed or full")]
    Channel,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use capsule_core::RecipientId;

    use crate::crypto::{Cypher, Mac, Rng, Role, SecretKey};
    use crate::message::{Request, RequestPart, RequestPayload};
    use crate::test_utils::MemoryTransport;
    use crate::traits::{Service, Transport};

    use super::{listen, partition_response};

    fn local_secret() -> SecretKey {
        SecretKey::generate(&Rng::from_seed([1; 32])).unwrap()
    }

    #[tokio::test]
    async fn stop_deregisters_the_service() {
        let transport = MemoryTransport::new(512);
        let local_id = RecipientId::from_bytes([7; 32]);

        let (listener, _requests) = listen(
            transport.clone(),
            "test tag",
            local_id,
            local_secret(),
        )
        .unwrap();
        assert_eq!(transport.registered_services(), 1);

        listener.stop();
        assert_eq!(transport.registered_services(), 0);

        // Stopping again is a no-op.
        listener.stop();
        assert_eq!(transport.registered_services(), 0);
    }

    #[tokio::test]
    async fn garbage_is_dropped_without_a_response() {
        let transport = MemoryTransport::new(512);
        let local_id = RecipientId::from_bytes([7; 32]);

        let (_listener, mut requests) = listen(
            transport.clone(),
            "test tag",
            local_id,
            local_secret(),
        )
        .unwrap();

        // Deliver unparseable bytes to the service.
        let rng = Rng::from_seed([2; 32]);
        let sender = SecretKey::generate(&rng).unwrap();
        let junk_cypher = Cypher::derive(
            &sender.shared_secret(&local_secret().public_key()),
            0,
            Role::Transmit,
        );
        transport
            .send(
                local_id,
                junk_cypher.fingerprint(),
                Some(Service {
                    identifier: local_id,
                    tag: "test tag".to_string(),
                }),
                vec![1, 2, 3],
                Mac::from_bytes([0; 16]),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(requests.try_recv().is_err());
        assert_eq!(transport.sent_messages(), 1);
    }

    #[tokio::test]
    async fn tampered_request_is_dropped() {
        let transport = MemoryTransport::new(512);
        let local_id = RecipientId::from_bytes([7; 32]);
        let local_key = local_secret();

        let (_listener, mut requests) = listen(
            transport.clone(),
            "test tag",
            local_id,
            local_key.clone(),
        )
        .unwrap();

        // A well-formed request whose MAC does not verify.
        let rng = Rng::from_seed([3; 32]);
        let sender = SecretKey::generate(&rng).unwrap();
        let shared = sender.shared_secret(&local_key.public_key());

        let mut request = Request::new(512).unwrap();
        let mut payload = RequestPayload::new(request.payload_size(), b"hello", 1).unwrap();
        payload.set_nonce(&rng).unwrap();

        let cypher = Cypher::derive(&shared, 0, Role::Transmit);
        let (fingerprint, ciphertext, _mac) = cypher.encrypt(payload.as_bytes());
        request.set_public_key(&sender.public_key());
        request.set_payload(&ciphertext).unwrap();

        transport
            .send(
                local_id,
                fingerprint,
                Some(Service {
                    identifier: local_id,
                    tag: "test tag".to_string(),
                }),
                request.into_bytes(),
                Mac::from_bytes([0xaa; 16]),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn multi_part_request_is_collated_before_surfacing() {
        let transport = MemoryTransport::new(512);
        let local_id = RecipientId::from_bytes([7; 32]);
        let local_key = local_secret();

        let (_listener, mut requests) = listen(
            transport.clone(),
            "test tag",
            local_id,
            local_key.clone(),
        )
        .unwrap();

        let rng = Rng::from_seed([4; 32]);
        let sender = SecretKey::generate(&rng).unwrap();
        let shared = sender.shared_secret(&local_key.public_key());

        // First part rides inside the request payload and declares one more part.
        let mut request = Request::new(512).unwrap();
        let mut payload =
            RequestPayload::new(request.payload_size(), b"first half, ", 1).unwrap();
        payload.set_num_request_parts(2);
        payload.set_nonce(&rng).unwrap();

        let cypher = Cypher::derive(&shared, 0, Role::Transmit);
        let (fingerprint, ciphertext, mac) = cypher.encrypt(payload.as_bytes());
        request.set_public_key(&sender.public_key());
        request.set_payload(&ciphertext).unwrap();

        transport
            .send(
                local_id,
                fingerprint,
                Some(Service {
                    identifier: local_id,
                    tag: "test tag".to_string(),
                }),
                request.into_bytes(),
                mac,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        // Nothing surfaces until the second part arrives.
        assert!(requests.try_recv().is_err());
        assert_eq!(transport.registered_fingerprints(), 1);

        // The supplementary part is encrypted under derivation index 1.
        let part_cypher = Cypher::derive(&shared, 1, Role::RequestPart);
        let mut part = RequestPart::new(512).unwrap();
        part.set_part_number(1);
        part.set_contents(b"second half").unwrap();
        let (part_fingerprint, part_ciphertext, part_mac) = part_cypher.encrypt(part.as_bytes());

        transport
            .send(local_id, part_fingerprint, None, part_ciphertext, part_mac)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        let incoming = requests.try_recv().unwrap();
        assert_eq!(incoming.payload(), b"first half, second half");
        assert_eq!(transport.registered_fingerprints(), 0);
    }

    #[test]
    fn partition_covers_the_payload_exactly() {
        let parts = partition_response(b"abcdefgh", 3);
        assert_eq!(parts, vec![b"abc".to_vec(), b"def".to_vec(), b"gh".to_vec()]);

        // An empty payload still produces one (empty) part.
        assert_eq!(partition_response(b"", 3), vec![Vec::<u8>::new()]);
    }
}
