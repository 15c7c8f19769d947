// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory loopback transport for tests.
//!
//! Mirrors the delivery model of a real anonymous transport: every sent message is dispatched
//! to its registered handler on an independent tokio task, so handlers run concurrently exactly
//! like they would against a live network. Rounds always succeed unless failure injection is
//! switched on.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use capsule_core::{RecipientId, RoundId};
use tracing::trace;

use crate::crypto::{Fingerprint, Mac};
use crate::traits::{
    CiphertextHandler, Delivered, EphemeralIdentity, RoundResult, Service, Transport,
    TransportError,
};

#[derive(Default)]
struct RoutingTables {
    fingerprints: HashMap<(RecipientId, Fingerprint), Arc<dyn CiphertextHandler>>,
    services: HashMap<(RecipientId, String), Arc<dyn CiphertextHandler>>,
    identities: HashMap<RecipientId, EphemeralIdentity>,
}

/// Process-local transport delivering messages straight back into registered handlers.
pub struct MemoryTransport {
    max_message_length: usize,
    tables: Mutex<RoutingTables>,
    next_round: AtomicU64,
    sent: AtomicUsize,
    fail_sends: AtomicBool,
    fail_rounds: AtomicBool,
}

impl MemoryTransport {
    pub fn new(max_message_length: usize) -> Arc<Self> {
        Arc::new(Self {
            max_message_length,
            tables: Mutex::new(RoutingTables::default()),
            next_round: AtomicU64::new(1),
            sent: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
            fail_rounds: AtomicBool::new(false),
        })
    }

    /// Make every subsequent `send` fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent round report failure.
    pub fn fail_rounds(&self, fail: bool) {
        self.fail_rounds.store(fail, Ordering::SeqCst);
    }

    /// Number of messages handed over for delivery so far.
    pub fn sent_messages(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Number of currently registered fingerprints.
    pub fn registered_fingerprints(&self) -> usize {
        self.tables.lock().map(|t| t.fingerprints.len()).unwrap_or(0)
    }

    /// Number of currently registered services.
    pub fn registered_services(&self) -> usize {
        self.tables.lock().map(|t| t.services.len()).unwrap_or(0)
    }

    /// Number of currently registered reception identities.
    pub fn registered_identities(&self) -> usize {
        self.tables.lock().map(|t| t.identities.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    async fn send(
        &self,
        recipient: RecipientId,
        fingerprint: Fingerprint,
        service: Option<Service>,
        payload: Vec<u8>,
        mac: Mac,
    ) -> Result<RoundId, TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed(
                "injected send failure".to_string(),
            ));
        }

        let round = RoundId(self.next_round.fetch_add(1, Ordering::SeqCst));
        self.sent.fetch_add(1, Ordering::SeqCst);

        // Route by fingerprint first; unsolicited messages fall back to the addressed service.
        let handler = {
            let tables = self
                .tables
                .lock()
                .map_err(|_| TransportError::SendFailed("routing tables poisoned".to_string()))?;

            tables
                .fingerprints
                .get(&(recipient, fingerprint))
                .cloned()
                .or_else(|| {
                    service.as_ref().and_then(|service| {
                        tables
                            .services
                            .get(&(service.identifier, service.tag.clone()))
                            .cloned()
                    })
                })
        };

        match handler {
            Some(handler) => {
                // One independent task per delivery, like the real network.
                tokio::spawn(async move {
                    handler.process(
                        Delivered {
                            fingerprint,
                            payload,
                            mac,
                            round,
                        },
                        recipient,
                    );
                });
            }
            None => {
                trace!(%recipient, %fingerprint, "no handler, message vanishes");
            }
        }

        Ok(round)
    }

    fn register_fingerprint(
        &self,
        receiver: RecipientId,
        fingerprint: Fingerprint,
        handler: Arc<dyn CiphertextHandler>,
    ) -> Result<(), TransportError> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| TransportError::FingerprintInUse(fingerprint))?;

        if tables.fingerprints.contains_key(&(receiver, fingerprint)) {
            return Err(TransportError::FingerprintInUse(fingerprint));
        }

        tables.fingerprints.insert((receiver, fingerprint), handler);
        Ok(())
    }

    fn delete_fingerprint(&self, receiver: &RecipientId, fingerprint: &Fingerprint) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.fingerprints.remove(&(*receiver, *fingerprint));
        }
    }

    fn delete_fingerprints(&self, receiver: &RecipientId) {
        if let Ok(mut tables) = self.tables.lock() {
            tables
                .fingerprints
                .retain(|(id, _), _| id != receiver);
        }
    }

    fn register_service(
        &self,
        service: Service,
        handler: Arc<dyn CiphertextHandler>,
    ) -> Result<(), TransportError> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| TransportError::ServiceInUse {
                identifier: service.identifier,
                tag: service.tag.clone(),
            })?;

        let key = (service.identifier, service.tag.clone());
        if tables.services.contains_key(&key) {
            return Err(TransportError::ServiceInUse {
                identifier: service.identifier,
                tag: service.tag,
            });
        }

        tables.services.insert(key, handler);
        Ok(())
    }

    fn delete_service(&self, service: &Service) {
        if let Ok(mut tables) = self.tables.lock() {
            tables
                .services
                .remove(&(service.identifier, service.tag.clone()));
        }
    }

    fn register_identity(&self, identity: EphemeralIdentity) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.identities.insert(identity.id, identity);
        }
    }

    fn delete_identity(&self, id: &RecipientId) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.identities.remove(id);
        }
    }

    async fn round_result(&self, _round: RoundId, _timeout: Duration) -> RoundResult {
        if self.fail_rounds.load(Ordering::SeqCst) {
            RoundResult::Failed
        } else {
            RoundResult::Succeeded
        }
    }
}
