// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use capsule_core::RecipientId;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::collator::Collator;
use crate::crypto::{Cypher, Role, SharedSecret, make_cyphers};
use crate::error::ExchangeError;
use crate::fingerprints::FingerprintMap;
use crate::round::RoundCollector;
use crate::transmit::{Response, ResponseCallback};
use crate::traits::Transport;

/// State of one in-flight outbound exchange.
///
/// Created on send, destroyed on completion or timeout; keyed by the exchange's ephemeral
/// reception identity. Holds everything needed to turn arriving response parts into the one
/// result the caller is waiting for. Each field guards itself, so independent delivery tasks
/// progress without a shared lock.
pub(crate) struct Exchange {
    cyphers: Vec<Cypher>,
    fingerprints: FingerprintMap,
    collator: Collator,
    rounds: RoundCollector,
    callback: Mutex<Option<ResponseCallback>>,
    cancel: CancellationToken,
}

impl Exchange {
    pub fn new(shared_secret: &SharedSecret, max_parts: u8, callback: ResponseCallback) -> Self {
        let cyphers = make_cyphers(shared_secret, max_parts, Role::Response);
        let fingerprints = FingerprintMap::new(&cyphers);

        Self {
            cyphers,
            fingerprints,
            collator: Collator::new(max_parts),
            rounds: RoundCollector::new(),
            callback: Mutex::new(Some(callback)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cyphers(&self) -> &[Cypher] {
        &self.cyphers
    }

    pub fn fingerprints(&self) -> &FingerprintMap {
        &self.fingerprints
    }

    pub fn collator(&self) -> &Collator {
        &self.collator
    }

    pub fn rounds(&self) -> &RoundCollector {
        &self.rounds
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Take the one-shot completion callback. Succeeds at most once per exchange, from
    /// whichever concurrent context gets here first.
    pub fn take_callback(&self) -> Option<ResponseCallback> {
        self.callback.lock().ok().and_then(|mut cb| cb.take())
    }
}

/// Concurrent registry of in-flight outbound exchanges.
///
/// The map-wide lock only guards membership; all per-exchange state carries its own lock so
/// unrelated exchanges never contend.
#[derive(Default)]
pub(crate) struct PendingExchanges {
    exchanges: Mutex<HashMap<RecipientId, Arc<Exchange>>>,
}

impl PendingExchanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new exchange. A duplicate reception identity is rejected: it indicates an
    /// ID-space collision or a replayed send, never something to silently overwrite.
    pub fn insert(&self, id: RecipientId, exchange: Arc<Exchange>) -> Result<(), ExchangeError> {
        let mut exchanges = self
            .exchanges
            .lock()
            .map_err(|_| ExchangeError::ExchangeExists(id))?;

        if exchanges.contains_key(&id) {
            return Err(ExchangeError::ExchangeExists(id));
        }

        exchanges.insert(id, exchange);
        Ok(())
    }

    pub fn get(&self, id: &RecipientId) -> Option<Arc<Exchange>> {
        self.exchanges.lock().ok()?.get(id).cloned()
    }

    /// Remove an exchange. Returns `None` when a racing completion or timeout already removed
    /// it, making the loser of the race a no-op.
    pub fn remove(&self, id: &RecipientId) -> Option<Arc<Exchange>> {
        self.exchanges.lock().ok()?.remove(id)
    }

    #[cfg(any(test, feature = "test_utils"))]
    pub fn len(&self) -> usize {
        self.exchanges.lock().map(|map| map.len()).unwrap_or(0)
    }
}

/// Start the timeout task of an exchange.
///
/// Exactly one of two terminal events resolves an exchange: a completion cancels the token and
/// the timer stops without a second callback invocation, or the timer fires first, removes the
/// registry entry (a no-op against a racing completion) and reports the timeout. Whichever
/// loses the race finds the callback already taken.
pub(crate) fn spawn_timeout(
    pending: Arc<PendingExchanges>,
    transport: Arc<dyn Transport>,
    id: RecipientId,
    timeout: Duration,
) {
    // The exchange may already have completed before the timer got started.
    let Some(exchange) = pending.get(&id) else {
        debug!(%id, "exchange already resolved, no timeout to arm");
        return;
    };
    let cancel = exchange.cancel_token().clone();
    drop(exchange);

    tokio::spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(%id, "exchange completed, timeout stopped");
            }
            () = tokio::time::sleep(timeout) => {
                let Some(exchange) = pending.remove(&id) else {
                    return;
                };

                transport.delete_fingerprints(&id);
                transport.delete_identity(&id);

                if let Some(callback) = exchange.take_callback() {
                    debug!(%id, ?timeout, "exchange timed out");
                    callback(Err(ExchangeError::Timeout(timeout)));
                }
            }
        }
    });
}

/// Resolve an exchange from the completion side: remove it, stop the timer, tear down the
/// transport registrations and fire the callback if the timeout has not won the race.
pub(crate) fn complete(
    pending: &PendingExchanges,
    transport: &dyn Transport,
    id: &RecipientId,
    result: Result<Response, ExchangeError>,
) {
    let Some(exchange) = pending.remove(id) else {
        return;
    };

    exchange.cancel_token().cancel();
    transport.delete_fingerprints(id);
    transport.delete_identity(id);

    if let Some(callback) = exchange.take_callback() {
        callback(result);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use capsule_core::RecipientId;

    use crate::crypto::{Rng, SecretKey};
    use crate::error::ExchangeError;
    use crate::test_utils::MemoryTransport;
    use crate::transmit::Response;

    use super::{Exchange, PendingExchanges, complete, spawn_timeout};

    fn shared_secret() -> crate::crypto::SharedSecret {
        let rng = Rng::from_seed([1; 32]);
        let ours = SecretKey::generate(&rng).unwrap();
        let theirs = SecretKey::generate(&rng).unwrap();
        ours.shared_secret(&theirs.public_key())
    }

    fn counting_exchange(counter: Arc<AtomicUsize>) -> Arc<Exchange> {
        Arc::new(Exchange::new(
            &shared_secret(),
            3,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        ))
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let pending = PendingExchanges::new();
        let id = RecipientId::from_bytes([1; 32]);
        let counter = Arc::new(AtomicUsize::new(0));

        pending.insert(id, counting_exchange(counter.clone())).unwrap();

        let result = pending.insert(id, counting_exchange(counter));
        assert!(matches!(result, Err(ExchangeError::ExchangeExists(_))));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn timeout_fires_once_and_removes_the_entry() {
        let pending = Arc::new(PendingExchanges::new());
        let transport = MemoryTransport::new(512);
        let id = RecipientId::from_bytes([2; 32]);
        let counter = Arc::new(AtomicUsize::new(0));

        pending.insert(id, counting_exchange(counter.clone())).unwrap();
        spawn_timeout(
            pending.clone(),
            transport.clone(),
            id,
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pending.len(), 0);

        // A late completion is a no-op.
        complete(
            &pending,
            transport.as_ref(),
            &id,
            Ok(Response {
                payload: vec![],
                rounds: vec![],
            }),
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn completion_stops_the_timer() {
        let pending = Arc::new(PendingExchanges::new());
        let transport = MemoryTransport::new(512);
        let id = RecipientId::from_bytes([3; 32]);
        let counter = Arc::new(AtomicUsize::new(0));

        pending.insert(id, counting_exchange(counter.clone())).unwrap();
        spawn_timeout(
            pending.clone(),
            transport.clone(),
            id,
            Duration::from_millis(20),
        );

        complete(
            &pending,
            transport.as_ref(),
            &id,
            Ok(Response {
                payload: b"done".to_vec(),
                rounds: vec![],
            }),
        );

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pending.len(), 0);

        // Wait past the timeout; the timer must not fire a second callback.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_completion_and_timeout_fire_exactly_once() {
        let transport = MemoryTransport::new(512);

        for attempt in 0..50u64 {
            let pending = Arc::new(PendingExchanges::new());
            let id = RecipientId::from_bytes([4; 32]);
            let counter = Arc::new(AtomicUsize::new(0));

            pending.insert(id, counting_exchange(counter.clone())).unwrap();

            // A timeout short enough that completion and expiry genuinely race.
            spawn_timeout(
                pending.clone(),
                transport.clone(),
                id,
                Duration::from_micros(attempt * 20),
            );

            let completer = {
                let pending = pending.clone();
                let transport = transport.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_micros(500)).await;
                    complete(
                        &pending,
                        transport.as_ref(),
                        &id,
                        Ok(Response {
                            payload: vec![],
                            rounds: vec![],
                        }),
                    );
                })
            };

            completer.await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;

            // Whichever side won, the callback fired exactly once and the entry is gone.
            assert_eq!(counter.load(Ordering::SeqCst), 1);
            assert_eq!(pending.len(), 0);
        }
    }
}
