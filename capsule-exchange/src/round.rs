// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Mutex;
use std::time::Duration;

use capsule_core::RoundId;
use futures_util::future::join_all;

use crate::error::ExchangeError;
use crate::traits::{RoundResult, Transport};

/// Per-exchange set of delivery rounds observed while collecting a response.
///
/// Rounds are deduplicated on insert; independent delivery tasks record concurrently.
#[derive(Debug, Default)]
pub(crate) struct RoundCollector {
    rounds: Mutex<Vec<RoundId>>,
}

impl RoundCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observed delivery round.
    pub fn record(&self, round: RoundId) {
        if let Ok(mut rounds) = self.rounds.lock() {
            if !rounds.contains(&round) {
                rounds.push(round);
            }
        }
    }

    /// Drain the recorded rounds.
    pub fn take(&self) -> Vec<RoundId> {
        self.rounds
            .lock()
            .map(|mut rounds| std::mem::take(&mut *rounds))
            .unwrap_or_default()
    }
}

/// Wait for delivery confirmation of every distinct round involved in a send.
///
/// Any failure or timeout fails the whole operation: partial delivery leaves an uncollatable
/// payload on the far end, so the caller must retry the entire send, never a partial resend.
pub(crate) async fn track_rounds(
    transport: &dyn Transport,
    rounds: &[RoundId],
    timeout: Duration,
) -> Result<(), ExchangeError> {
    let mut distinct: Vec<RoundId> = Vec::with_capacity(rounds.len());
    for round in rounds {
        if !distinct.contains(round) {
            distinct.push(*round);
        }
    }

    let results = join_all(
        distinct
            .iter()
            .map(|round| transport.round_result(*round, timeout)),
    )
    .await;

    let failed = results
        .iter()
        .filter(|result| **result == RoundResult::Failed)
        .count();
    let timed_out = results
        .iter()
        .filter(|result| **result == RoundResult::TimedOut)
        .count();

    if failed > 0 || timed_out > 0 {
        return Err(ExchangeError::RoundsFailed { failed, timed_out });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use capsule_core::RoundId;

    use super::RoundCollector;

    #[test]
    fn rounds_are_deduplicated() {
        let collector = RoundCollector::new();

        collector.record(RoundId(1));
        collector.record(RoundId(2));
        collector.record(RoundId(1));

        assert_eq!(collector.take(), vec![RoundId(1), RoundId(2)]);

        // Taking drains the collector.
        assert!(collector.take().is_empty());
    }
}
