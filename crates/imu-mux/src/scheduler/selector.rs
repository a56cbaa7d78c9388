use std::cmp::Ordering;

use quanta::Instant;

use crate::scheduler::registry::{StreamDescriptor, StreamId};

/// Per-unit-weight service lag of a stream at `now`. Lower is more urgent.
///
/// `deserved = weight * seconds waited` is the credit a stream has accrued
/// since its current wait began; the lag is how far its sends run ahead of
/// that credit, per unit of weight. Dividing by the weight puts streams of
/// different weight on one scale, which is what makes the send ratio under a
/// backlog follow the weights. Sends are counted by
/// [`StreamDescriptor::virtual_service`], which only covers the current busy
/// period, so history from before a backlog cannot starve anyone.
pub fn lag_score(stream: &StreamDescriptor, now: Instant) -> f64 {
    let waited = now
        .saturating_duration_since(stream.waiting_since())
        .as_secs_f64();
    stream.virtual_service() - waited
}

/// Picks the stream that should send next among `ready`.
///
/// A single ready stream is returned without scoring. Otherwise the stream
/// with the lowest [`lag_score`] wins; equal scores go to the lowest id.
pub fn select_next(ready: &[&StreamDescriptor], now: Instant) -> Option<StreamId> {
    match ready {
        [] => None,
        [only] => Some(only.id()),
        _ => {
            let mut best: Option<(StreamId, f64)> = None;
            for stream in ready {
                let score = lag_score(stream, now);
                best = match best {
                    None => Some((stream.id(), score)),
                    Some((best_id, best_score)) => match score.total_cmp(&best_score) {
                        Ordering::Less => Some((stream.id(), score)),
                        Ordering::Equal if stream.id() < best_id => Some((stream.id(), score)),
                        _ => best,
                    },
                };
            }
            best.map(|(id, _)| id)
        }
    }
}
