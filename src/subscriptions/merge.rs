//! Reduce many subscribers' payloads to one demand per topic.

use crate::types::{PreloadType, SubscribePayload, SubscriberId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Widest demand seen so far for one topic.
#[derive(Default)]
struct TopicDemand {
    preload_type: PreloadType,
    /// `None` = all fields.
    fields: Option<BTreeSet<String>>,
}

impl TopicDemand {
    fn absorb(&mut self, payload: &SubscribePayload, first: bool) {
        self.preload_type = self.preload_type.max(payload.preload_type);
        self.fields = match (first, self.fields.take(), &payload.fields) {
            (_, _, None) => None,
            (true, _, Some(fields)) => Some(fields.iter().cloned().collect()),
            (false, None, Some(_)) => None,
            (false, Some(mut have), Some(fields)) => {
                have.extend(fields.iter().cloned());
                Some(have)
            }
        };
    }
}

/// Merge a flat list of payloads.
///
/// Per topic: `Full` dominates `Partial`, field lists are unioned, and a
/// payload without a field list (all fields) dominates any list. The result
/// has one payload per topic, sorted by topic, with sorted field lists.
pub fn merge_payloads<'a, I>(payloads: I) -> Vec<SubscribePayload>
where
    I: IntoIterator<Item = &'a SubscribePayload>,
{
    let mut by_topic: BTreeMap<&str, TopicDemand> = BTreeMap::new();
    for payload in payloads {
        let first = !by_topic.contains_key(payload.topic.as_str());
        by_topic
            .entry(payload.topic.as_str())
            .or_default()
            .absorb(payload, first);
    }

    by_topic
        .into_iter()
        .map(|(topic, demand)| SubscribePayload {
            topic: topic.to_string(),
            fields: demand.fields.map(|f| f.into_iter().collect()),
            preload_type: demand.preload_type,
        })
        .collect()
}

/// Merge every subscriber's payloads into the demand seen by the player.
pub fn merge_subscriptions(
    subscriptions: &HashMap<SubscriberId, Vec<SubscribePayload>>,
) -> Vec<SubscribePayload> {
    merge_payloads(subscriptions.values().flatten())
}
