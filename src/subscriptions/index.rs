//! Topic to subscriber lookup used when bucketing a batch.

use crate::source::project_event;
use crate::types::{MessageEvent, SubscribePayload, SubscriberId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Which subscribers want which topics, and which fields of them.
#[derive(Clone, Debug, Default)]
pub struct SubscriberIndex {
    /// Per topic, each subscriber's field selection (`None` = all fields).
    by_topic: HashMap<String, BTreeMap<SubscriberId, Option<Vec<String>>>>,
}

impl SubscriberIndex {
    /// Build from every subscriber's payloads. Several payloads from one
    /// subscriber on one topic combine the same way merged demand does.
    pub fn build(subscriptions: &HashMap<SubscriberId, Vec<SubscribePayload>>) -> Self {
        let mut wanted: HashMap<String, BTreeMap<SubscriberId, Option<BTreeSet<String>>>> =
            HashMap::new();
        for (id, payloads) in subscriptions {
            for payload in payloads {
                let entry = wanted
                    .entry(payload.topic.clone())
                    .or_default()
                    .entry(*id)
                    .or_insert_with(|| Some(BTreeSet::new()));
                match &payload.fields {
                    Some(more) => {
                        if let Some(fields) = entry {
                            fields.extend(more.iter().cloned());
                        }
                    }
                    None => *entry = None,
                }
            }
        }

        let by_topic = wanted
            .into_iter()
            .map(|(topic, subscribers)| {
                let subscribers = subscribers
                    .into_iter()
                    .map(|(id, fields)| (id, fields.map(|f| f.into_iter().collect())))
                    .collect();
                (topic, subscribers)
            })
            .collect();
        Self { by_topic }
    }

    /// Split a time-ordered batch into per-subscriber batches, each message
    /// cut down to the fields that subscriber asked for. Every subscriber in
    /// `subscribers` gets an entry, possibly empty; order is preserved
    /// within each bucket.
    pub fn bucket<'a, I>(
        &self,
        messages: &[MessageEvent],
        subscribers: I,
    ) -> HashMap<SubscriberId, Arc<[MessageEvent]>>
    where
        I: IntoIterator<Item = &'a SubscriberId>,
    {
        let mut buckets: HashMap<SubscriberId, Vec<MessageEvent>> = subscribers
            .into_iter()
            .map(|id| (*id, Vec::new()))
            .collect();
        for message in messages {
            let Some(wanted) = self.by_topic.get(&message.topic) else {
                continue;
            };
            for (id, fields) in wanted {
                if let Some(bucket) = buckets.get_mut(id) {
                    bucket.push(project_event(message.clone(), fields.as_deref()));
                }
            }
        }
        buckets
            .into_iter()
            .map(|(id, messages)| (id, messages.into()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Time;
    use serde_json::json;

    #[test]
    fn test_bucket_by_topic() {
        let subscriptions: HashMap<SubscriberId, Vec<SubscribePayload>> = [
            (SubscriberId(1), vec![SubscribePayload::partial("/a")]),
            (
                SubscriberId(2),
                vec![SubscribePayload::full("/a"), SubscribePayload::partial("/b")],
            ),
            (SubscriberId(3), vec![]),
        ]
        .into_iter()
        .collect();
        let index = SubscriberIndex::build(&subscriptions);

        let messages = vec![
            MessageEvent::new("/a", "A", Time::new(1, 0), json!({})),
            MessageEvent::new("/b", "B", Time::new(2, 0), json!({})),
            MessageEvent::new("/c", "C", Time::new(3, 0), json!({})),
            MessageEvent::new("/a", "A", Time::new(4, 0), json!({})),
        ];
        let buckets = index.bucket(&messages, subscriptions.keys());

        let times = |id: u64| -> Vec<Time> {
            buckets[&SubscriberId(id)]
                .iter()
                .map(|m| m.receive_time)
                .collect()
        };
        assert_eq!(times(1), vec![Time::new(1, 0), Time::new(4, 0)]);
        assert_eq!(
            times(2),
            vec![Time::new(1, 0), Time::new(2, 0), Time::new(4, 0)]
        );
        assert!(times(3).is_empty());
    }

    #[test]
    fn test_bucket_projects_each_subscribers_fields() {
        let subscriptions: HashMap<SubscriberId, Vec<SubscribePayload>> = [
            (SubscriberId(1), vec![SubscribePayload::partial("/odom").with_fields(["x"])]),
            (
                SubscriberId(2),
                vec![
                    SubscribePayload::partial("/odom").with_fields(["y"]),
                    SubscribePayload::full("/odom").with_fields(["z"]),
                ],
            ),
            (SubscriberId(3), vec![SubscribePayload::partial("/odom")]),
        ]
        .into_iter()
        .collect();
        let index = SubscriberIndex::build(&subscriptions);

        let messages = vec![MessageEvent::new(
            "/odom",
            "Odometry",
            Time::new(1, 0),
            json!({"x": 1, "y": 2, "z": 3}),
        )];
        let buckets = index.bucket(&messages, subscriptions.keys());

        assert_eq!(*buckets[&SubscriberId(1)][0].message, json!({"x": 1}));
        assert_eq!(*buckets[&SubscriberId(2)][0].message, json!({"y": 2, "z": 3}));
        assert_eq!(*buckets[&SubscriberId(3)][0].message, json!({"x": 1, "y": 2, "z": 3}));
        assert!(buckets[&SubscriberId(1)][0].size_in_bytes < messages[0].size_in_bytes);
    }
}
