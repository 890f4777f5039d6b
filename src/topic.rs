//! Topic rewriting and filter matching
//!
//! The bridge forwards messages under rewritten topic names. Each direction
//! has a fixed whitelist of [`ReplaceTopic`] rules: the `filter` is the MQTT
//! subscription filter (`+` matches one level, `#` the remainder), and
//! `replace`/`with` describe a literal prefix substitution applied once to
//! each received topic to compute the outbound topic.
//!
//! The tables are compile-time constants. Individual rules carry no special
//! control flow; changing the whitelist means editing the table.

/// A single topic rewrite rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaceTopic {
    /// Subscription filter on the source broker.
    pub filter: &'static str,
    /// Literal prefix to replace in received topics.
    pub replace: &'static str,
    /// Replacement prefix on the destination broker.
    pub with: &'static str,
}

impl ReplaceTopic {
    /// Rewrite a received topic for the destination broker.
    ///
    /// Replaces the leftmost occurrence of `replace` with `with`, exactly
    /// once. A topic that does not contain `replace` is returned unchanged.
    pub fn updated(&self, topic: &str) -> String {
        topic.replacen(self.replace, self.with, 1)
    }

    /// Check whether a concrete topic matches this rule's filter.
    pub fn matches(&self, topic: &str) -> bool {
        topic_matches_filter(topic, self.filter)
    }
}

/// Rules for messages flowing from the local broker to the cloud.
pub const LOCAL_TOPICS: &[ReplaceTopic] = &[
    ReplaceTopic {
        filter: "$location/calibration",
        replace: "$location",
        with: "$cloud/location",
    },
    ReplaceTopic {
        filter: "$location/delete",
        replace: "$location",
        with: "$cloud/location",
    },
    ReplaceTopic {
        filter: "$device/+/+/rssi",
        replace: "$device",
        with: "$cloud/device",
    },
    ReplaceTopic {
        filter: "$node/+/module/status",
        replace: "$node",
        with: "$cloud/node",
    },
    ReplaceTopic {
        filter: "$device/+/channel/+/+",
        replace: "$device",
        with: "$cloud/device",
    },
    ReplaceTopic {
        filter: "$device/+/channel/+/+/event/+",
        replace: "$device",
        with: "$cloud/device",
    },
    ReplaceTopic {
        filter: "$ninja/services/rpc/+/+",
        replace: "$ninja",
        with: "$cloud/ninja",
    },
    ReplaceTopic {
        filter: "$ninja/services/+",
        replace: "$ninja",
        with: "$cloud/ninja",
    },
    // Replies bound for remote devices travel under a distinct prefix so the
    // cloud can tell them apart from locally-destined ones.
    ReplaceTopic {
        filter: "$device/+/channel/+/+/reply",
        replace: "$device",
        with: "$cloud/remote_device",
    },
];

/// Rules for messages flowing from the cloud down to the local broker.
pub const CLOUD_TOPICS: &[ReplaceTopic] = &[
    ReplaceTopic {
        filter: "$cloud/location/calibration/progress",
        replace: "$cloud/location",
        with: "$location",
    },
    ReplaceTopic {
        filter: "$cloud/device/+/+/location",
        replace: "$cloud/device",
        with: "$device",
    },
    ReplaceTopic {
        filter: "$cloud/device/+/announce",
        replace: "$cloud/device",
        with: "$device",
    },
    ReplaceTopic {
        filter: "$cloud/device/+/channel/+/+/announce",
        replace: "$cloud/device",
        with: "$device",
    },
    ReplaceTopic {
        filter: "$cloud/device/+/channel/+/+/reply",
        replace: "$cloud/device",
        with: "$device",
    },
    ReplaceTopic {
        filter: "$cloud/ninja/services/rpc/+/+/reply",
        replace: "$cloud/ninja",
        with: "$ninja",
    },
    // Counterpart of the remote_device rule above.
    ReplaceTopic {
        filter: "$cloud/remote_device/+/channel/#",
        replace: "$cloud/remote_device",
        with: "$device",
    },
];

/// Check whether a concrete topic name matches a subscription filter.
///
/// Implements the MQTT matching rules the brokers apply: `+` matches exactly
/// one level, `#` matches the remainder (including zero levels) and must be
/// the last level of the filter.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(level), Some(name)) if level == name => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
