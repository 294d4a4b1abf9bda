use std::collections::HashMap;
use std::sync::Arc;

use streamgate_cache::MemoryPartition;
use streamgate_core::frame::{Begin, BeginEx, Frame, FrameHeader};
use streamgate_core::stream_id::reply_id;
use streamgate_core::ErrorCode;
use tracing::{debug, warn};

use crate::context::StreamContext;
use crate::error::StreamError;
use crate::produce::fan::{ProduceFan, ProduceFanOptions};
use crate::produce::member::ProduceMember;
use crate::router::{PartitionKey, Router};

#[derive(Debug, Clone, Copy)]
pub struct ProduceFactoryOptions {
    pub reconnect_delay_secs: u64,
    /// How long an idle fan-out keeps its upstream open
    pub cleanup_delay_secs: u64,
    pub window_bytes: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    Member(PartitionKey, u64),
    Upstream(PartitionKey),
}

/// Binds produce member streams to the fan-out of their topic partition.
pub struct ProduceFactory {
    router: Arc<dyn Router>,
    options: ProduceFactoryOptions,
    fans: HashMap<PartitionKey, ProduceFan>,
    bindings: HashMap<u64, Binding>,
    addresses: HashMap<u64, PartitionKey>,
    upstreams: HashMap<PartitionKey, (u64, u64)>,
    address_base: u64,
    next_address: u64,
}

impl ProduceFactory {
    pub fn new(router: Arc<dyn Router>, options: ProduceFactoryOptions, address_base: u64) -> Self {
        Self {
            router,
            options,
            fans: HashMap::new(),
            bindings: HashMap::new(),
            addresses: HashMap::new(),
            upstreams: HashMap::new(),
            address_base,
            next_address: 0,
        }
    }

    pub fn fan(&self, key: &PartitionKey) -> Option<&ProduceFan> {
        self.fans.get(key)
    }

    pub fn fan_count(&self) -> usize {
        self.fans.len()
    }

    pub fn handles(&self, frame: &Frame) -> bool {
        let stream_id = frame.stream_id();
        if self.bindings.contains_key(&stream_id) || self.addresses.contains_key(&stream_id) {
            return true;
        }
        matches!(
            frame,
            Frame::Begin(Begin {
                extension: Some(BeginEx::Produce(_)),
                ..
            })
        )
    }

    pub fn on_frame(&mut self, frame: &Frame, cx: &mut StreamContext<'_>) {
        let stream_id = frame.stream_id();

        if let Some(key) = self.addresses.get(&stream_id).cloned() {
            if let (Frame::Signal(signal), Some(fan)) = (frame, self.fans.get_mut(&key)) {
                fan.on_signal(signal.signal_id, cx);
            }
            self.settle(&key);
            return;
        }

        match self.bindings.get(&stream_id).cloned() {
            Some(Binding::Member(key, initial_id)) => {
                if let Some(fan) = self.fans.get_mut(&key) {
                    fan.on_member_frame(initial_id, frame, cx);
                }
                self.settle(&key);
            }
            Some(Binding::Upstream(key)) => {
                if let Some(fan) = self.fans.get_mut(&key) {
                    fan.on_upstream_frame(frame, cx);
                }
                self.settle(&key);
            }
            None => match frame {
                Frame::Begin(begin) => self.on_member_begin(begin, cx),
                other => debug!(stream_id, kind = ?other.kind(), "Frame for unknown produce stream"),
            },
        }
    }

    fn reject(header: &FrameHeader, error: ErrorCode, cx: &mut StreamContext<'_>) {
        let header = FrameHeader::new(header.origin_id, header.routed_id, header.stream_id)
            .window(header.sequence, header.acknowledge, 0)
            .authorization(header.authorization);
        cx.out.reset(header, Some(error.as_i16()));
    }

    fn on_member_begin(&mut self, begin: &Begin, cx: &mut StreamContext<'_>) {
        let Some(BeginEx::Produce(extension)) = &begin.extension else {
            return;
        };
        let header = &begin.header;
        let topic = extension.topic.as_str();
        let partition_id = extension.partition.partition_id;

        let Some(route) = self.router.resolve(topic, header.authorization) else {
            warn!(stream_id = header.stream_id, error = %StreamError::UnknownTopic(topic.to_string()), "Rejecting produce");
            Self::reject(header, ErrorCode::UnknownTopicOrPartition, cx);
            return;
        };
        let Some(leader_id) = self.router.leader(topic, partition_id) else {
            let error = StreamError::NoRoute {
                topic: topic.to_string(),
                partition: partition_id,
            };
            warn!(stream_id = header.stream_id, error = %error, "Rejecting produce");
            Self::reject(header, ErrorCode::UnknownTopicOrPartition, cx);
            return;
        };
        if begin.affinity != 0 && begin.affinity != leader_id {
            debug!(
                stream_id = header.stream_id,
                affinity = begin.affinity,
                leader = leader_id,
                "Produce bound to stale leader"
            );
            Self::reject(header, ErrorCode::NotLeaderOrFollower, cx);
            return;
        }

        let key = PartitionKey::new(topic, partition_id);
        if !self.fans.contains_key(&key) {
            let topic_options = self.router.topic_options(topic);
            let address = self.address_base + self.next_address;
            self.next_address += 1;

            let partition = MemoryPartition::new(topic, partition_id, topic_options.cache);
            let fan = ProduceFan::new(
                address,
                header.routed_id,
                route.routed_id,
                leader_id,
                Box::new(partition),
                ProduceFanOptions {
                    reconnect_delay_secs: self.options.reconnect_delay_secs,
                    cleanup_delay_secs: self.options.cleanup_delay_secs,
                    window_bytes: self.options.window_bytes,
                },
                cx.now_millis(),
            );
            debug!(%key, address, leader = leader_id, "Created produce fan-out");
            self.addresses.insert(address, key.clone());
            self.fans.insert(key.clone(), fan);
        }

        let member = ProduceMember::new(header, leader_id);
        let initial_id = header.stream_id;
        self.bindings
            .insert(initial_id, Binding::Member(key.clone(), initial_id));
        self.bindings
            .insert(reply_id(initial_id), Binding::Member(key.clone(), initial_id));

        if let Some(fan) = self.fans.get_mut(&key) {
            fan.attach(member, cx);
        }
        self.settle(&key);
    }

    fn settle(&mut self, key: &PartitionKey) {
        let Some(fan) = self.fans.get_mut(key) else {
            return;
        };
        fan.settle();

        for initial_id in fan.take_detached() {
            self.bindings.remove(&initial_id);
            self.bindings.remove(&reply_id(initial_id));
        }

        let current = fan.upstream_ids();
        let previous = self.upstreams.get(key).copied();
        if current != previous {
            if let Some((initial_id, reply_id)) = previous {
                self.bindings.remove(&initial_id);
                self.bindings.remove(&reply_id);
            }
            if let Some((initial_id, reply_id)) = current {
                self.bindings
                    .insert(initial_id, Binding::Upstream(key.clone()));
                self.bindings
                    .insert(reply_id, Binding::Upstream(key.clone()));
                self.upstreams.insert(key.clone(), (initial_id, reply_id));
            }
        }
    }
}
