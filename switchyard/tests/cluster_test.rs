
#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{mpsc, Arc, Mutex};

    use switchyard::bus::REPLY_EXCEPTION_CODEC;
    use switchyard::{DeliveryOptions, InMemoryCluster, InMemoryTransport, Message, ReplyError, Switchyard};
    use switchyard_api::cluster::{ClusterTransport, Envelope, EnvelopeSink};
    use switchyard_api::types::NodeId;

    use super::test_helpers::{close_runtime, test_config, wait_until, FakeMetrics, ReceivedMessage, SentMessage, WAIT};

    struct Node {
        runtime: Switchyard,
        metrics: Arc<FakeMetrics>,
        transport: Arc<InMemoryTransport>,
    }

    impl Node {
        fn join(cluster: &InMemoryCluster) -> Self {
            let metrics = Arc::new(FakeMetrics::default());
            let transport = cluster.join();
            let runtime = Switchyard::clustered(test_config(&metrics), transport.clone()).unwrap();
            Self { runtime, metrics, transport }
        }

        fn id(&self) -> NodeId {
            self.transport.node_id().clone()
        }
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(future)
    }

    fn body(message: &Message) -> String {
        message.body::<String>().cloned().unwrap_or_default()
    }

    struct ChannelSink(Mutex<mpsc::Sender<Envelope>>);

    impl EnvelopeSink for ChannelSink {
        fn receive(&self, envelope: Envelope) {
            let _ = self.0.lock().unwrap().send(envelope);
        }
    }

    #[test]
    fn test_remote_send_crosses_nodes() {
        let cluster = InMemoryCluster::new();
        let one = Node::join(&cluster);
        let two = Node::join(&cluster);
        assert!(one.runtime.event_bus().is_clustered());
        assert_eq!(cluster.members(), vec![one.id(), two.id()]);

        let (tx, rx) = mpsc::channel();
        let consumer = one
            .runtime
            .event_bus()
            .consumer("X", move |m: Message| {
                tx.send((m.body::<i64>().copied(), m.origin().cloned())).unwrap();
                Ok(())
            })
            .unwrap();
        assert_eq!(consumer.completion().wait_timeout(WAIT).unwrap(), Ok(()));
        assert_eq!(cluster.registrations("X"), 1);

        two.runtime.event_bus().send("X", 42i64).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (Some(42), Some(two.id())));

        assert!(two.metrics.bus.encoded_bytes("X") >= 8);
        assert!(one.metrics.bus.decoded_bytes("X") >= 8);
        assert_eq!(
            two.metrics.bus.sent("X"),
            vec![SentMessage { address: "X".into(), publish: false, local: false, remote: true }]
        );
        assert_eq!(
            one.metrics.bus.received("X"),
            vec![ReceivedMessage { address: "X".into(), publish: false, local: false, handlers: 1 }]
        );
        let handler = &one.metrics.bus.registrations("X")[0];
        assert!(wait_until(WAIT, || handler.ended() == 1));
        assert_eq!(handler.scheduled_remote.load(std::sync::atomic::Ordering::SeqCst), 1);

        assert!(consumer.unregister().wait_timeout(WAIT).unwrap().is_ok());
        assert_eq!(cluster.registrations("X"), 0);
        close_runtime(&one.runtime);
        close_runtime(&two.runtime);
    }

    #[test]
    fn test_remote_request_reply() {
        let cluster = InMemoryCluster::new();
        let one = Node::join(&cluster);
        let two = Node::join(&cluster);

        let echo = one
            .runtime
            .event_bus()
            .consumer("echo", |m: Message| {
                m.reply(body(&m).to_uppercase())?;
                Ok(())
            })
            .unwrap();
        let strict = one
            .runtime
            .event_bus()
            .consumer("strict", |m: Message| {
                m.fail(7, "bad input")?;
                Ok(())
            })
            .unwrap();
        assert!(echo.completion().wait_timeout(WAIT).unwrap().is_ok());
        assert!(strict.completion().wait_timeout(WAIT).unwrap().is_ok());

        let (tx, rx) = mpsc::channel();
        let bus = two.runtime.event_bus();
        let replies = tx.clone();
        bus.request("echo", "hi", DeliveryOptions::default(), move |result| {
            replies.send(result.map(|m| body(&m))).unwrap();
        })
        .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ok("HI".to_string()));

        bus.request("strict", "hi", DeliveryOptions::default(), move |result| {
            tx.send(result.map(|m| body(&m))).unwrap();
        })
        .unwrap();
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            Err(ReplyError::RecipientFailure { code: 7, message: "bad input".into() })
        );

        close_runtime(&one.runtime);
        close_runtime(&two.runtime);
    }

    #[test]
    fn test_remote_node_without_handlers() {
        let cluster = InMemoryCluster::new();
        let one = Node::join(&cluster);
        let two = Node::join(&cluster);

        // Node one advertises an address it has no handler for.
        block_on(one.transport.add_registration("ghost")).unwrap();

        let (tx, rx) = mpsc::channel();
        two.runtime
            .event_bus()
            .request("ghost", "boo", DeliveryOptions::default(), move |result| {
                tx.send(result.map(|_| ())).unwrap();
            })
            .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Err(ReplyError::NoHandlers { address: "ghost".into() }));
        assert_eq!(
            one.metrics.bus.received("ghost"),
            vec![ReceivedMessage { address: "ghost".into(), publish: false, local: false, handlers: 0 }]
        );

        // The failure travels back as an envelope of its own.
        let probe = cluster.join_as(NodeId::from("probe"));
        let (envelopes, inbound) = mpsc::channel();
        probe.bind(Arc::new(ChannelSink(Mutex::new(envelopes))));
        let request = Envelope {
            address: "ghost".into(),
            reply_address: Some("probe-reply".into()),
            headers: Default::default(),
            codec: "string".into(),
            body: b"boo".to_vec(),
            send: true,
            source: probe.node_id().clone(),
        };
        block_on(probe.send(&one.id(), request)).unwrap();

        let answer = inbound.recv_timeout(WAIT).unwrap();
        assert_eq!(answer.address, "probe-reply");
        assert_eq!(answer.codec, REPLY_EXCEPTION_CODEC);
        assert_eq!(answer.source, one.id());

        close_runtime(&one.runtime);
        close_runtime(&two.runtime);
    }

    #[test]
    fn test_publish_spans_nodes() {
        let cluster = InMemoryCluster::new();
        let one = Node::join(&cluster);
        let two = Node::join(&cluster);

        let (tx, rx) = mpsc::channel();
        let mut consumers = Vec::new();
        for (label, node) in [("one", &one), ("two", &two)] {
            let tx = tx.clone();
            let consumer = node
                .runtime
                .event_bus()
                .consumer("news", move |m: Message| {
                    tx.send((label, body(&m))).unwrap();
                    Ok(())
                })
                .unwrap();
            assert!(consumer.completion().wait_timeout(WAIT).unwrap().is_ok());
            consumers.push(consumer);
        }

        two.runtime.event_bus().publish("news", "extra").unwrap();
        let mut got: Vec<_> = (0..2).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        got.sort();
        assert_eq!(got, vec![("one", "extra".to_string()), ("two", "extra".to_string())]);

        assert_eq!(
            two.metrics.bus.sent("news"),
            vec![SentMessage { address: "news".into(), publish: true, local: true, remote: true }]
        );
        assert_eq!(
            one.metrics.bus.received("news"),
            vec![ReceivedMessage { address: "news".into(), publish: true, local: false, handlers: 1 }]
        );

        close_runtime(&one.runtime);
        close_runtime(&two.runtime);
    }

    #[test]
    fn test_send_prefers_locals_then_remotes() {
        let cluster = InMemoryCluster::new();
        let one = Node::join(&cluster);
        let two = Node::join(&cluster);

        let (tx, rx) = mpsc::channel();
        for (label, node) in [("one", &one), ("two", &two)] {
            let tx = tx.clone();
            let consumer = node
                .runtime
                .event_bus()
                .consumer("rr", move |_m: Message| {
                    tx.send(label).unwrap();
                    Ok(())
                })
                .unwrap();
            assert!(consumer.completion().wait_timeout(WAIT).unwrap().is_ok());
        }

        for _ in 0..4 {
            two.runtime.event_bus().send("rr", true).unwrap();
        }
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for _ in 0..4 {
            *counts.entry(rx.recv_timeout(WAIT).unwrap()).or_insert(0) += 1;
        }
        assert_eq!(counts, HashMap::from([("one", 2), ("two", 2)]));

        let local = SentMessage { address: "rr".into(), publish: false, local: true, remote: false };
        let remote = SentMessage { address: "rr".into(), publish: false, local: false, remote: true };
        assert_eq!(two.metrics.bus.sent("rr"), vec![local.clone(), remote.clone(), local, remote]);

        // Local-only sends never leave the node.
        two.runtime
            .event_bus()
            .send_with("rr", true, DeliveryOptions::default().with_local_only(true))
            .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "two");

        close_runtime(&one.runtime);
        close_runtime(&two.runtime);
    }
}
