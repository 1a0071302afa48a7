
#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::time::{Duration, Instant};

    use switchyard::{BusError, Context, DeliveryOptions, Message, ReplyError, ReplyFailure};

    use super::test_helpers::{close_runtime, setup_runtime, wait_until, ReceivedMessage, SentMessage, WAIT};

    fn body(message: &Message) -> String {
        message.body::<String>().cloned().unwrap_or_default()
    }

    #[test]
    fn test_request_reply() {
        let (runtime, metrics) = setup_runtime();
        let bus = runtime.event_bus();
        bus.consumer("echo", |m: Message| {
            m.reply(body(&m).to_uppercase())?;
            Ok(())
        })
        .unwrap();

        let (tx, rx) = mpsc::channel();
        bus.request("echo", "hello", DeliveryOptions::default(), move |result| {
            tx.send(result.map(|m| body(&m))).unwrap();
        })
        .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ok("HELLO".to_string()));

        let replies = metrics.bus.reply_registrations("echo");
        assert_eq!(replies.len(), 1);
        assert!(wait_until(WAIT, || replies[0].ended() == 1));
        assert_eq!(replies[0].begun(), 1);
        assert!(wait_until(WAIT, || replies[0].is_unregistered()));
        assert_eq!(bus.handler_count(&replies[0].address), 0);

        let handler = &metrics.bus.registrations("echo")[0];
        assert!(wait_until(WAIT, || handler.ended() == 1));
        assert_eq!(handler.scheduled(), 1);
        assert_eq!(handler.failures(), 0);
        close_runtime(&runtime);
    }

    #[test]
    fn test_request_without_handlers() {
        let (runtime, metrics) = setup_runtime();
        let (tx, rx) = mpsc::channel();
        runtime
            .event_bus()
            .request("nobody", 1i64, DeliveryOptions::default(), move |result| {
                tx.send(result.map(|_| ())).unwrap();
            })
            .unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Err(ReplyError::NoHandlers { address: "nobody".into() }));
        assert_eq!(
            metrics.bus.sent("nobody"),
            vec![SentMessage { address: "nobody".into(), publish: false, local: false, remote: false }]
        );
        assert!(metrics.bus.received("nobody").is_empty());
        assert!(wait_until(WAIT, || metrics.bus.reply_failures().len() == 1));
        assert_eq!(metrics.bus.reply_failures(), vec![("nobody".to_string(), ReplyFailure::NoHandlers)]);
        let reply = &metrics.bus.reply_registrations("nobody")[0];
        assert!(wait_until(WAIT, || reply.is_unregistered()));
        close_runtime(&runtime);
    }

    #[test]
    fn test_request_times_out_once() {
        let (runtime, metrics) = setup_runtime();
        let bus = runtime.event_bus();
        let pending = Arc::new(Mutex::new(None));
        let held = pending.clone();
        bus.consumer("slow", move |m: Message| {
            *held.lock().unwrap() = Some(m);
            Ok(())
        })
        .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let counted = calls.clone();
        let started = Instant::now();
        let timeout = Duration::from_millis(100);
        bus.request("slow", "ping", DeliveryOptions::default().with_send_timeout(timeout), move |result| {
            counted.fetch_add(1, Ordering::SeqCst);
            tx.send((result.map(|_| ()), started.elapsed())).unwrap();
        })
        .unwrap();

        let (result, elapsed) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(result, Err(ReplyError::Timeout { address: "slow".into(), timeout }));
        assert!(elapsed >= timeout, "timed out after {elapsed:?}");
        assert_eq!(metrics.bus.reply_failures(), vec![("slow".to_string(), ReplyFailure::Timeout)]);

        // A reply after the deadline reaches nobody.
        let late = pending.lock().unwrap().take().unwrap();
        late.reply("pong").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());
        close_runtime(&runtime);
    }

    #[test]
    fn test_recipient_failure() {
        let (runtime, metrics) = setup_runtime();
        let bus = runtime.event_bus();
        bus.consumer("strict", |m: Message| {
            m.fail(42, "nope")?;
            Ok(())
        })
        .unwrap();

        let (tx, rx) = mpsc::channel();
        bus.request("strict", "anything", DeliveryOptions::default(), move |result| {
            tx.send(result.map(|_| ())).unwrap();
        })
        .unwrap();

        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            Err(ReplyError::RecipientFailure { code: 42, message: "nope".into() })
        );
        let failures = metrics.bus.reply_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].1, ReplyFailure::RecipientFailure);
        close_runtime(&runtime);
    }

    #[test]
    fn test_handler_failures_are_counted() {
        let (runtime, metrics) = setup_runtime();
        let bus = runtime.event_bus();
        let (tx, rx) = mpsc::channel();
        let mut seen = 0;
        bus.consumer("flaky", move |m: Message| {
            seen += 1;
            match seen {
                1 => anyhow::bail!("first message rejected"),
                2 => panic!("second message blew up"),
                _ => {
                    tx.send(body(&m)).unwrap();
                    Ok(())
                }
            }
        })
        .unwrap();

        for i in 0..4 {
            bus.send("flaky", format!("m{i}")).unwrap();
        }
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "m2");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "m3");

        let handler = &metrics.bus.registrations("flaky")[0];
        assert!(wait_until(WAIT, || handler.ended() == 4));
        assert_eq!(handler.begun(), 4);
        assert_eq!(handler.failures(), 2);
        close_runtime(&runtime);
    }

    #[test]
    fn test_publish_reaches_every_handler() {
        let (runtime, metrics) = setup_runtime();
        let bus = runtime.event_bus();
        let (tx, rx) = mpsc::channel();
        for i in 0..3 {
            let tx = tx.clone();
            bus.consumer("news", move |m: Message| {
                tx.send((i, body(&m), m.is_send())).unwrap();
                Ok(())
            })
            .unwrap();
        }

        bus.publish("news", "extra").unwrap();
        let mut got: Vec<_> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        got.sort();
        assert_eq!(
            got,
            vec![(0, "extra".to_string(), false), (1, "extra".to_string(), false), (2, "extra".to_string(), false)]
        );

        assert_eq!(
            metrics.bus.sent("news"),
            vec![SentMessage { address: "news".into(), publish: true, local: true, remote: false }]
        );
        assert_eq!(
            metrics.bus.received("news"),
            vec![ReceivedMessage { address: "news".into(), publish: true, local: true, handlers: 3 }]
        );
        for handler in metrics.bus.registrations("news") {
            assert_eq!(handler.scheduled_local.load(Ordering::SeqCst), 1);
        }
        close_runtime(&runtime);
    }

    #[test]
    fn test_send_round_robin() {
        let (runtime, _metrics) = setup_runtime();
        let bus = runtime.event_bus();
        let (tx, rx) = mpsc::channel();
        for i in 0..3 {
            let tx = tx.clone();
            bus.consumer("work", move |_m: Message| {
                tx.send(i).unwrap();
                Ok(())
            })
            .unwrap();
        }

        for _ in 0..9 {
            bus.send("work", true).unwrap();
        }
        let mut counts: HashMap<i32, usize> = HashMap::new();
        for _ in 0..9 {
            *counts.entry(rx.recv_timeout(WAIT).unwrap()).or_insert(0) += 1;
        }
        assert_eq!(counts, HashMap::from([(0, 3), (1, 3), (2, 3)]));
        close_runtime(&runtime);
    }

    #[test]
    fn test_handlers_run_on_registering_context() {
        let (runtime, _metrics) = setup_runtime();
        let bus = runtime.event_bus().clone();
        let context = runtime.create_event_loop_context().unwrap();
        let (tx, rx) = mpsc::channel();

        let registering = context.clone();
        context
            .run_on_context(move || {
                let expected = registering.clone();
                let message_tx = tx.clone();
                let consumer = bus
                    .consumer("pinned", move |_m: Message| {
                        message_tx.send(("message", Context::current().as_ref() == Some(&expected))).unwrap();
                        Ok(())
                    })
                    .unwrap();
                assert!(consumer.context() == &registering);

                let expected = registering.clone();
                consumer.completion_handler(move |result| {
                    tx.send(("completion", result.is_ok() && Context::current().as_ref() == Some(&expected)))
                        .unwrap();
                });
                bus.send("pinned", 7i64).unwrap();
            })
            .unwrap();

        let mut got: Vec<_> = (0..2).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        got.sort();
        assert_eq!(got, vec![("completion", true), ("message", true)]);
        close_runtime(&runtime);
    }

    #[test]
    fn test_unregister_stops_delivery() {
        let (runtime, metrics) = setup_runtime();
        let bus = runtime.event_bus();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        let consumer = bus
            .consumer("gone", move |_m: Message| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert!(consumer.completion().wait_timeout(WAIT).unwrap().is_ok());
        assert_eq!(bus.handler_count("gone"), 1);

        let (tx, rx) = mpsc::channel();
        consumer.unregister_with(move |result| tx.send(result).unwrap());
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ok(()));
        assert!(!consumer.is_registered());
        assert_eq!(bus.handler_count("gone"), 0);
        assert!(metrics.bus.registrations("gone")[0].is_unregistered());
        assert!(consumer.unregister().is_complete());

        bus.send("gone", "lost").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert_eq!(
            metrics.bus.sent("gone"),
            vec![SentMessage { address: "gone".into(), publish: false, local: false, remote: false }]
        );
        close_runtime(&runtime);
    }

    #[test]
    fn test_closed_bus_refuses_traffic() {
        let (runtime, metrics) = setup_runtime();
        let bus = runtime.event_bus();
        let consumer = bus.consumer("closing", |_m: Message| Ok(())).unwrap();

        bus.close();
        assert!(bus.is_closed());
        assert!(metrics.bus.closed.load(Ordering::SeqCst));
        assert!(!consumer.is_registered());
        assert!(metrics.bus.registrations("closing")[0].is_unregistered());
        assert_eq!(bus.send("closing", "late").unwrap_err(), BusError::AlreadyClosed);
        assert_eq!(bus.publish("closing", "late").unwrap_err(), BusError::AlreadyClosed);
        assert!(matches!(bus.consumer("closing", |_m: Message| Ok(())), Err(BusError::AlreadyClosed)));
        let refused = bus.request("closing", "late", DeliveryOptions::default(), |_| {});
        assert_eq!(refused.unwrap_err(), BusError::AlreadyClosed);
        close_runtime(&runtime);
    }

    #[test]
    fn test_headers_and_literal_bodies() {
        let (runtime, _metrics) = setup_runtime();
        let bus = runtime.event_bus();
        let (tx, rx) = mpsc::channel();
        bus.consumer("typed", move |m: Message| {
            tx.send((m.body::<String>().cloned(), m.header("trace").map(str::to_string), m.reply_address().is_none()))
                .unwrap();
            Ok(())
        })
        .unwrap();

        bus.send_with("typed", "literal", DeliveryOptions::default().with_header("trace", "abc")).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (Some("literal".to_string()), Some("abc".to_string()), true));
        close_runtime(&runtime);
    }

    #[test]
    fn test_reply_with_continues_conversation() {
        let (runtime, metrics) = setup_runtime();
        let bus = runtime.event_bus();
        let (done_tx, done_rx) = mpsc::channel();
        bus.consumer("handshake", move |m: Message| {
            let done_tx = done_tx.clone();
            m.reply_with("syn-ack", DeliveryOptions::default(), move |result| {
                done_tx.send(result.map(|m| body(&m))).unwrap();
            })?;
            Ok(())
        })
        .unwrap();

        let (tx, rx) = mpsc::channel();
        bus.request("handshake", "syn", DeliveryOptions::default(), move |result| {
            let reply = result.unwrap();
            tx.send(body(&reply)).unwrap();
            reply.reply("ack").unwrap();
        })
        .unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "syn-ack");
        assert_eq!(done_rx.recv_timeout(WAIT).unwrap(), Ok("ack".to_string()));

        let first = &metrics.bus.reply_registrations("handshake")[0];
        let second = metrics.bus.reply_registrations(&first.address);
        assert_eq!(second.len(), 1);
        assert!(wait_until(WAIT, || second[0].is_unregistered()));
        close_runtime(&runtime);
    }
}
