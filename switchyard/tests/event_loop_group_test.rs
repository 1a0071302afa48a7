
#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    use switchyard::{Channel, Context, EventLoop, EventLoopGroup, GroupError};
    use switchyard_api::metrics::NoopMetrics;

    use super::test_helpers::{close_runtime, setup_runtime, WAIT};

    fn spawn(name: &str) -> EventLoop {
        EventLoop::spawn(name, &NoopMetrics).unwrap()
    }

    #[test]
    fn test_add_remove_scenario() {
        let group = EventLoopGroup::new();
        assert_eq!(group.next().unwrap_err(), GroupError::EmptyGroup);

        let a = spawn("elg-scenario-a");
        group.add_worker(a.clone());
        group.add_worker(a.clone());
        assert_eq!(group.worker_count(), 1);
        assert_eq!(group.reuse_count(&a), 2);

        group.remove_worker(&a).unwrap();
        assert_eq!(group.worker_count(), 1);
        assert_eq!(group.next().unwrap(), a);

        group.remove_worker(&a).unwrap();
        assert_eq!(group.worker_count(), 0);
        assert_eq!(group.next().unwrap_err(), GroupError::EmptyGroup);
        assert!(matches!(group.remove_worker(&a), Err(GroupError::NotFound(_))));

        a.shutdown();
    }

    #[test]
    fn test_round_robin_fairness() {
        let group = EventLoopGroup::new();
        let loops: Vec<_> = (0..3).map(|i| spawn(&format!("elg-fair-{i}"))).collect();
        for l in &loops {
            group.add_worker(l.clone());
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..10 {
            *counts.entry(group.next().unwrap().name().to_string()).or_insert(0) += 1;
        }
        for l in &loops {
            let count = counts[l.name()];
            assert!(count == 3 || count == 4, "{} returned {count} times", l.name());
        }

        group.shutdown();
        assert!(group.is_shutdown());
        assert!(group.is_terminated());
        assert_eq!(group.next().unwrap_err(), GroupError::ShutDown);
        for l in &loops {
            assert!(l.await_termination(WAIT));
        }
    }

    #[test]
    fn test_graceful_shutdown_fires_once() {
        let group = EventLoopGroup::new();
        let a = spawn("elg-graceful-a");
        let b = spawn("elg-graceful-b");
        group.add_worker(a.clone());
        group.add_worker(b.clone());

        let fired = Arc::new(AtomicUsize::new(0));
        let first = group.shutdown_gracefully(Duration::from_millis(10), Duration::from_secs(2));
        let second = group.shutdown_gracefully(Duration::from_millis(10), Duration::from_secs(2));
        assert!(first.ptr_eq(&second));
        assert!(group.is_shutting_down());

        let f = fired.clone();
        first.on_complete(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(group.await_termination(WAIT));
        assert!(a.is_terminated());
        assert!(b.is_terminated());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(group.termination().ptr_eq(&first));
    }

    #[test]
    fn test_forced_shutdown_escalates_graceful() {
        let group = EventLoopGroup::new();
        let a = spawn("elg-escalate-a");
        let b = spawn("elg-escalate-b");
        group.add_worker(a.clone());
        group.add_worker(b.clone());

        let graceful = group.shutdown_gracefully(Duration::from_secs(3), Duration::from_secs(10));
        assert!(!group.is_terminated());

        let forced = group.shutdown();
        assert!(forced.ptr_eq(&graceful));
        assert!(group.is_shutdown());
        assert!(group.is_terminated());

        // The loops stop well before the quiet period would have elapsed.
        assert!(a.await_termination(Duration::from_secs(2)));
        assert!(b.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn test_concurrent_next_visits_every_loop_evenly() {
        const THREADS: usize = 8;
        const CALLS: usize = 300;

        let group = EventLoopGroup::new();
        let loops: Vec<_> = (0..3).map(|i| spawn(&format!("elg-concurrent-{i}"))).collect();
        for l in &loops {
            group.add_worker(l.clone());
        }

        let picked: Vec<EventLoop> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..THREADS)
                .map(|_| scope.spawn(|| (0..CALLS).map(|_| group.next().unwrap()).collect::<Vec<_>>()))
                .collect();
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(picked.len(), THREADS * CALLS);
        for l in &loops {
            let count = picked.iter().filter(|p| *p == l).count();
            assert_eq!(count, THREADS * CALLS / loops.len(), "{} picked {count} times", l.name());
        }

        group.shutdown();
    }

    #[test]
    fn test_concurrent_graceful_shutdown_fires_once() {
        let group = EventLoopGroup::new();
        let a = spawn("elg-race-a");
        let b = spawn("elg-race-b");
        group.add_worker(a.clone());
        group.add_worker(b.clone());

        let fired = Arc::new(AtomicUsize::new(0));
        let barrier = std::sync::Barrier::new(2);
        let (first, second) = std::thread::scope(|scope| {
            let race = || {
                barrier.wait();
                group.shutdown_gracefully(Duration::from_millis(10), Duration::from_secs(2))
            };
            let left = scope.spawn(race);
            let right = scope.spawn(race);
            (left.join().unwrap(), right.join().unwrap())
        });
        assert!(first.ptr_eq(&second));

        let f = fired.clone();
        second.on_complete(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(group.await_termination(WAIT));
        assert!(a.is_terminated());
        assert!(b.is_terminated());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    struct RecordingChannel {
        id: String,
        tx: mpsc::Sender<(String, bool)>,
    }

    impl Channel for RecordingChannel {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn registered(&mut self, context: &Context) {
            let on_loop = context.event_loop().map(|l| l.in_event_loop()).unwrap_or(false);
            self.tx.send((self.id.clone(), on_loop && context.is_current())).unwrap();
        }
    }

    #[test]
    fn test_register_channel_on_next_loop() {
        let group = EventLoopGroup::new();
        let a = spawn("elg-channel-a");
        let b = spawn("elg-channel-b");
        group.add_worker(a.clone());
        group.add_worker(b.clone());

        let (tx, rx) = mpsc::channel();
        let first = group.register(Box::new(RecordingChannel { id: "c1".into(), tx: tx.clone() })).unwrap();
        let second = group.register(Box::new(RecordingChannel { id: "c2".into(), tx })).unwrap();

        assert_eq!(first.event_loop(), Some(&a));
        assert_eq!(second.event_loop(), Some(&b));
        let mut seen: Vec<_> = (0..2).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        seen.sort();
        assert_eq!(seen, vec![("c1".to_string(), true), ("c2".to_string(), true)]);

        group.shutdown();
    }

    #[test]
    fn test_runtime_loops_are_named_and_observed() {
        let (runtime, metrics) = setup_runtime();
        let names: Vec<_> = runtime.event_loops().iter().map(|l| l.name().to_string()).collect();
        assert_eq!(names, vec!["switchyard-eventloop-thread-0", "switchyard-eventloop-thread-1"]);
        assert_eq!(*metrics.event_loops.lock().unwrap(), names);
        assert_eq!(runtime.event_loop_group().worker_count(), 2);

        close_runtime(&runtime);
        assert!(runtime.event_loop_group().is_terminated());
        assert!(runtime.event_loops().iter().all(|l| l.is_terminated()));
    }

    #[test]
    fn test_loop_shared_between_groups() {
        let shared = spawn("elg-shared");
        let first = EventLoopGroup::new();
        let second = EventLoopGroup::new();
        first.add_worker(shared.clone());
        second.add_worker(shared.clone());

        assert_eq!(first.loops(), vec![shared.clone()]);
        assert_eq!(second.next().unwrap(), shared);

        first.remove_worker(&shared).unwrap();
        assert_eq!(first.worker_count(), 0);
        assert_eq!(second.worker_count(), 1);

        second.shutdown();
        assert!(shared.await_termination(WAIT));
    }
}
