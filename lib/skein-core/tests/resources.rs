//! Resource handle scenarios: scopes, pooling, asynchronous sourcing and discarding.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        mpsc, Arc, Condvar, Mutex,
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use skein_core::{
    config::RuntimeConfiguration,
    context::{FunctionContext, Next},
    diagnostics::Diagnostic,
    escalation::{Escalation, EscalationKind},
    graph::{FunctionSpec, GraphBuilder, ResourceSpec, Scope},
    pool::{FixedWorkerPool, OverloadPolicy, PassivePool},
    resource::{CompletionListener, ResourceSource, SourceContext, Sourcing, ThreadKeyedPool},
    runtime::{Runtime, RuntimeBuilder},
    Value,
};
use skein_error::{generic_error, GenericError};

const WAIT: Duration = Duration::from_secs(10);

fn runtime(graph: GraphBuilder, io: FixedWorkerPool) -> Runtime {
    let runtime = RuntimeBuilder::new(RuntimeConfiguration::default())
        .with_pool(Arc::new(PassivePool::new("main")))
        .with_pool(Arc::new(io))
        .build(graph)
        .unwrap();
    runtime.start().unwrap();
    runtime
}

// Counts values sourced and discarded, optionally failing every discard.
#[derive(Default)]
struct Tracked {
    sourced: AtomicUsize,
    discarded: AtomicUsize,
    fail_discard: bool,
}

impl Tracked {
    fn failing_discard() -> Self {
        Self {
            fail_discard: true,
            ..Self::default()
        }
    }
}

impl ResourceSource for Tracked {
    fn source(&self, _ctx: &mut SourceContext<'_>) -> Sourcing {
        let generation = self.sourced.fetch_add(1, SeqCst);
        Sourcing::ready(generation)
    }

    fn discard(&self, value: Value) -> Result<(), GenericError> {
        self.discarded.fetch_add(1, SeqCst);
        drop(value);
        if self.fail_discard {
            Err(generic_error!("socket already closed"))
        } else {
            Ok(())
        }
    }
}

// Hands its listener to the test instead of settling the handle itself.
#[derive(Default)]
struct Stashed {
    listener: Mutex<Option<CompletionListener>>,
    discarded: AtomicUsize,
}

impl Stashed {
    fn take_listener(&self) -> CompletionListener {
        eventually(|| self.listener.lock().unwrap().take())
    }
}

impl ResourceSource for Stashed {
    fn source(&self, ctx: &mut SourceContext<'_>) -> Sourcing {
        *self.listener.lock().unwrap() = Some(ctx.listener());
        Sourcing::Pending
    }

    fn discard(&self, _value: Value) -> Result<(), GenericError> {
        self.discarded.fetch_add(1, SeqCst);
        Ok(())
    }
}

fn eventually<T>(f: impl Fn() -> Option<T>) -> T {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(value) = f() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn thread_scope_values_are_reused_on_the_same_worker() {
    let source = Arc::new(Tracked::default());
    let pool = Arc::new(ThreadKeyedPool::new("buffers", 1));
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);

    let graph = GraphBuilder::default()
        .add_resource(ResourceSpec::from_source("buffer", Scope::Thread, source.clone()).with_pool(pool.clone()))
        .add_function(
            FunctionSpec::new("fill", "io", move |ctx: &mut FunctionContext<'_>| {
                let generation = ctx.dependency::<usize>(0)?;
                tx.lock().unwrap().send((*generation, thread::current().id())).unwrap();
                Ok(Next::default())
            })
            .with_dependency("buffer"),
        );
    let runtime = runtime(graph, FixedWorkerPool::single("io"));

    for _ in 0..2 {
        let outcome = runtime
            .invoke_process_by_name("fill", None, |_| {})
            .unwrap()
            .wait_timeout(WAIT)
            .unwrap();
        assert!(outcome.is_success(), "{:?}", outcome.escalation());
    }

    let (first, worker) = rx.recv_timeout(WAIT).unwrap();
    let (second, _) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!((first, second), (0, 0));
    assert_eq!(source.sourced.load(SeqCst), 1);
    assert_eq!(pool.idle_for(worker), 1);
    assert_eq!(source.discarded.load(SeqCst), 0);

    // Stopping the runtime drains the pool through the source.
    runtime.stop();
    assert_eq!(pool.idle_for(worker), 0);
    assert_eq!(source.discarded.load(SeqCst), 1);
}

#[test]
fn thread_scope_value_held_by_failed_function_is_discarded() {
    let source = Arc::new(Tracked::default());
    let pool = Arc::new(ThreadKeyedPool::new("buffers", 4));
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);

    let graph = GraphBuilder::default()
        .add_resource(ResourceSpec::from_source("buffer", Scope::Thread, source.clone()).with_pool(pool.clone()))
        .add_function(
            FunctionSpec::new("fill", "io", move |ctx: &mut FunctionContext<'_>| {
                ctx.dependency::<usize>(0)?;
                tx.lock().unwrap().send(thread::current().id()).unwrap();
                Err(generic_error!("buffer overflow"))
            })
            .with_dependency("buffer"),
        );
    let runtime = runtime(graph, FixedWorkerPool::single("io"));

    let outcome = runtime
        .invoke_process_by_name("fill", None, |_| {})
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap();
    assert_eq!(outcome.escalation().map(|e| e.kind()), Some(EscalationKind::Function));

    let worker = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(pool.idle_for(worker), 0);
    assert_eq!(source.discarded.load(SeqCst), 1);
    runtime.stop();
}

#[test]
fn asynchronous_source_resumes_suspended_function() {
    let (settled_tx, settled_rx) = mpsc::channel();
    let settled_tx = Mutex::new(settled_tx);
    let (value_tx, value_rx) = mpsc::channel();
    let value_tx = Mutex::new(value_tx);

    let graph = GraphBuilder::default()
        .add_resource(ResourceSpec::new("config", Scope::Function, move |ctx: &mut SourceContext<'_>| {
            let listener = ctx.listener();
            let settled_tx = settled_tx.lock().unwrap().clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let first = listener.complete(String::from("ready"));
                let second = listener.complete(String::from("too late"));
                settled_tx.send((first, second)).unwrap();
            });
            Sourcing::Pending
        }))
        .add_function(
            FunctionSpec::new("read", "io", move |ctx: &mut FunctionContext<'_>| {
                let config = ctx.dependency::<String>(0)?;
                value_tx.lock().unwrap().send(config.as_str().to_string()).unwrap();
                Ok(Next::default())
            })
            .with_dependency("config"),
        );
    let runtime = runtime(graph, FixedWorkerPool::new("io", 2, 64, OverloadPolicy::Queue));

    let outcome = runtime
        .invoke_process_by_name("read", None, |_| {})
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap();
    assert!(outcome.is_success(), "{:?}", outcome.escalation());
    assert_eq!(value_rx.recv_timeout(WAIT).unwrap(), "ready");
    assert_eq!(settled_rx.recv_timeout(WAIT).unwrap(), (true, false));
    runtime.stop();
}

#[test]
fn process_scope_value_is_sourced_once_for_concurrent_flows() {
    let sourced = Arc::new(AtomicUsize::new(0));
    let readers = Arc::new(AtomicUsize::new(0));

    let graph = GraphBuilder::default()
        .add_resource(ResourceSpec::new("session", Scope::Process, {
            let sourced = Arc::clone(&sourced);
            move |ctx: &mut SourceContext<'_>| {
                sourced.fetch_add(1, SeqCst);
                let listener = ctx.listener();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20));
                    listener.complete(7u64);
                });
                Sourcing::Pending
            }
        }))
        .add_function(
            FunctionSpec::new("fan_out", "main", |ctx: &mut FunctionContext<'_>| {
                ctx.join(vec![(0, None), (0, None)], |failure| match failure {
                    None => Ok(()),
                    Some(e) => Err(generic_error!("reader failed: {}", e)),
                })?;
                Ok(Next::Stop)
            })
            .with_flow("reader"),
        )
        .add_function(
            FunctionSpec::new("reader", "io", {
                let readers = Arc::clone(&readers);
                move |ctx: &mut FunctionContext<'_>| {
                    assert_eq!(*ctx.dependency::<u64>(0)?, 7);
                    readers.fetch_add(1, SeqCst);
                    Ok(Next::default())
                }
            })
            .with_dependency("session"),
        );
    let runtime = runtime(graph, FixedWorkerPool::new("io", 2, 64, OverloadPolicy::Queue));

    let outcome = runtime
        .invoke_process_by_name("fan_out", None, |_| {})
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap();
    assert!(outcome.is_success(), "{:?}", outcome.escalation());
    assert_eq!(sourced.load(SeqCst), 1);
    assert_eq!(readers.load(SeqCst), 2);
    runtime.stop();
}

#[test]
fn process_scope_value_is_discarded_once_the_process_finishes() {
    let source = Arc::new(Tracked::default());
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);

    let graph = GraphBuilder::default()
        .add_resource(ResourceSpec::from_source("conn", Scope::Process, source.clone()))
        .add_function(
            FunctionSpec::new("open", "main", |ctx: &mut FunctionContext<'_>| {
                ctx.dependency::<usize>(0)?;
                Ok(Next::default())
            })
            .with_dependency("conn")
            .with_next("query"),
        )
        .add_function(
            FunctionSpec::new("query", "io", {
                let source = Arc::clone(&source);
                move |ctx: &mut FunctionContext<'_>| {
                    let generation = ctx.dependency::<usize>(0)?;
                    tx.lock()
                        .unwrap()
                        .send((*generation, source.discarded.load(SeqCst)))
                        .unwrap();
                    Ok(Next::default())
                }
            })
            .with_dependency("conn"),
        );
    let runtime = runtime(graph, FixedWorkerPool::new("io", 2, 64, OverloadPolicy::Queue));

    let outcome = runtime
        .invoke_process_by_name("open", None, |_| {})
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap();
    assert!(outcome.is_success(), "{:?}", outcome.escalation());

    // Both functions shared the same handle, which outlived the first of them.
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (0, 0));
    assert_eq!(source.sourced.load(SeqCst), 1);
    assert_eq!(source.discarded.load(SeqCst), 1);
    runtime.stop();
}

#[test]
fn failed_discard_is_reported_as_a_diagnostic() {
    let source = Arc::new(Tracked::failing_discard());
    let graph = GraphBuilder::default()
        .add_resource(ResourceSpec::from_source("socket", Scope::Function, source.clone()))
        .add_function(
            FunctionSpec::new("send", "io", |ctx: &mut FunctionContext<'_>| {
                ctx.dependency::<usize>(0)?;
                Ok(Next::default())
            })
            .with_dependency("socket"),
        );
    let runtime = runtime(graph, FixedWorkerPool::single("io"));

    let diagnostics = Arc::new(Mutex::new(Vec::new()));
    runtime.diagnostics().subscribe({
        let diagnostics = Arc::clone(&diagnostics);
        move |diagnostic: &Diagnostic| diagnostics.lock().unwrap().push(diagnostic.clone())
    });

    let outcome = runtime
        .invoke_process_by_name("send", None, |_| {})
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap();

    // The failure has nobody to escalate to, so the process itself still succeeds.
    assert!(outcome.is_success(), "{:?}", outcome.escalation());
    assert_eq!(source.discarded.load(SeqCst), 1);

    let diagnostics = diagnostics.lock().unwrap();
    assert_eq!(diagnostics.len(), 1);
    match &diagnostics[0] {
        Diagnostic::DiscardFailed { resource, error } => {
            assert_eq!(&**resource, "socket");
            assert!(error.contains("socket already closed"), "{}", error);
        }
        other => panic!("unexpected diagnostic: {}", other),
    }
    drop(diagnostics);
    runtime.stop();
}

#[test]
fn resource_cycle_escalates_as_sourcing_failure() {
    let graph = GraphBuilder::default()
        .add_resource(ResourceSpec::new("a", Scope::Function, |_| Sourcing::ready(())).with_dependency("b"))
        .add_resource(ResourceSpec::new("b", Scope::Function, |_| Sourcing::ready(())).with_dependency("a"))
        .add_function(
            FunctionSpec::new("start", "main", |_: &mut FunctionContext<'_>| Ok(Next::default())).with_dependency("a"),
        );
    let runtime = runtime(graph, FixedWorkerPool::single("io"));

    let outcome = runtime
        .invoke_process_by_name("start", None, |_| {})
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap();
    let escalation = outcome.escalation().unwrap();
    assert_eq!(escalation.kind(), EscalationKind::Sourcing);
    assert!(escalation.to_string().contains("dependency cycle detected"), "{}", escalation);
    runtime.stop();
}

#[test]
fn failing_source_escalates_as_sourcing_failure() {
    let graph = GraphBuilder::default()
        .add_resource(ResourceSpec::new("db", Scope::Process, |_| {
            Sourcing::failed(generic_error!("connection refused"))
        }))
        .add_function(
            FunctionSpec::new("query", "io", |_: &mut FunctionContext<'_>| Ok(Next::default())).with_dependency("db"),
        );
    let runtime = runtime(graph, FixedWorkerPool::single("io"));

    let outcome = runtime
        .invoke_process_by_name("query", None, |_| {})
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap();
    let escalation = outcome.escalation().unwrap();
    assert_eq!(escalation.kind(), EscalationKind::Sourcing);
    assert!(escalation.to_string().contains("connection refused"), "{}", escalation);
    runtime.stop();
}

#[test]
fn process_scope_values_are_reused_across_processes() {
    let source = Arc::new(Tracked::default());
    let pool = Arc::new(ThreadKeyedPool::new("conns", 4));

    let graph = GraphBuilder::default()
        .add_resource(ResourceSpec::from_source("conn", Scope::Process, source.clone()).with_pool(pool.clone()))
        .add_function(
            FunctionSpec::new("query", "main", |ctx: &mut FunctionContext<'_>| {
                ctx.dependency::<usize>(0)?;
                Ok(Next::default())
            })
            .with_dependency("conn"),
        );
    let runtime = runtime(graph, FixedWorkerPool::single("io"));

    // Passive work invoked from this thread runs on it, so every process sources from the same slot of the pool.
    for _ in 0..3 {
        let outcome = runtime
            .invoke_process_by_name("query", None, |_| {})
            .unwrap()
            .wait_timeout(WAIT)
            .unwrap();
        assert!(outcome.is_success(), "{:?}", outcome.escalation());
    }

    assert_eq!(source.sourced.load(SeqCst), 1);
    assert_eq!(pool.idle_for(thread::current().id()), 1);
    assert_eq!(source.discarded.load(SeqCst), 0);

    runtime.stop();
    assert_eq!(source.discarded.load(SeqCst), 1);
}

#[test]
fn thread_scope_value_returns_to_the_thread_that_sourced_it() {
    let buffers = Arc::new(Tracked::default());
    let buffer_threads = Arc::new(Mutex::new(Vec::new()));
    let pool = Arc::new(ThreadKeyedPool::new("buffers", 4));
    let gate = Arc::new(Stashed::default());

    // Held workers block until their thread is released.
    let released = Arc::new((Mutex::new(HashSet::<ThreadId>::new()), Condvar::new()));
    let (held_tx, held_rx) = mpsc::channel();
    let held_tx = Mutex::new(held_tx);
    let (ran_tx, ran_rx) = mpsc::channel();
    let ran_tx = Mutex::new(ran_tx);

    let buffer = ResourceSpec::new("buffer", Scope::Thread, {
        let buffers = Arc::clone(&buffers);
        let buffer_threads = Arc::clone(&buffer_threads);
        move |_: &mut SourceContext<'_>| {
            buffer_threads.lock().unwrap().push(thread::current().id());
            Sourcing::ready(buffers.sourced.fetch_add(1, SeqCst))
        }
    });

    let graph = GraphBuilder::default()
        .add_resource(buffer.with_pool(pool.clone()))
        .add_resource(ResourceSpec::from_source("gate", Scope::Function, gate.clone()))
        .add_function(
            FunctionSpec::new("fill", "io", move |ctx: &mut FunctionContext<'_>| {
                ctx.dependency::<usize>(0)?;
                ran_tx.lock().unwrap().send(thread::current().id()).unwrap();
                Ok(Next::default())
            })
            .with_dependency("buffer")
            .with_dependency("gate"),
        )
        .add_function(FunctionSpec::new("hold", "io", {
            let released = Arc::clone(&released);
            move |_: &mut FunctionContext<'_>| {
                let me = thread::current().id();
                held_tx.lock().unwrap().send(me).unwrap();
                let (set, signal) = &*released;
                let mut set = set.lock().unwrap();
                while !set.contains(&me) {
                    set = signal.wait(set).unwrap();
                }
                Ok(Next::default())
            }
        }));
    let runtime = runtime(graph, FixedWorkerPool::new("io", 2, 8, OverloadPolicy::Queue));
    let release = |thread: ThreadId| {
        let (set, signal) = &*released;
        set.lock().unwrap().insert(thread);
        signal.notify_all();
    };

    // The buffer is sourced on the first worker, then the function suspends on the gate.
    let fill = runtime.invoke_process_by_name("fill", None, |_| {}).unwrap();
    let listener = gate.take_listener();
    let first = buffer_threads.lock().unwrap()[0];

    // Occupy both workers, then let only the other one pick up the resumed function.
    let holds = (0..2)
        .map(|_| runtime.invoke_process_by_name("hold", None, |_| {}).unwrap())
        .collect::<Vec<_>>();
    let held = (0..2).map(|_| held_rx.recv_timeout(WAIT).unwrap()).collect::<HashSet<_>>();
    assert!(held.contains(&first));
    let second = held.into_iter().find(|thread| *thread != first).unwrap();

    assert!(listener.complete(()));
    release(second);
    let outcome = fill.wait_timeout(WAIT).unwrap();
    assert!(outcome.is_success(), "{:?}", outcome.escalation());
    assert_eq!(ran_rx.recv_timeout(WAIT).unwrap(), second);

    release(first);
    for hold in holds {
        assert!(hold.wait_timeout(WAIT).unwrap().is_success());
    }

    assert_eq!(buffers.sourced.load(SeqCst), 1);
    assert_eq!(pool.idle_for(first), 1);
    assert_eq!(pool.idle_for(second), 0);
    runtime.stop();
}

#[test]
fn cancelling_a_process_waiting_on_a_process_scope_resource() {
    let source = Arc::new(Stashed::default());
    let callbacks = Arc::new(AtomicUsize::new(0));
    let ran = Arc::new(AtomicUsize::new(0));

    let graph = GraphBuilder::default()
        .add_resource(ResourceSpec::from_source("session", Scope::Process, source.clone()))
        .add_function(
            FunctionSpec::new("query", "io", {
                let ran = Arc::clone(&ran);
                move |_: &mut FunctionContext<'_>| {
                    ran.fetch_add(1, SeqCst);
                    Ok(Next::default())
                }
            })
            .with_dependency("session"),
        );
    let runtime = runtime(graph, FixedWorkerPool::single("io"));

    let handle = runtime
        .invoke_process_by_name("query", None, {
            let callbacks = Arc::clone(&callbacks);
            move |_| {
                callbacks.fetch_add(1, SeqCst);
            }
        })
        .unwrap();
    let listener = source.take_listener();
    assert!(handle.cancel());

    let outcome = handle.wait_timeout(WAIT).unwrap();
    assert!(matches!(outcome.escalation(), Some(Escalation::Cancelled { .. })), "{:?}", outcome.escalation());
    assert_eq!(callbacks.load(SeqCst), 1);
    assert_eq!(ran.load(SeqCst), 0);

    // The value arrives after the handle was failed, so it goes straight back to the source.
    assert!(!listener.complete(42u32));
    assert_eq!(source.discarded.load(SeqCst), 1);
    assert_eq!(callbacks.load(SeqCst), 1);
    runtime.stop();
}

#[test]
fn value_settled_through_the_listener_and_returned_is_discarded() {
    let source = Arc::new(Tracked::default());
    let graph = GraphBuilder::default()
        .add_resource(ResourceSpec::from_source("socket", Scope::Function, {
            struct Eager(Arc<Tracked>);

            impl ResourceSource for Eager {
                fn source(&self, ctx: &mut SourceContext<'_>) -> Sourcing {
                    ctx.listener().complete(usize::MAX);
                    self.0.source(ctx)
                }

                fn discard(&self, value: Value) -> Result<(), GenericError> {
                    self.0.discard(value)
                }
            }

            Arc::new(Eager(source.clone()))
        }))
        .add_function(
            FunctionSpec::new("send", "main", |ctx: &mut FunctionContext<'_>| {
                if *ctx.dependency::<usize>(0)? != usize::MAX {
                    return Err(generic_error!("expected the value settled through the listener"));
                }
                Ok(Next::default())
            })
            .with_dependency("socket"),
        );
    let runtime = runtime(graph, FixedWorkerPool::single("io"));

    let outcome = runtime
        .invoke_process_by_name("send", None, |_| {})
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap();
    assert!(outcome.is_success(), "{:?}", outcome.escalation());

    // One discard for the value returned by the source, one for the value the function used.
    assert_eq!(source.sourced.load(SeqCst), 1);
    assert_eq!(source.discarded.load(SeqCst), 2);
    runtime.stop();
}
