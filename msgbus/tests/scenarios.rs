//! Cross-module scenarios for the message bus.
#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code: unwrap/expect are acceptable

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use msgbus::{Dispatcher, Handler, HandlerSpec, Message};

struct Recording {
    label: &'static str,
    order: Arc<Mutex<Vec<&'static str>>>,
    retval: bool,
}

impl Handler for Recording {
    fn receive(&self, _msg: &mut Message) -> bool {
        self.order.lock().unwrap_or_else(|e| e.into_inner()).push(self.label);
        self.retval
    }
}

/// Installs H4 and uninstalls H2 from inside H1's own `receive` call.
struct Mutator {
    dispatcher: Arc<Dispatcher>,
    order: Arc<Mutex<Vec<&'static str>>>,
    h2: Arc<msgbus::HandlerSpec>,
}

impl Handler for Mutator {
    fn receive(&self, _msg: &mut Message) -> bool {
        self.order.lock().unwrap_or_else(|e| e.into_inner()).push("H1");
        self.dispatcher.install(HandlerSpec::new(
            "scenario.s5",
            150,
            Arc::new(Recording {
                label: "H4",
                order: self.order.clone(),
                retval: false,
            }),
        ));
        self.dispatcher.uninstall(&self.h2).expect("H2 not in flight from itself");
        false
    }
}

#[test]
fn s5_dispatcher_priority_and_mutation() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = Arc::new(Dispatcher::new());

    let h2 = dispatcher.install(HandlerSpec::new(
        "scenario.s5",
        200,
        Arc::new(Recording {
            label: "H2",
            order: order.clone(),
            retval: false,
        }),
    ));
    dispatcher.install(HandlerSpec::new(
        "scenario.s5",
        300,
        Arc::new(Recording {
            label: "H3",
            order: order.clone(),
            retval: false,
        }),
    ));
    dispatcher.install(HandlerSpec::new(
        "scenario.s5",
        100,
        Arc::new(Mutator {
            dispatcher: dispatcher.clone(),
            order: order.clone(),
            h2,
        }),
    ));

    let mut msg = Message::new("scenario.s5", "", true);
    dispatcher.dispatch(&mut msg);

    assert_eq!(
        *order.lock().unwrap_or_else(|e| e.into_inner()),
        vec!["H1", "H4", "H3"]
    );
}

#[test]
fn s6_broadcast_runs_all_three_and_returns_true() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = Dispatcher::new();

    dispatcher.install(HandlerSpec::new(
        "scenario.s6",
        10,
        Arc::new(Recording {
            label: "first",
            order: order.clone(),
            retval: true,
        }),
    ));
    dispatcher.install(HandlerSpec::new(
        "scenario.s6",
        20,
        Arc::new(Recording {
            label: "second",
            order: order.clone(),
            retval: false,
        }),
    ));
    dispatcher.install(HandlerSpec::new(
        "scenario.s6",
        30,
        Arc::new(Recording {
            label: "third",
            order: order.clone(),
            retval: false,
        }),
    ));

    let mut msg = Message::new("scenario.s6", "", true);
    let accepted = dispatcher.dispatch(&mut msg);

    assert!(accepted);
    assert_eq!(
        *order.lock().unwrap_or_else(|e| e.into_inner()),
        vec!["first", "second", "third"]
    );
}

#[test]
fn invariant_fifo_preserves_enqueue_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = Dispatcher::new();
    dispatcher.install(HandlerSpec::new(
        "scenario.fifo",
        0,
        Arc::new(Recording {
            label: "sink",
            order: order.clone(),
            retval: true,
        }),
    ));

    for _ in 0..3 {
        dispatcher
            .enqueue(Message::new("scenario.fifo", "", false))
            .expect("capacity is unbounded by default");
    }

    let mut seen = Vec::new();
    while let Some(mut msg) = dispatcher.dequeue_one() {
        seen.push(msg.name().to_string());
        dispatcher.dispatch(&mut msg);
    }
    assert_eq!(seen, vec!["scenario.fifo", "scenario.fifo", "scenario.fifo"]);
    assert_eq!(order.lock().unwrap_or_else(|e| e.into_inner()).len(), 3);
}

#[test]
fn invariant_uninstall_liveness_waits_for_in_flight_call() {
    struct Slow {
        started: Arc<AtomicBool>,
        may_finish: Arc<AtomicBool>,
    }
    impl Handler for Slow {
        fn receive(&self, _msg: &mut Message) -> bool {
            self.started.store(true, Ordering::SeqCst);
            while !self.may_finish.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            true
        }
    }

    let started = Arc::new(AtomicBool::new(false));
    let may_finish = Arc::new(AtomicBool::new(false));
    let dispatcher = Arc::new(Dispatcher::new());
    let handle = dispatcher.install(HandlerSpec::new(
        "scenario.liveness",
        0,
        Arc::new(Slow {
            started: started.clone(),
            may_finish: may_finish.clone(),
        }),
    ));

    let dispatcher_bg = dispatcher.clone();
    let thread = std::thread::spawn(move || {
        let mut msg = Message::new("scenario.liveness", "", false);
        dispatcher_bg.dispatch(&mut msg);
    });

    while !started.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }

    let uninstall_thread = {
        let dispatcher = dispatcher.clone();
        let handle = handle.clone();
        std::thread::spawn(move || dispatcher.uninstall(&handle))
    };

    std::thread::sleep(std::time::Duration::from_millis(20));
    may_finish.store(true, Ordering::SeqCst);

    thread.join().expect("dispatch thread finished");
    uninstall_thread
        .join()
        .expect("uninstall thread finished")
        .expect("uninstall did not time out");
}
