use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use msgbus::{Dispatcher, Handler, HandlerSpec, Message};

struct NoOp;
impl Handler for NoOp {
    fn receive(&self, msg: &mut Message) -> bool {
        msg.set_retval("handled");
        true
    }
}

fn bench_single_handler_dispatch(c: &mut Criterion) {
    let dispatcher = Dispatcher::new();
    dispatcher.install(HandlerSpec::new("bench.ping", 50, Arc::new(NoOp)));

    c.bench_function("dispatch_single_handler", |b| {
        b.iter(|| {
            let mut msg = Message::new("bench.ping", "", false);
            black_box(dispatcher.dispatch(&mut msg));
        });
    });
}

fn bench_many_handlers_broadcast(c: &mut Criterion) {
    let dispatcher = Dispatcher::new();
    for priority in 0..64 {
        dispatcher.install(HandlerSpec::new("bench.broadcast", priority, Arc::new(NoOp)));
    }

    c.bench_function("dispatch_broadcast_64_handlers", |b| {
        b.iter(|| {
            let mut msg = Message::new("bench.broadcast", "", true);
            black_box(dispatcher.dispatch(&mut msg));
        });
    });
}

fn bench_enqueue_dequeue(c: &mut Criterion) {
    let dispatcher = Dispatcher::new();
    dispatcher.install(HandlerSpec::new("bench.queued", 0, Arc::new(NoOp)));

    c.bench_function("enqueue_dequeue_sync", |b| {
        b.iter(|| {
            let _ = dispatcher.enqueue(Message::new("bench.queued", "", false));
            black_box(dispatcher.dequeue_one());
        });
    });
}

criterion_group!(
    benches,
    bench_single_handler_dispatch,
    bench_many_handlers_broadcast,
    bench_enqueue_dequeue
);
criterion_main!(benches);
