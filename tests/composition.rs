use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use tether::{
    default_loop, launch, make_ready_future, promise, then, then_flatten, Async, Error, Launch,
    LazyValue, RunMode, Step,
};

#[test]
fn doubled_in_one_iteration() {
    let lp = tether::Loop::new().unwrap();
    let handle = Async::<i32, i32>::new(&lp);
    handle.start(|x| x * 2).unwrap();

    let sender = {
        let handle = handle.clone();
        thread::spawn(move || handle.send(21).unwrap())
    };
    let answer = sender.join().unwrap();
    lp.run(RunMode::NoWait).unwrap();
    assert_eq!(answer.get(), Ok(42));
    handle.stop().unwrap();
}

#[test]
fn async_five_plus_one() {
    let five = launch(Launch::Async, || 5);
    assert_eq!(then(five, |v| v + 1, Launch::Deferred).get(), Ok(6));
}

#[test]
fn three_step_chain_mixing_values_and_futures() {
    let (p, start) = promise::<u32>();
    let chain = start
        .then(|v| v + 1)
        .then_flatten(|v| launch(Launch::Async, move || v * 10))
        .then_flatten(|v| {
            if v > 100 {
                Step::Ready(v)
            } else {
                Step::Pending(make_ready_future(Step::Ready(v + 1000)))
            }
        })
        .then(|v| format!("{v}"));
    p.set_value(4);
    assert_eq!(chain.get().unwrap(), "1050");
}

#[test]
fn errors_skip_the_rest_of_the_chain() {
    let calls = std::sync::Arc::new(AtomicUsize::new(0));
    let c1 = calls.clone();
    let c2 = calls.clone();
    let chain = launch(Launch::Async, || -> u8 { panic!("first step failed") })
        .then(move |v| {
            c1.fetch_add(1, Ordering::SeqCst);
            v
        })
        .then_with(Launch::Deferred, move |v| {
            c2.fetch_add(1, Ordering::SeqCst);
            v
        });
    assert_eq!(chain.get(), Err(Error::Panicked("first step failed".into())));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn flatten_through_a_loop_handle() {
    let lp = tether::Loop::new().unwrap();
    let handle = Async::<u32, u32>::new(&lp);
    handle.start(|x| x + 1).unwrap();
    let runner = {
        let lp = lp.clone();
        thread::spawn(move || lp.run(RunMode::Default).unwrap())
    };

    let sender = handle.clone();
    let result = then_flatten(
        make_ready_future(1u32),
        move |v| sender.send(v).unwrap(),
        Launch::Async,
    );
    assert_eq!(result.get(), Ok(2));

    lp.stop();
    runner.join().unwrap();
    handle.stop().unwrap();
}

static CONFIGURED: LazyValue<String> = LazyValue::new(read_setting);

fn read_setting() -> Result<String, Error> {
    Ok(format!("setting-{}", 7))
}

#[test]
fn lazy_static_is_shared_across_threads() {
    let readers: Vec<_> = (0..8)
        .map(|_| thread::spawn(|| CONFIGURED.get().map(|s| s.as_ptr() as usize)))
        .collect();
    let addrs: Vec<_> = readers.into_iter().map(|r| r.join().unwrap().unwrap()).collect();
    assert!(addrs.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(CONFIGURED.try_get().map(String::as_str), Some("setting-7"));
}

#[test]
fn default_loop_runs_handles() {
    let lp = default_loop().unwrap();
    let handle = Async::<(), &'static str>::new(&lp);
    handle.start(|()| "pong").unwrap();
    let reply = handle.send(()).unwrap();
    lp.run(RunMode::NoWait).unwrap();
    assert_eq!(reply.get(), Ok("pong"));
    handle.stop().unwrap();
}
