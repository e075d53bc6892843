//! Dispatcher Tests

mod test_helper;

use proxycore::{ConnectionIds, ConnectionSocket, Dispatcher, Error, RunType};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use test_helper::*;

// ============================================================================
// Post Queue
// ============================================================================

#[test]
fn posts_before_run_execute_in_order() {
    let dispatcher = new_dispatcher();
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..5 {
        let order = order.clone();
        dispatcher.post(Box::new(move |_: &Dispatcher| order.lock().unwrap().push(i)));
    }
    assert!(order.lock().unwrap().is_empty());

    dispatcher.run(RunType::NonBlock).unwrap();
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn posts_run_before_timers() {
    let dispatcher = new_dispatcher();
    let (tx, rx) = mpsc::channel();
    let post_seen_first = Rc::new(RefCell::new(None));

    let seen = post_seen_first.clone();
    let timer = dispatcher.create_timer(Box::new(move || {
        *seen.borrow_mut() = Some(rx.try_recv().is_ok());
    }));
    timer.enable(Duration::ZERO);
    dispatcher.post(Box::new(move |_: &Dispatcher| tx.send(()).unwrap()));

    dispatcher.run(RunType::NonBlock).unwrap();
    assert_eq!(*post_seen_first.borrow(), Some(true));
}

#[test]
fn post_handle_wakes_loop_from_another_thread() {
    let dispatcher = new_dispatcher();
    let handle = dispatcher.post_handle();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let seen_thread = seen.clone();
    let poster = thread::spawn(move || {
        for i in 0..10 {
            let seen = seen_thread.clone();
            handle.post(Box::new(move |_: &Dispatcher| seen.lock().unwrap().push(i)));
        }
        let exit = handle.clone();
        handle.post(Box::new(move |_: &Dispatcher| exit.exit()));
    });

    let started = Instant::now();
    dispatcher.run(RunType::RunUntilExit).unwrap();
    poster.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn post_callback_receives_dispatcher() {
    let dispatcher = new_dispatcher();
    let (tx, rx) = mpsc::channel();
    dispatcher.post(Box::new(move |dispatcher: &Dispatcher| {
        tx.send(dispatcher.is_thread_safe()).unwrap();
        dispatcher.exit();
    }));

    dispatcher.run(RunType::RunUntilExit).unwrap();
    assert!(rx.try_recv().unwrap());
}

// ============================================================================
// Timers
// ============================================================================

#[test]
fn timers_fire_in_deadline_order() {
    let dispatcher = new_dispatcher();
    let order = Rc::new(RefCell::new(Vec::new()));

    let mut timers = Vec::new();
    for (name, delay) in [("slow", 30), ("fast", 5), ("medium", 15)] {
        let order = order.clone();
        let timer = dispatcher.create_timer(Box::new(move || order.borrow_mut().push(name)));
        timer.enable(Duration::from_millis(delay));
        timers.push(timer);
    }

    dispatcher.run(RunType::Block).unwrap();
    assert_eq!(*order.borrow(), vec!["fast", "medium", "slow"]);
    assert!(timers.iter().all(|timer| !timer.enabled()));
}

#[test]
fn disabled_and_dropped_timers_do_not_fire() {
    let dispatcher = new_dispatcher();
    let fired = Rc::new(RefCell::new(0));

    let disabled_count = fired.clone();
    let disabled = dispatcher.create_timer(Box::new(move || *disabled_count.borrow_mut() += 1));
    disabled.enable(Duration::from_millis(1));
    assert!(disabled.enabled());
    disabled.disable();
    assert!(!disabled.enabled());

    let dropped_count = fired.clone();
    let dropped = dispatcher.create_timer(Box::new(move || *dropped_count.borrow_mut() += 1));
    dropped.enable(Duration::from_millis(1));
    drop(dropped);

    thread::sleep(Duration::from_millis(5));
    run_iterations(&dispatcher, 2);
    assert_eq!(*fired.borrow(), 0);
}

#[test]
fn enabling_again_replaces_deadline() {
    let dispatcher = new_dispatcher();
    let fired = Rc::new(RefCell::new(0));

    let count = fired.clone();
    let timer = dispatcher.create_timer(Box::new(move || *count.borrow_mut() += 1));
    timer.enable(Duration::ZERO);
    timer.enable(Duration::from_secs(60));

    run_iterations(&dispatcher, 2);
    assert_eq!(*fired.borrow(), 0);
    assert!(timer.enabled());
}

#[test]
fn block_run_returns_without_work() {
    let dispatcher = new_dispatcher();
    let started = Instant::now();
    dispatcher.run(RunType::Block).unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

// ============================================================================
// Deferred Delete
// ============================================================================

struct DropRecorder {
    name: &'static str,
    log: Rc<RefCell<Vec<&'static str>>>,
    // Deferred from inside this item's drop.
    then_defer: Option<(Dispatcher, Box<DropRecorder>)>,
}

impl Drop for DropRecorder {
    fn drop(&mut self) {
        self.log.borrow_mut().push(self.name);
        if let Some((dispatcher, next)) = self.then_defer.take() {
            dispatcher.deferred_delete(next);
        }
    }
}

fn recorder(name: &'static str, log: &Rc<RefCell<Vec<&'static str>>>) -> DropRecorder {
    DropRecorder {
        name,
        log: log.clone(),
        then_defer: None,
    }
}

#[test]
fn deferred_deletes_drop_in_queue_order() {
    let dispatcher = new_dispatcher();
    let log = Rc::new(RefCell::new(Vec::new()));

    dispatcher.deferred_delete(recorder("first", &log));
    dispatcher.deferred_delete(recorder("second", &log));
    dispatcher.deferred_delete(recorder("third", &log));
    assert!(log.borrow().is_empty());

    dispatcher.clear_deferred_delete_list();
    assert_eq!(*log.borrow(), vec!["first", "second", "third"]);
}

#[test]
fn deletes_queued_while_clearing_wait_for_next_clear() {
    let dispatcher = new_dispatcher();
    let log = Rc::new(RefCell::new(Vec::new()));

    let mut outer = recorder("outer", &log);
    outer.then_defer = Some((dispatcher.clone(), Box::new(recorder("inner", &log))));
    dispatcher.deferred_delete(outer);

    dispatcher.clear_deferred_delete_list();
    assert_eq!(*log.borrow(), vec!["outer"]);

    dispatcher.clear_deferred_delete_list();
    assert_eq!(*log.borrow(), vec!["outer", "inner"]);
}

#[test]
fn loop_iteration_clears_deferred_deletes() {
    let dispatcher = new_dispatcher();
    let log = Rc::new(RefCell::new(Vec::new()));

    dispatcher.deferred_delete(recorder("item", &log));
    dispatcher.run(RunType::Block).unwrap();
    assert_eq!(*log.borrow(), vec!["item"]);
}

// ============================================================================
// Pipe Factories and Connection Ids
// ============================================================================

#[test]
fn pipe_factory_registration() {
    let dispatcher = new_dispatcher();

    let err = dispatcher.create_user_space_pipe("missing").unwrap_err();
    assert!(matches!(err, Error::NoPipeListener { ref address } if address == "missing"));

    let accepted = Rc::new(RefCell::new(0));
    let count = accepted.clone();
    dispatcher
        .register_pipe_factory(
            "svc",
            Rc::new(move |_: &Dispatcher, _socket: ConnectionSocket| *count.borrow_mut() += 1),
        )
        .unwrap();

    let err = dispatcher
        .register_pipe_factory("svc", Rc::new(|_: &Dispatcher, _socket: ConnectionSocket| {}))
        .unwrap_err();
    assert!(matches!(err, Error::PipeListenerExists { ref address } if address == "svc"));

    let _client = dispatcher.create_user_space_pipe("svc").unwrap();
    assert_eq!(*accepted.borrow(), 1);

    assert!(dispatcher.unregister_pipe_factory("svc"));
    assert!(!dispatcher.unregister_pipe_factory("svc"));
    assert!(dispatcher.create_user_space_pipe("svc").is_err());
}

#[test]
fn registration_and_deferred_delete_work_on_the_running_thread() {
    let dispatcher = new_dispatcher();
    let log = Rc::new(RefCell::new(Vec::new()));
    // After the first run only this thread may touch the dispatcher.
    dispatcher.run(RunType::NonBlock).unwrap();
    assert!(dispatcher.is_thread_safe());

    dispatcher
        .register_pipe_factory(
            "late",
            Rc::new(|_: &Dispatcher, _socket: ConnectionSocket| {}),
        )
        .unwrap();
    dispatcher.deferred_delete(recorder("late", &log));
    dispatcher.run(RunType::NonBlock).unwrap();

    assert_eq!(*log.borrow(), vec!["late"]);
    assert!(dispatcher.unregister_pipe_factory("late"));
}

#[test]
fn pipe_buffer_high_watermark_is_configured() {
    init_tracing();
    let config = config::Config::builder()
        .set_override("worker.pipe_buffer_high_watermark", 4096)
        .unwrap()
        .build()
        .unwrap();

    let named = Dispatcher::new_named(&config, "worker", ConnectionIds::new()).unwrap();
    assert_eq!(named.name(), "worker");
    assert_eq!(named.pipe_buffer_high_watermark(), 4096);

    let unnamed = Dispatcher::new(&config).unwrap();
    assert_eq!(unnamed.pipe_buffer_high_watermark(), 0);
}

#[test]
fn connection_ids_are_shared_between_dispatchers() {
    init_tracing();
    let ids = ConnectionIds::new();
    let first = Dispatcher::new_named(&empty_config(), "first", ids.clone()).unwrap();
    let second = Dispatcher::new_named(&empty_config(), "second", ids).unwrap();

    let mut seen = vec![
        first.next_connection_id(),
        second.next_connection_id(),
        first.next_connection_id(),
        second.next_connection_id(),
    ];
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 4);
}
