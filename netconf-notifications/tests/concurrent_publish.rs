// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Append ordering under concurrent publishers: the log read back is a
//! permutation of the input whose per-thread subsequences keep their order.

use std::thread;

use netconf_notifications::{Delivery, Event, NotificationEngine};

const THREADS: usize = 4;
const PER_THREAD: usize = 50;

fn tagged(tag: &str, xml: &str) -> usize {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open).unwrap() + open.len();
    let end = xml.find(&close).unwrap();
    xml[start..end].parse().unwrap()
}

#[test]
fn test_concurrent_appends_keep_per_thread_order() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = NotificationEngine::with_dir(tmp.path()).unwrap();
    engine.create_stream("s", "ordered", true).unwrap();
    engine.allow_event("s", "e").unwrap();

    thread::scope(|scope| {
        for t in 0..THREADS {
            let engine = &engine;
            scope.spawn(move || {
                for i in 0..PER_THREAD {
                    engine
                        .publish(
                            Some(1),
                            &Event::Generic {
                                body: format!("<e><thread>{t}</thread><seq>{i}</seq></e>"),
                            },
                        )
                        .unwrap();
                }
            });
        }
    });

    let mut sub = engine.subscribe("s", Some(1), None).unwrap();
    let mut per_thread: Vec<Vec<usize>> = vec![Vec::new(); THREADS];
    let mut total = 0usize;
    loop {
        match sub.next().unwrap() {
            Delivery::Event { xml, .. } => {
                per_thread[tagged("thread", &xml)].push(tagged("seq", &xml));
                total += 1;
            }
            Delivery::ReplayComplete { .. } => break,
        }
    }

    assert_eq!(total, THREADS * PER_THREAD);
    let expected: Vec<usize> = (0..PER_THREAD).collect();
    for (t, seen) in per_thread.iter().enumerate() {
        assert_eq!(seen, &expected, "thread {t} records arrived out of order");
    }
}
